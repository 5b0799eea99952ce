pub mod comments;
pub mod completion;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod durable;
pub mod errors;
pub mod models;
pub mod ordering;
pub mod policy;
pub mod sharing;
pub mod store;
pub mod telemetry;

use crate::comments::CommentThread;
use crate::completion::Progress;
use crate::config::EngineConfig;
use crate::coordinator::MutationCoordinator;
use crate::db::Database;
use crate::durable::DurableStore;
use crate::errors::AppResult;
use crate::models::Notification;
use crate::store::{EntityStore, NotebookView};
use std::sync::Arc;
use tokio::sync::broadcast;

pub use crate::errors::AppError;

pub struct Engine {
    config: EngineConfig,
    database: Arc<Database>,
    durable: Arc<dyn DurableStore>,
    store: EntityStore,
    notifications: broadcast::Sender<Notification>,
    coordinator: MutationCoordinator,
}

impl Engine {
    /// Opens the database and loads the forest. A failed first fetch leaves an empty forest.
    pub async fn start(config: EngineConfig, user_id: &str) -> AppResult<Self> {
        if let Some(log_dir) = &config.log_dir {
            telemetry::init_tracing(log_dir, &config.log_filter)?;
        }
        let database = Arc::new(Database::new(&config.database_path, config.comment_feed_capacity)?);
        tracing::info!(
            user_id,
            db_path = %database.path().display(),
            "starting notebook engine"
        );
        Ok(Self::with_store(config, database, user_id).await)
    }

    /// Same as `start` but on an already opened database, shared between several users.
    pub async fn with_store(config: EngineConfig, database: Arc<Database>, user_id: &str) -> Self {
        let durable: Arc<dyn DurableStore> = Arc::new(database.session(user_id));
        let store = EntityStore::new();
        let (notifications, _) = broadcast::channel(config.notification_capacity.max(1));
        let coordinator = MutationCoordinator::new(
            store.clone(),
            Arc::clone(&durable),
            notifications.clone(),
            config.refetch_on_settle,
        );
        coordinator.start().await;

        Self {
            config,
            database,
            durable,
            store,
            notifications,
            coordinator,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn views(&self) -> Vec<NotebookView> {
        self.store.snapshot().views(self.coordinator.viewer_id())
    }

    pub fn note_progress(&self, note_id: &str) -> Progress {
        completion::note_progress(&self.store.snapshot(), note_id, self.coordinator.viewer_id())
    }

    pub fn notebook_progress(&self, notebook_id: &str) -> Progress {
        completion::notebook_progress(&self.store.snapshot(), notebook_id, self.coordinator.viewer_id())
    }

    pub fn group_progress(&self, notebook_id: &str) -> Progress {
        completion::group_progress(&self.store.snapshot(), notebook_id)
    }

    pub async fn open_thread(&self, task_id: &str) -> AppResult<CommentThread> {
        CommentThread::open(
            Arc::clone(&self.durable),
            self.store.clone(),
            self.notifications.clone(),
            task_id,
        )
        .await
    }
}
