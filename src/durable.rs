use crate::errors::AppResult;
use crate::models::{
    Comment, CommentEvent, Completion, EntityKind, ForestRows, Note, Notebook, NotebookMember, Profile, Role,
    Task, TaskFolder,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

#[async_trait]
pub trait DurableStore: Send + Sync {
    fn user_id(&self) -> &str;

    async fn fetch_forest(&self) -> AppResult<ForestRows>;

    async fn create_notebook(&self, title: &str) -> AppResult<Notebook>;
    async fn rename_notebook(&self, notebook_id: &str, title: &str) -> AppResult<Notebook>;
    async fn delete_notebook(&self, notebook_id: &str) -> AppResult<()>;

    async fn create_note(&self, notebook_id: &str, title: &str) -> AppResult<Note>;
    async fn rename_note(&self, note_id: &str, title: &str) -> AppResult<Note>;
    async fn delete_note(&self, note_id: &str) -> AppResult<()>;

    async fn create_folder(&self, note_id: &str, title: &str) -> AppResult<TaskFolder>;
    async fn rename_folder(&self, folder_id: &str, title: &str) -> AppResult<TaskFolder>;
    async fn set_folder_collapsed(&self, folder_id: &str, collapsed: bool) -> AppResult<TaskFolder>;
    async fn delete_folder(&self, folder_id: &str) -> AppResult<()>;

    async fn create_task(&self, note_id: &str, folder_id: Option<&str>, title: &str) -> AppResult<Task>;
    async fn rename_task(&self, task_id: &str, title: &str) -> AppResult<Task>;
    async fn delete_task(&self, task_id: &str) -> AppResult<()>;

    async fn update_order_indices(&self, kind: EntityKind, updates: &[(String, i64)]) -> AppResult<()>;
    async fn reorder_notes(&self, notebook_id: &str, ordered_note_ids: &[String]) -> AppResult<()>;
    async fn reorder_tasks(&self, ordered_task_ids: &[String]) -> AppResult<()>;
    async fn move_task(&self, task_id: &str, folder_id: Option<&str>, order_index: i64) -> AppResult<()>;

    async fn insert_completion(&self, task_id: &str) -> AppResult<Completion>;
    async fn delete_completion(&self, task_id: &str) -> AppResult<()>;

    async fn generate_share_code(&self, notebook_id: &str) -> AppResult<String>;
    async fn revoke_share_code(&self, notebook_id: &str) -> AppResult<()>;
    async fn set_notebook_shared(&self, notebook_id: &str, shared: bool) -> AppResult<Notebook>;
    async fn join_by_share_code(&self, code: &str) -> AppResult<NotebookMember>;

    async fn list_members(&self, notebook_id: &str) -> AppResult<Vec<NotebookMember>>;
    async fn set_member_role(&self, notebook_id: &str, user_id: &str, role: Role) -> AppResult<NotebookMember>;
    async fn remove_member(&self, notebook_id: &str, user_id: &str) -> AppResult<()>;

    async fn list_comments(&self, task_id: &str) -> AppResult<Vec<Comment>>;
    async fn insert_comment(&self, task_id: &str, content: &str) -> AppResult<Comment>;
    async fn delete_comment(&self, comment_id: &str) -> AppResult<()>;
    async fn get_profile(&self, user_id: &str) -> AppResult<Option<Profile>>;
    async fn last_read_at(&self, task_id: &str) -> AppResult<Option<DateTime<Utc>>>;
    async fn mark_read(&self, task_id: &str, at: DateTime<Utc>) -> AppResult<()>;

    /// Push feed of comment inserts and deletes for one task.
    fn subscribe_comments(&self, task_id: &str) -> CommentFeed;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    Event(CommentEvent),
    Lagged(u64),
}

/// Table-wide broadcast receiver narrowed to one task id.
pub struct CommentFeed {
    task_id: String,
    receiver: broadcast::Receiver<CommentEvent>,
}

impl CommentFeed {
    pub fn new(task_id: &str, receiver: broadcast::Receiver<CommentEvent>) -> Self {
        Self {
            task_id: task_id.to_string(),
            receiver,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn next(&mut self) -> Option<FeedMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.task_id() == self.task_id => return Some(FeedMessage::Event(event)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => return Some(FeedMessage::Lagged(skipped)),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
