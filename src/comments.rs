use crate::durable::{CommentFeed, DurableStore, FeedMessage};
use crate::errors::{AppError, AppResult};
use crate::models::{Comment, CommentEvent, CommentSummary, Notification, Profile};
use crate::store::{EntityStore, Patch};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

const TEMP_PREFIX: &str = "temp-";

pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_PREFIX)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadState {
    pub comments: Vec<Comment>,
    pub draft: String,
}

impl ThreadState {
    pub fn contains(&self, id: &str) -> bool {
        self.comments.iter().any(|comment| comment.id == id)
    }

    /// Inserting a held id or deleting an absent one changes nothing.
    pub fn apply_event(&mut self, event: &CommentEvent) -> bool {
        match event {
            CommentEvent::Insert(comment) => {
                if self.contains(&comment.id) {
                    return false;
                }
                let position = self
                    .comments
                    .iter()
                    .position(|existing| existing.created_at > comment.created_at)
                    .unwrap_or(self.comments.len());
                self.comments.insert(position, comment.clone());
                true
            }
            CommentEvent::Delete { id, .. } => {
                let before = self.comments.len();
                self.comments.retain(|existing| existing.id != *id);
                self.comments.len() != before
            }
        }
    }

    /// Swaps the optimistic entry for the durable record unless the echo already delivered it.
    pub fn settle_send(&mut self, temp_id: &str, comment: Comment) {
        if self.contains(&comment.id) {
            self.comments.retain(|existing| existing.id != temp_id);
        } else if let Some(slot) = self.comments.iter_mut().find(|existing| existing.id == temp_id) {
            *slot = comment;
        } else {
            self.apply_event(&CommentEvent::Insert(comment));
        }
    }

    pub fn merge_history(&mut self, history: Vec<Comment>) {
        let pending = self
            .comments
            .drain(..)
            .filter(|comment| is_temporary_id(&comment.id))
            .collect::<Vec<_>>();
        self.comments = history;
        for comment in pending {
            self.apply_event(&CommentEvent::Insert(comment));
        }
    }

    fn durable_comments(&self) -> impl Iterator<Item = &Comment> {
        self.comments.iter().filter(|comment| !is_temporary_id(&comment.id))
    }
}

#[derive(Clone)]
struct ThreadContext {
    task_id: String,
    durable: Arc<dyn DurableStore>,
    store: EntityStore,
    state: Arc<watch::Sender<ThreadState>>,
    notifications: broadcast::Sender<Notification>,
    opened_at: DateTime<Utc>,
}

impl ThreadContext {
    fn merge(&self, event: &CommentEvent) -> bool {
        let changed = self.state.send_if_modified(|state| state.apply_event(event));
        if changed {
            self.publish_summary(None);
        } else {
            tracing::debug!(task_id = %self.task_id, "ignored duplicate comment event");
        }
        changed
    }

    async fn receive_insert(&self, comment: Comment) {
        let held = self.state.borrow().contains(&comment.id);
        if held {
            tracing::debug!(task_id = %self.task_id, comment_id = %comment.id, "comment already held");
            return;
        }
        let comment = self.with_author(comment).await;
        // the lookup may have raced with our own send settling
        if self.merge(&CommentEvent::Insert(comment)) {
            self.mark_seen().await;
        }
    }

    async fn with_author(&self, mut comment: Comment) -> Comment {
        if comment.author_name.is_some() {
            return comment;
        }
        match self.durable.get_profile(&comment.user_id).await {
            Ok(Some(profile)) => {
                comment.author_name = Some(profile.name);
                comment.author_avatar_url = profile.avatar_url;
            }
            Ok(None) => {}
            Err(error) => {
                tracing::debug!(user_id = %comment.user_id, error = %error, "author lookup failed");
            }
        }
        comment
    }

    async fn resync(&self) {
        match self.durable.list_comments(&self.task_id).await {
            Ok(history) => {
                self.state.send_modify(|state| state.merge_history(history));
                self.mark_seen().await;
            }
            Err(error) => {
                tracing::warn!(task_id = %self.task_id, error = %error, "comment resync failed");
            }
        }
    }

    /// An open thread counts as read.
    fn publish_summary(&self, read_at: Option<DateTime<Utc>>) {
        let (count, latest_at) = {
            let state = self.state.borrow();
            let count = state.durable_comments().count() as u32;
            let latest_at = state.durable_comments().map(|comment| comment.created_at).max();
            (count, latest_at)
        };
        let read_marker = read_at.unwrap_or(self.opened_at);
        let last_read_at = Some(latest_at.map_or(read_marker, |latest| latest.max(read_marker)));
        self.store.apply(&[Patch::SetCommentSummary(CommentSummary {
            task_id: self.task_id.clone(),
            count,
            latest_at,
            last_read_at,
        })]);
    }

    /// Moves the stored read marker up to the newest comment the open thread shows, so a
    /// refetch of the forest agrees with it.
    async fn mark_seen(&self) {
        let latest = self.state.borrow().durable_comments().map(|comment| comment.created_at).max();
        match latest {
            Some(latest) => self.mark_read(latest.max(self.opened_at)).await,
            None => self.publish_summary(None),
        }
    }

    async fn mark_read(&self, at: DateTime<Utc>) {
        if let Err(error) = self.durable.mark_read(&self.task_id, at).await {
            tracing::warn!(task_id = %self.task_id, error = %error, "failed to store read marker");
        }
        self.publish_summary(Some(at));
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notifications.send(notification);
    }
}

async fn listen(context: ThreadContext, mut feed: CommentFeed, closed: Arc<Notify>) {
    loop {
        tokio::select! {
            biased;
            _ = closed.notified() => break,
            message = feed.next() => match message {
                None => break,
                Some(FeedMessage::Lagged(skipped)) => {
                    tracing::warn!(task_id = %context.task_id, skipped, "comment feed lagged; resyncing");
                    context.resync().await;
                }
                Some(FeedMessage::Event(CommentEvent::Insert(comment))) => context.receive_insert(comment).await,
                Some(FeedMessage::Event(event)) => {
                    context.merge(&event);
                }
            },
        }
    }
    tracing::debug!(task_id = %context.task_id, "comment listener stopped");
}

pub struct CommentThread {
    context: ThreadContext,
    viewer: Option<Profile>,
    closed: Arc<Notify>,
    listener: Option<JoinHandle<()>>,
}

impl CommentThread {
    /// Subscribes before fetching history so nothing posted in between is lost.
    pub async fn open(
        durable: Arc<dyn DurableStore>,
        store: EntityStore,
        notifications: broadcast::Sender<Notification>,
        task_id: &str,
    ) -> AppResult<Self> {
        let feed = durable.subscribe_comments(task_id);
        let history = match durable.list_comments(task_id).await {
            Ok(history) => history,
            Err(error) => {
                tracing::warn!(task_id, error = %error, "failed to load comments");
                let _ = notifications.send(Notification::error(format!("Could not load comments: {error}")));
                return Err(error);
            }
        };
        let viewer = durable.get_profile(durable.user_id()).await.unwrap_or_default();

        let (state, _) = watch::channel(ThreadState {
            comments: history,
            draft: String::new(),
        });
        let context = ThreadContext {
            task_id: task_id.to_string(),
            durable,
            store,
            state: Arc::new(state),
            notifications,
            opened_at: Utc::now(),
        };
        context.mark_read(context.opened_at).await;

        let closed = Arc::new(Notify::new());
        let listener = tokio::spawn(listen(context.clone(), feed, Arc::clone(&closed)));
        Ok(Self {
            context,
            viewer,
            closed,
            listener: Some(listener),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.context.task_id
    }

    pub fn snapshot(&self) -> ThreadState {
        self.context.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ThreadState> {
        self.context.state.subscribe()
    }

    pub fn set_draft(&self, text: &str) {
        self.context.state.send_modify(|state| state.draft = text.to_string());
    }

    pub async fn send(&self, content: &str) -> AppResult<Comment> {
        if content.trim().is_empty() {
            return Err(AppError::Validation("Comment cannot be empty".to_string()));
        }
        let temp_id = format!("{TEMP_PREFIX}{}", Uuid::new_v4());
        let optimistic = Comment {
            id: temp_id.clone(),
            task_id: self.context.task_id.clone(),
            user_id: self.context.durable.user_id().to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            author_name: self.viewer.as_ref().map(|profile| profile.name.clone()),
            author_avatar_url: self.viewer.as_ref().and_then(|profile| profile.avatar_url.clone()),
        };
        self.context.state.send_modify(|state| {
            state.apply_event(&CommentEvent::Insert(optimistic));
            state.draft.clear();
        });

        match self.context.durable.insert_comment(&self.context.task_id, content).await {
            Ok(comment) => {
                let settled = comment.clone();
                self.context
                    .state
                    .send_modify(|state| state.settle_send(&temp_id, settled));
                self.context.mark_seen().await;
                Ok(comment)
            }
            Err(error) => {
                tracing::warn!(task_id = %self.context.task_id, error = %error, "comment send failed");
                self.context.state.send_modify(|state| {
                    state.comments.retain(|existing| existing.id != temp_id);
                    state.draft = content.to_string();
                });
                self.context
                    .notify(Notification::error(format!("Could not send comment: {error}")));
                Err(error)
            }
        }
    }

    pub async fn delete(&self, comment_id: &str) -> AppResult<()> {
        match self.context.durable.delete_comment(comment_id).await {
            Ok(()) => {
                self.context.merge(&CommentEvent::Delete {
                    id: comment_id.to_string(),
                    task_id: self.context.task_id.clone(),
                });
                Ok(())
            }
            Err(error) => {
                tracing::warn!(comment_id, error = %error, "comment delete failed");
                self.context
                    .notify(Notification::error(format!("Could not delete comment: {error}")));
                Err(error)
            }
        }
    }

    /// Writes already issued still land.
    pub async fn close(mut self) {
        self.closed.notify_one();
        if let Some(listener) = self.listener.take() {
            if let Err(error) = listener.await {
                tracing::warn!(task_id = %self.context.task_id, error = %error, "comment listener panicked");
            }
        }
        self.context.mark_read(Utc::now()).await;
    }
}

impl Drop for CommentThread {
    fn drop(&mut self) {
        self.closed.notify_one();
    }
}
