use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role within a notebook. Variant order is the permission order: owner > admin > reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Reader,
    Admin,
    Owner,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reader => "reader",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "reader" => Some(Self::Reader),
            "admin" => Some(Self::Admin),
            "owner" => Some(Self::Owner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notebook {
    pub id: String,
    pub title: String,
    pub owner_id: String,
    pub is_shared: bool,
    pub share_code: Option<String>,
    pub order_index: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotebookMember {
    pub id: String,
    pub notebook_id: String,
    pub user_id: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub notebook_id: String,
    pub title: String,
    pub order_index: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFolder {
    pub id: String,
    pub note_id: String,
    pub title: String,
    pub order_index: i64,
    pub is_collapsed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub id: String,
    pub task_id: String,
    pub user_id: String,
    pub completed_at: DateTime<Utc>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub note_id: String,
    pub folder_id: Option<String>,
    pub title: String,
    pub order_index: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completions: Vec<Completion>,
}

impl Task {
    pub fn is_completed_by(&self, user_id: &str) -> bool {
        self.completions.iter().any(|entry| entry.user_id == user_id)
    }

    pub fn container(&self) -> Container {
        Container::Tasks {
            note_id: self.note_id.clone(),
            folder_id: self.folder_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub task_id: String,
    pub user_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub author_name: Option<String>,
    pub author_avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub avatar_url: Option<String>,
}

/// Per-task discussion counters kept alongside the tree for unread badges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentSummary {
    pub task_id: String,
    pub count: u32,
    pub latest_at: Option<DateTime<Utc>>,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl CommentSummary {
    pub fn has_unread(&self) -> bool {
        match (self.latest_at, self.last_read_at) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(latest), Some(read)) => latest > read,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForestRows {
    pub notebooks: Vec<Notebook>,
    pub members: Vec<NotebookMember>,
    pub notes: Vec<Note>,
    pub folders: Vec<TaskFolder>,
    pub tasks: Vec<Task>,
    pub comment_summaries: Vec<CommentSummary>,
}

/// An ordered sibling list sharing one `order_index` sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Container {
    Notebooks,
    #[serde(rename_all = "camelCase")]
    Notes { notebook_id: String },
    #[serde(rename_all = "camelCase")]
    Folders { note_id: String },
    #[serde(rename_all = "camelCase")]
    Tasks {
        note_id: String,
        folder_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Notebook,
    Note,
    Folder,
    Task,
}

impl EntityKind {
    pub fn table(self) -> &'static str {
        match self {
            Self::Notebook => "notebooks",
            Self::Note => "notes",
            Self::Folder => "task_folders",
            Self::Task => "tasks",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotebookPayload {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotePayload {
    pub notebook_id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFolderPayload {
    pub note_id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskPayload {
    pub note_id: String,
    pub folder_id: Option<String>,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderRequest {
    pub container: Container,
    pub from: usize,
    pub to: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DropTarget {
    #[serde(rename_all = "camelCase")]
    Container {
        note_id: String,
        folder_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Item { task_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveTaskRequest {
    pub task_id: String,
    pub target: DropTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CommentEvent {
    Insert(Comment),
    #[serde(rename_all = "camelCase")]
    Delete { id: String, task_id: String },
}

impl CommentEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Insert(comment) => &comment.task_id,
            Self::Delete { task_id, .. } => task_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            message: message.into(),
        }
    }
}
