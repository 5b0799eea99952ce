use crate::models::{
    CommentSummary, Completion, Container, EntityKind, ForestRows, Note, Notebook, NotebookMember, Role,
    Task, TaskFolder,
};
use crate::policy::resolve_role;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    UpsertNotebook(Notebook),
    RemoveNotebook { id: String },
    UpsertMember(NotebookMember),
    RemoveMember { notebook_id: String, user_id: String },
    UpsertNote(Note),
    RemoveNote { id: String },
    UpsertFolder(TaskFolder),
    RemoveFolder { id: String },
    UpsertTask(Task),
    RemoveTask { id: String },
    SetOrderIndex { kind: EntityKind, id: String, order_index: i64 },
    SetTaskFolder { task_id: String, folder_id: Option<String>, order_index: i64 },
    AddCompletion(Completion),
    RemoveCompletion { task_id: String, user_id: String },
    SetCommentSummary(CommentSummary),
}

/// Sibling sort key. Lower index first; equal indices put the most recently created first.
pub trait Ordered {
    fn order_index(&self) -> i64;
    fn created_at(&self) -> DateTime<Utc>;
    fn id(&self) -> &str;
}

macro_rules! impl_ordered {
    ($($ty:ty),*) => {
        $(impl Ordered for $ty {
            fn order_index(&self) -> i64 {
                self.order_index
            }
            fn created_at(&self) -> DateTime<Utc> {
                self.created_at
            }
            fn id(&self) -> &str {
                &self.id
            }
        })*
    };
}

impl_ordered!(Notebook, Note, TaskFolder, Task);

pub fn sibling_cmp<T: Ordered>(a: &T, b: &T) -> Ordering {
    a.order_index()
        .cmp(&b.order_index())
        .then_with(|| b.created_at().cmp(&a.created_at()))
        .then_with(|| a.id().cmp(b.id()))
}

fn sorted<'a, T: Ordered + 'a>(items: impl IntoIterator<Item = &'a Arc<T>>) -> Vec<Arc<T>> {
    let mut items = items.into_iter().cloned().collect::<Vec<_>>();
    items.sort_by(|a, b| sibling_cmp(a.as_ref(), b.as_ref()));
    items
}

#[derive(Debug, Clone, Default)]
pub struct Forest {
    notebooks: HashMap<String, Arc<Notebook>>,
    members: HashMap<String, Arc<Vec<NotebookMember>>>,
    notes: HashMap<String, Arc<Note>>,
    folders: HashMap<String, Arc<TaskFolder>>,
    tasks: HashMap<String, Arc<Task>>,
    comment_summaries: HashMap<String, Arc<CommentSummary>>,
    notes_by_notebook: HashMap<String, Vec<String>>,
    folders_by_note: HashMap<String, Vec<String>>,
    tasks_by_note: HashMap<String, Vec<String>>,
}

impl Forest {
    pub fn from_rows(rows: ForestRows) -> Self {
        let mut forest = Self::default();
        for notebook in rows.notebooks {
            forest.apply_in_place(Patch::UpsertNotebook(notebook));
        }
        for member in rows.members {
            forest.apply_in_place(Patch::UpsertMember(member));
        }
        for note in rows.notes {
            forest.apply_in_place(Patch::UpsertNote(note));
        }
        for folder in rows.folders {
            forest.apply_in_place(Patch::UpsertFolder(folder));
        }
        for task in rows.tasks {
            forest.apply_in_place(Patch::UpsertTask(task));
        }
        for summary in rows.comment_summaries {
            forest.apply_in_place(Patch::SetCommentSummary(summary));
        }
        forest
    }

    pub fn is_empty(&self) -> bool {
        self.notebooks.is_empty()
    }

    pub fn apply(&self, patch: &Patch) -> Self {
        let mut next = self.clone();
        next.apply_in_place(patch.clone());
        next
    }

    pub fn apply_all(&self, patches: &[Patch]) -> Self {
        let mut next = self.clone();
        for patch in patches {
            next.apply_in_place(patch.clone());
        }
        next
    }

    fn apply_in_place(&mut self, patch: Patch) {
        match patch {
            Patch::UpsertNotebook(notebook) => {
                self.notebooks.insert(notebook.id.clone(), Arc::new(notebook));
            }
            Patch::RemoveNotebook { id } => self.remove_notebook(&id),
            Patch::UpsertMember(member) => {
                let rows = self.members.entry(member.notebook_id.clone()).or_default();
                let rows = Arc::make_mut(rows);
                rows.retain(|existing| existing.user_id != member.user_id);
                rows.push(member);
            }
            Patch::RemoveMember { notebook_id, user_id } => {
                if let Some(rows) = self.members.get_mut(&notebook_id) {
                    if rows.iter().any(|member| member.user_id == user_id) {
                        Arc::make_mut(rows).retain(|member| member.user_id != user_id);
                    }
                }
            }
            Patch::UpsertNote(note) => {
                if let Some(previous) = self.notes.get(&note.id) {
                    if previous.notebook_id != note.notebook_id {
                        let old_parent = previous.notebook_id.clone();
                        detach(&mut self.notes_by_notebook, &old_parent, &note.id);
                    }
                }
                attach(&mut self.notes_by_notebook, &note.notebook_id, &note.id);
                self.notes.insert(note.id.clone(), Arc::new(note));
            }
            Patch::RemoveNote { id } => self.remove_note(&id),
            Patch::UpsertFolder(folder) => {
                if let Some(previous) = self.folders.get(&folder.id) {
                    if previous.note_id != folder.note_id {
                        let old_parent = previous.note_id.clone();
                        detach(&mut self.folders_by_note, &old_parent, &folder.id);
                    }
                }
                attach(&mut self.folders_by_note, &folder.note_id, &folder.id);
                self.folders.insert(folder.id.clone(), Arc::new(folder));
            }
            Patch::RemoveFolder { id } => self.remove_folder(&id),
            Patch::UpsertTask(task) => {
                if let Some(previous) = self.tasks.get(&task.id) {
                    if previous.note_id != task.note_id {
                        let old_parent = previous.note_id.clone();
                        detach(&mut self.tasks_by_note, &old_parent, &task.id);
                    }
                }
                attach(&mut self.tasks_by_note, &task.note_id, &task.id);
                self.tasks.insert(task.id.clone(), Arc::new(task));
            }
            Patch::RemoveTask { id } => self.remove_task(&id),
            Patch::SetOrderIndex { kind, id, order_index } => match kind {
                EntityKind::Notebook => {
                    if let Some(entry) = self.notebooks.get_mut(&id) {
                        Arc::make_mut(entry).order_index = order_index;
                    }
                }
                EntityKind::Note => {
                    if let Some(entry) = self.notes.get_mut(&id) {
                        Arc::make_mut(entry).order_index = order_index;
                    }
                }
                EntityKind::Folder => {
                    if let Some(entry) = self.folders.get_mut(&id) {
                        Arc::make_mut(entry).order_index = order_index;
                    }
                }
                EntityKind::Task => {
                    if let Some(entry) = self.tasks.get_mut(&id) {
                        Arc::make_mut(entry).order_index = order_index;
                    }
                }
            },
            Patch::SetTaskFolder {
                task_id,
                folder_id,
                order_index,
            } => {
                if let Some(entry) = self.tasks.get_mut(&task_id) {
                    let task = Arc::make_mut(entry);
                    task.folder_id = folder_id;
                    task.order_index = order_index;
                }
            }
            Patch::AddCompletion(completion) => {
                if let Some(entry) = self.tasks.get_mut(&completion.task_id) {
                    let task = Arc::make_mut(entry);
                    task.completions.retain(|existing| existing.user_id != completion.user_id);
                    task.completions.push(completion);
                }
            }
            Patch::RemoveCompletion { task_id, user_id } => {
                if let Some(entry) = self.tasks.get_mut(&task_id) {
                    if entry.is_completed_by(&user_id) {
                        Arc::make_mut(entry)
                            .completions
                            .retain(|existing| existing.user_id != user_id);
                    }
                }
            }
            Patch::SetCommentSummary(summary) => {
                if self.tasks.contains_key(&summary.task_id) {
                    self.comment_summaries
                        .insert(summary.task_id.clone(), Arc::new(summary));
                }
            }
        }
    }

    fn remove_notebook(&mut self, id: &str) {
        self.notebooks.remove(id);
        self.members.remove(id);
        for note_id in self.notes_by_notebook.remove(id).unwrap_or_default() {
            self.remove_note(&note_id);
        }
    }

    fn remove_note(&mut self, id: &str) {
        if let Some(note) = self.notes.remove(id) {
            detach(&mut self.notes_by_notebook, &note.notebook_id, id);
        }
        for folder_id in self.folders_by_note.remove(id).unwrap_or_default() {
            self.folders.remove(&folder_id);
        }
        for task_id in self.tasks_by_note.remove(id).unwrap_or_default() {
            self.tasks.remove(&task_id);
            self.comment_summaries.remove(&task_id);
        }
    }

    fn remove_folder(&mut self, id: &str) {
        let Some(folder) = self.folders.remove(id) else {
            return;
        };
        detach(&mut self.folders_by_note, &folder.note_id, id);
        let task_ids = self.tasks_by_note.get(&folder.note_id).cloned().unwrap_or_default();
        for task_id in task_ids {
            if let Some(entry) = self.tasks.get_mut(&task_id) {
                if entry.folder_id.as_deref() == Some(id) {
                    Arc::make_mut(entry).folder_id = None;
                }
            }
        }
    }

    fn remove_task(&mut self, id: &str) {
        if let Some(task) = self.tasks.remove(id) {
            detach(&mut self.tasks_by_note, &task.note_id, id);
        }
        self.comment_summaries.remove(id);
    }

    pub fn notebook(&self, id: &str) -> Option<&Arc<Notebook>> {
        self.notebooks.get(id)
    }

    pub fn note(&self, id: &str) -> Option<&Arc<Note>> {
        self.notes.get(id)
    }

    pub fn folder(&self, id: &str) -> Option<&Arc<TaskFolder>> {
        self.folders.get(id)
    }

    pub fn task(&self, id: &str) -> Option<&Arc<Task>> {
        self.tasks.get(id)
    }

    pub fn members(&self, notebook_id: &str) -> &[NotebookMember] {
        self.members
            .get(notebook_id)
            .map(|rows| rows.as_slice())
            .unwrap_or_default()
    }

    pub fn comment_summary(&self, task_id: &str) -> Option<&Arc<CommentSummary>> {
        self.comment_summaries.get(task_id)
    }

    pub fn notebook_id_of(&self, kind: EntityKind, id: &str) -> Option<String> {
        match kind {
            EntityKind::Notebook => self.notebooks.get(id).map(|notebook| notebook.id.clone()),
            EntityKind::Note => self.notes.get(id).map(|note| note.notebook_id.clone()),
            EntityKind::Folder => {
                let folder = self.folders.get(id)?;
                self.notebook_id_of(EntityKind::Note, &folder.note_id)
            }
            EntityKind::Task => {
                let task = self.tasks.get(id)?;
                self.notebook_id_of(EntityKind::Note, &task.note_id)
            }
        }
    }

    pub fn role_of(&self, notebook_id: &str, viewer_id: &str) -> Option<Role> {
        let notebook = self.notebooks.get(notebook_id)?;
        resolve_role(notebook, self.members(notebook_id), viewer_id)
    }

    pub fn tasks_in_note(&self, note_id: &str) -> Vec<&Arc<Task>> {
        self.tasks_by_note
            .get(note_id)
            .map(|ids| ids.iter().filter_map(|id| self.tasks.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn tasks_in_notebook(&self, notebook_id: &str) -> Vec<&Arc<Task>> {
        self.notes_by_notebook
            .get(notebook_id)
            .map(|note_ids| {
                note_ids
                    .iter()
                    .flat_map(|note_id| self.tasks_in_note(note_id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn container_ids(&self, container: &Container) -> Vec<String> {
        match container {
            Container::Notebooks => ids_of(sorted(self.notebooks.values())),
            Container::Notes { notebook_id } => ids_of(sorted(
                self.notes_by_notebook
                    .get(notebook_id)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| self.notes.get(id)),
            )),
            Container::Folders { note_id } => ids_of(sorted(
                self.folders_by_note
                    .get(note_id)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| self.folders.get(id)),
            )),
            Container::Tasks { note_id, folder_id } => ids_of(sorted(
                self.tasks_in_note(note_id)
                    .into_iter()
                    .filter(|task| task.folder_id == *folder_id),
            )),
        }
    }

    pub fn order_index_of(&self, kind: EntityKind, id: &str) -> Option<i64> {
        match kind {
            EntityKind::Notebook => self.notebooks.get(id).map(|entry| entry.order_index),
            EntityKind::Note => self.notes.get(id).map(|entry| entry.order_index),
            EntityKind::Folder => self.folders.get(id).map(|entry| entry.order_index),
            EntityKind::Task => self.tasks.get(id).map(|entry| entry.order_index),
        }
    }

    pub fn views(&self, viewer_id: &str) -> Vec<NotebookView> {
        sorted(self.notebooks.values())
            .into_iter()
            .map(|notebook| self.notebook_view(notebook, viewer_id))
            .collect()
    }

    fn notebook_view(&self, notebook: Arc<Notebook>, viewer_id: &str) -> NotebookView {
        let notes = sorted(
            self.notes_by_notebook
                .get(&notebook.id)
                .into_iter()
                .flatten()
                .filter_map(|id| self.notes.get(id)),
        )
        .into_iter()
        .map(|note| self.note_view(note))
        .collect();

        NotebookView {
            role: self.role_of(&notebook.id, viewer_id),
            members: self.members(&notebook.id).to_vec(),
            notebook,
            notes,
        }
    }

    fn note_view(&self, note: Arc<Note>) -> NoteView {
        let tasks = self.tasks_in_note(&note.id);
        let root_tasks = sorted(tasks.iter().copied().filter(|task| task.folder_id.is_none()))
            .into_iter()
            .map(|task| self.task_view(task))
            .collect();
        let folders = sorted(
            self.folders_by_note
                .get(&note.id)
                .into_iter()
                .flatten()
                .filter_map(|id| self.folders.get(id)),
        )
        .into_iter()
        .map(|folder| {
            let tasks = sorted(
                tasks
                    .iter()
                    .copied()
                    .filter(|task| task.folder_id.as_deref() == Some(folder.id.as_str())),
            )
            .into_iter()
            .map(|task| self.task_view(task))
            .collect();
            FolderView { folder, tasks }
        })
        .collect();

        NoteView {
            note,
            root_tasks,
            folders,
        }
    }

    fn task_view(&self, task: Arc<Task>) -> TaskView {
        let summary = self.comment_summaries.get(&task.id);
        TaskView {
            comment_count: summary.map(|entry| entry.count).unwrap_or(0),
            has_unread: summary.map(|entry| entry.has_unread()).unwrap_or(false),
            task,
        }
    }
}

fn attach(index: &mut HashMap<String, Vec<String>>, parent: &str, id: &str) {
    let children = index.entry(parent.to_string()).or_default();
    if !children.iter().any(|existing| existing == id) {
        children.push(id.to_string());
    }
}

fn detach(index: &mut HashMap<String, Vec<String>>, parent: &str, id: &str) {
    if let Some(children) = index.get_mut(parent) {
        children.retain(|existing| existing != id);
    }
}

fn ids_of<T: Ordered>(items: Vec<Arc<T>>) -> Vec<String> {
    items.iter().map(|item| item.id().to_string()).collect()
}

#[derive(Debug, Clone)]
pub struct NotebookView {
    pub notebook: Arc<Notebook>,
    pub role: Option<Role>,
    pub members: Vec<NotebookMember>,
    pub notes: Vec<NoteView>,
}

#[derive(Debug, Clone)]
pub struct NoteView {
    pub note: Arc<Note>,
    pub root_tasks: Vec<TaskView>,
    pub folders: Vec<FolderView>,
}

#[derive(Debug, Clone)]
pub struct FolderView {
    pub folder: Arc<TaskFolder>,
    pub tasks: Vec<TaskView>,
}

#[derive(Debug, Clone)]
pub struct TaskView {
    pub task: Arc<Task>,
    pub comment_count: u32,
    pub has_unread: bool,
}

#[derive(Clone)]
pub struct EntityStore {
    sender: Arc<watch::Sender<Arc<Forest>>>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(Arc::new(Forest::default()));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn snapshot(&self) -> Arc<Forest> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Forest>> {
        self.sender.subscribe()
    }

    pub fn apply(&self, patches: &[Patch]) {
        if patches.is_empty() {
            return;
        }
        self.sender.send_modify(|current| {
            *current = Arc::new(current.apply_all(patches));
        });
    }

    pub fn restore(&self, snapshot: Arc<Forest>) {
        self.sender.send_replace(snapshot);
    }

    /// Wholesale replacement from a durable fetch; the latest call wins.
    pub fn replace(&self, rows: ForestRows) {
        self.sender.send_replace(Arc::new(Forest::from_rows(rows)));
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::models::{Completion, ForestRows, Note, Notebook, NotebookMember, Role, Task, TaskFolder};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    pub fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().expect("valid timestamp") + Duration::seconds(seconds)
    }

    pub fn notebook(id: &str, owner: &str, order_index: i64) -> Notebook {
        Notebook {
            id: id.to_string(),
            title: format!("Notebook {id}"),
            owner_id: owner.to_string(),
            is_shared: false,
            share_code: None,
            order_index,
            created_at: at(0),
        }
    }

    pub fn member(notebook_id: &str, user: &str, role: Role) -> NotebookMember {
        NotebookMember {
            id: format!("{notebook_id}-{user}"),
            notebook_id: notebook_id.to_string(),
            user_id: user.to_string(),
            role,
            joined_at: at(0),
            name: Some(user.to_string()),
            avatar_url: None,
        }
    }

    pub fn note(id: &str, notebook_id: &str, order_index: i64) -> Note {
        Note {
            id: id.to_string(),
            notebook_id: notebook_id.to_string(),
            title: format!("Note {id}"),
            order_index,
            created_at: at(1),
        }
    }

    pub fn folder(id: &str, note_id: &str, order_index: i64) -> TaskFolder {
        TaskFolder {
            id: id.to_string(),
            note_id: note_id.to_string(),
            title: format!("Folder {id}"),
            order_index,
            is_collapsed: false,
            created_at: at(2),
        }
    }

    pub fn task(id: &str, note_id: &str, folder_id: Option<&str>, order_index: i64) -> Task {
        Task {
            id: id.to_string(),
            note_id: note_id.to_string(),
            folder_id: folder_id.map(ToString::to_string),
            title: id.to_string(),
            order_index,
            created_at: at(3),
            completions: Vec::new(),
        }
    }

    pub fn completion(task_id: &str, user: &str) -> Completion {
        Completion {
            id: format!("{task_id}-{user}"),
            task_id: task_id.to_string(),
            user_id: user.to_string(),
            completed_at: at(10),
            name: Some(user.to_string()),
            avatar_url: None,
        }
    }

    /// One notebook `nb` owned by alice with note `n1`: root tasks A,B,C and folder F holding X,Y.
    pub fn sample_rows() -> ForestRows {
        ForestRows {
            notebooks: vec![notebook("nb", "alice", 0)],
            members: vec![member("nb", "bob", Role::Reader)],
            notes: vec![note("n1", "nb", 0)],
            folders: vec![folder("F", "n1", 0)],
            tasks: vec![
                task("A", "n1", None, 0),
                task("B", "n1", None, 1),
                task("C", "n1", None, 2),
                task("X", "n1", Some("F"), 0),
                task("Y", "n1", Some("F"), 1),
            ],
            comment_summaries: Vec::new(),
        }
    }
}
