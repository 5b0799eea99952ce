use crate::completion::{toggle_action, ToggleAction};
use crate::durable::DurableStore;
use crate::errors::{AppError, AppResult};
use crate::models::{
    Container, CreateFolderPayload, CreateNotePayload, CreateNotebookPayload, CreateTaskPayload, EntityKind,
    MoveTaskRequest, Note, Notebook, NotebookMember, Notification, ReorderRequest, Role, Task, TaskFolder,
};
use crate::ordering::{assign_indices, plan_move, plan_reorder, MovePlan, ReorderPlan};
use crate::policy::{capabilities, require, Capabilities, Capability};
use crate::store::{EntityStore, Forest, Patch};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum DurableWrite {
    ReorderNotes { notebook_id: String, ordered_ids: Vec<String> },
    ReorderTasks { ordered_ids: Vec<String> },
    UpdateOrderIndices { kind: EntityKind, updates: Vec<(String, i64)> },
    MoveTask { task_id: String, folder_id: Option<String>, order_index: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticCommand {
    pub label: &'static str,
    pub patches: Vec<Patch>,
    pub writes: Vec<DurableWrite>,
}

impl OptimisticCommand {
    fn from_reorder(plan: ReorderPlan) -> Self {
        let write = match &plan.container {
            Container::Notes { notebook_id } => DurableWrite::ReorderNotes {
                notebook_id: notebook_id.clone(),
                ordered_ids: plan.ordered_ids.clone(),
            },
            Container::Tasks { .. } => DurableWrite::ReorderTasks {
                ordered_ids: plan.ordered_ids.clone(),
            },
            Container::Notebooks | Container::Folders { .. } => DurableWrite::UpdateOrderIndices {
                kind: plan.kind,
                updates: assign_indices(&plan.ordered_ids),
            },
        };
        Self {
            label: "reorder items",
            patches: plan.patches,
            writes: vec![write],
        }
    }
}

pub struct MutationCoordinator {
    viewer_id: String,
    store: EntityStore,
    durable: Arc<dyn DurableStore>,
    notifications: broadcast::Sender<Notification>,
    refetch_on_settle: bool,
}

impl MutationCoordinator {
    pub fn new(
        store: EntityStore,
        durable: Arc<dyn DurableStore>,
        notifications: broadcast::Sender<Notification>,
        refetch_on_settle: bool,
    ) -> Self {
        Self {
            viewer_id: durable.user_id().to_string(),
            store,
            durable,
            notifications,
            refetch_on_settle,
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn capabilities_in(&self, notebook_id: &str) -> Option<Capabilities> {
        self.store
            .snapshot()
            .role_of(notebook_id, &self.viewer_id)
            .map(capabilities)
    }

    // ─── Settlement ─────────────────────────────────────────────────────────

    /// Replaces the store with a fresh durable fetch. Latest completed fetch wins.
    pub async fn refetch(&self) -> AppResult<()> {
        match self.durable.fetch_forest().await {
            Ok(rows) => {
                self.store.replace(rows);
                Ok(())
            }
            Err(error) => {
                tracing::warn!(error = %error, "forest refetch failed");
                Err(error)
            }
        }
    }

    pub async fn start(&self) {
        if let Err(error) = self.refetch().await {
            self.store.replace(Default::default());
            self.notify(Notification::error(format!("Could not load notebooks: {error}")));
        }
    }

    /// Snapshot, apply, commit. A failed commit restores the snapshot verbatim, and either
    /// way the settle refetch runs last.
    pub async fn execute(&self, command: OptimisticCommand) -> AppResult<()> {
        let snapshot = self.store.snapshot();
        self.store.apply(&command.patches);

        let result = self.commit(&command.writes).await;
        match &result {
            Ok(()) => {}
            Err(AppError::NotFound(_)) => {
                // a collaborator deleted the target; the refetch below drops it
                tracing::debug!(op = command.label, "optimistic target vanished; rolling back");
                self.store.restore(snapshot);
            }
            Err(error) => {
                tracing::warn!(op = command.label, error = %error, "durable write failed; rolling back");
                self.store.restore(snapshot);
                self.notify(Notification::error(format!("Could not {}: {error}", command.label)));
            }
        }

        if self.refetch_on_settle {
            let _ = self.refetch().await;
        }
        result
    }

    async fn commit(&self, writes: &[DurableWrite]) -> AppResult<()> {
        for write in writes {
            match write {
                DurableWrite::ReorderNotes {
                    notebook_id,
                    ordered_ids,
                } => self.durable.reorder_notes(notebook_id, ordered_ids).await?,
                DurableWrite::ReorderTasks { ordered_ids } => self.durable.reorder_tasks(ordered_ids).await?,
                DurableWrite::UpdateOrderIndices { kind, updates } => {
                    self.durable.update_order_indices(*kind, updates).await?
                }
                DurableWrite::MoveTask {
                    task_id,
                    folder_id,
                    order_index,
                } => {
                    self.durable
                        .move_task(task_id, folder_id.as_deref(), *order_index)
                        .await?
                }
            }
        }
        Ok(())
    }

    async fn settle_failure(&self, op: &str, error: AppError) -> AppError {
        match &error {
            AppError::Validation(reason) => {
                tracing::debug!(op, reason = %reason, "skipped invalid intent");
            }
            AppError::NotFound(_) => {
                tracing::debug!(op, error = %error, "target vanished; refetching");
                let _ = self.refetch().await;
            }
            AppError::JoinConflict(conflict) => {
                self.notify(Notification::error(conflict.to_string()));
            }
            _ => {
                tracing::warn!(op, error = %error, "mutation failed");
                self.notify(Notification::error(format!("Could not {op}: {error}")));
            }
        }
        error
    }

    fn notify(&self, notification: Notification) {
        // nobody listening is fine
        let _ = self.notifications.send(notification);
    }

    fn require_in(&self, forest: &Forest, notebook_id: &str, capability: Capability) -> AppResult<Role> {
        if forest.notebook(notebook_id).is_none() {
            return Err(AppError::NotFound(format!("notebook {notebook_id}")));
        }
        require(forest.role_of(notebook_id, &self.viewer_id), capability)
    }

    fn require_for(&self, kind: EntityKind, id: &str, capability: Capability) -> AppResult<Arc<Forest>> {
        let forest = self.store.snapshot();
        let notebook_id = forest
            .notebook_id_of(kind, id)
            .ok_or_else(|| AppError::NotFound(format!("{} {id}", kind.table())))?;
        self.require_in(&forest, &notebook_id, capability)?;
        Ok(forest)
    }

    // ─── Notebooks ──────────────────────────────────────────────────────────

    pub async fn create_notebook(&self, payload: CreateNotebookPayload) -> AppResult<Notebook> {
        let result = async {
            let title = validated_title(&payload.title)?;
            self.durable.create_notebook(&title).await
        }
        .await;
        match result {
            Ok(notebook) => {
                self.store.apply(&[Patch::UpsertNotebook(notebook.clone())]);
                Ok(notebook)
            }
            Err(error) => Err(self.settle_failure("create notebook", error).await),
        }
    }

    pub async fn rename_notebook(&self, notebook_id: &str, title: &str) -> AppResult<()> {
        let result = async {
            let title = validated_title(title)?;
            let forest = self.require_for(EntityKind::Notebook, notebook_id, Capability::ManageNotebook)?;
            if forest.notebook(notebook_id).is_some_and(|current| current.title == title) {
                return Ok(None);
            }
            self.durable.rename_notebook(notebook_id, &title).await.map(Some)
        }
        .await;
        match result {
            Ok(Some(notebook)) => {
                self.store.apply(&[Patch::UpsertNotebook(notebook)]);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(error) => Err(self.settle_failure("rename notebook", error).await),
        }
    }

    pub async fn delete_notebook(&self, notebook_id: &str) -> AppResult<()> {
        let result = async {
            self.require_for(EntityKind::Notebook, notebook_id, Capability::ManageNotebook)?;
            self.durable.delete_notebook(notebook_id).await
        }
        .await;
        match result {
            Ok(()) => {
                self.store.apply(&[Patch::RemoveNotebook {
                    id: notebook_id.to_string(),
                }]);
                Ok(())
            }
            Err(error) => Err(self.settle_failure("delete notebook", error).await),
        }
    }

    // ─── Notes ──────────────────────────────────────────────────────────────

    pub async fn create_note(&self, payload: CreateNotePayload) -> AppResult<Note> {
        let result = async {
            let title = validated_title(&payload.title)?;
            self.require_for(EntityKind::Notebook, &payload.notebook_id, Capability::EditStructure)?;
            self.durable.create_note(&payload.notebook_id, &title).await
        }
        .await;
        match result {
            Ok(note) => {
                self.store.apply(&[Patch::UpsertNote(note.clone())]);
                Ok(note)
            }
            Err(error) => Err(self.settle_failure("create note", error).await),
        }
    }

    pub async fn rename_note(&self, note_id: &str, title: &str) -> AppResult<()> {
        let result = async {
            let title = validated_title(title)?;
            let forest = self.require_for(EntityKind::Note, note_id, Capability::EditStructure)?;
            if forest.note(note_id).is_some_and(|current| current.title == title) {
                return Ok(None);
            }
            self.durable.rename_note(note_id, &title).await.map(Some)
        }
        .await;
        match result {
            Ok(Some(note)) => {
                self.store.apply(&[Patch::UpsertNote(note)]);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(error) => Err(self.settle_failure("rename note", error).await),
        }
    }

    pub async fn delete_note(&self, note_id: &str) -> AppResult<()> {
        let result = async {
            self.require_for(EntityKind::Note, note_id, Capability::EditStructure)?;
            self.durable.delete_note(note_id).await
        }
        .await;
        match result {
            Ok(()) => {
                self.store.apply(&[Patch::RemoveNote {
                    id: note_id.to_string(),
                }]);
                Ok(())
            }
            Err(error) => Err(self.settle_failure("delete note", error).await),
        }
    }

    // ─── Folders ────────────────────────────────────────────────────────────

    pub async fn create_folder(&self, payload: CreateFolderPayload) -> AppResult<TaskFolder> {
        let result = async {
            let title = validated_title(&payload.title)?;
            self.require_for(EntityKind::Note, &payload.note_id, Capability::EditStructure)?;
            self.durable.create_folder(&payload.note_id, &title).await
        }
        .await;
        match result {
            Ok(folder) => {
                self.store.apply(&[Patch::UpsertFolder(folder.clone())]);
                Ok(folder)
            }
            Err(error) => Err(self.settle_failure("create folder", error).await),
        }
    }

    pub async fn rename_folder(&self, folder_id: &str, title: &str) -> AppResult<()> {
        let result = async {
            let title = validated_title(title)?;
            let forest = self.require_for(EntityKind::Folder, folder_id, Capability::EditStructure)?;
            if forest.folder(folder_id).is_some_and(|current| current.title == title) {
                return Ok(None);
            }
            self.durable.rename_folder(folder_id, &title).await.map(Some)
        }
        .await;
        match result {
            Ok(Some(folder)) => {
                self.store.apply(&[Patch::UpsertFolder(folder)]);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(error) => Err(self.settle_failure("rename folder", error).await),
        }
    }

    pub async fn set_folder_collapsed(&self, folder_id: &str, collapsed: bool) -> AppResult<()> {
        let forest = self.store.snapshot();
        if forest.folder(folder_id).is_some_and(|folder| folder.is_collapsed == collapsed) {
            return Ok(());
        }
        match self.durable.set_folder_collapsed(folder_id, collapsed).await {
            Ok(folder) => {
                self.store.apply(&[Patch::UpsertFolder(folder)]);
                Ok(())
            }
            Err(error) => Err(self.settle_failure("collapse folder", error).await),
        }
    }

    pub async fn delete_folder(&self, folder_id: &str) -> AppResult<()> {
        let result = async {
            self.require_for(EntityKind::Folder, folder_id, Capability::EditStructure)?;
            self.durable.delete_folder(folder_id).await
        }
        .await;
        match result {
            Ok(()) => {
                self.store.apply(&[Patch::RemoveFolder {
                    id: folder_id.to_string(),
                }]);
                Ok(())
            }
            Err(error) => Err(self.settle_failure("delete folder", error).await),
        }
    }

    // ─── Tasks ──────────────────────────────────────────────────────────────

    pub async fn create_task(&self, payload: CreateTaskPayload) -> AppResult<Task> {
        let result = async {
            let title = validated_title(&payload.title)?;
            self.require_for(EntityKind::Note, &payload.note_id, Capability::EditStructure)?;
            self.durable
                .create_task(&payload.note_id, payload.folder_id.as_deref(), &title)
                .await
        }
        .await;
        match result {
            Ok(task) => {
                self.store.apply(&[Patch::UpsertTask(task.clone())]);
                Ok(task)
            }
            Err(error) => Err(self.settle_failure("create task", error).await),
        }
    }

    pub async fn rename_task(&self, task_id: &str, title: &str) -> AppResult<()> {
        let result = async {
            let title = validated_title(title)?;
            let forest = self.require_for(EntityKind::Task, task_id, Capability::EditStructure)?;
            if forest.task(task_id).is_some_and(|current| current.title == title) {
                return Ok(None);
            }
            self.durable.rename_task(task_id, &title).await.map(Some)
        }
        .await;
        match result {
            Ok(Some(task)) => {
                self.store.apply(&[Patch::UpsertTask(task)]);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(error) => Err(self.settle_failure("rename task", error).await),
        }
    }

    pub async fn delete_task(&self, task_id: &str) -> AppResult<()> {
        let result = async {
            self.require_for(EntityKind::Task, task_id, Capability::EditStructure)?;
            self.durable.delete_task(task_id).await
        }
        .await;
        match result {
            Ok(()) => {
                self.store.apply(&[Patch::RemoveTask {
                    id: task_id.to_string(),
                }]);
                Ok(())
            }
            Err(error) => Err(self.settle_failure("delete task", error).await),
        }
    }

    pub async fn toggle_completion(&self, task_id: &str) -> AppResult<ToggleAction> {
        let result = async {
            let forest = self.require_for(EntityKind::Task, task_id, Capability::Complete)?;
            let task = forest
                .task(task_id)
                .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;
            match toggle_action(task, &self.viewer_id) {
                ToggleAction::Add => {
                    let completion = self.durable.insert_completion(task_id).await?;
                    Ok::<_, AppError>((ToggleAction::Add, Patch::AddCompletion(completion)))
                }
                ToggleAction::Remove => {
                    self.durable.delete_completion(task_id).await?;
                    Ok::<_, AppError>((
                        ToggleAction::Remove,
                        Patch::RemoveCompletion {
                            task_id: task_id.to_string(),
                            user_id: self.viewer_id.clone(),
                        },
                    ))
                }
            }
        }
        .await;
        match result {
            Ok((action, patch)) => {
                self.store.apply(&[patch]);
                Ok(action)
            }
            Err(error) => Err(self.settle_failure("update completion", error).await),
        }
    }

    // ─── Ordering ───────────────────────────────────────────────────────────

    pub async fn reorder(&self, request: ReorderRequest) -> AppResult<()> {
        let planned = self.plan_reorder(&request);
        match planned {
            Ok(Some(plan)) => self.execute(OptimisticCommand::from_reorder(plan)).await,
            Ok(None) => Ok(()),
            Err(error) => Err(self.settle_failure("reorder items", error).await),
        }
    }

    fn plan_reorder(&self, request: &ReorderRequest) -> AppResult<Option<ReorderPlan>> {
        let forest = self.store.snapshot();
        match &request.container {
            // each viewer orders their own list
            Container::Notebooks => {}
            Container::Notes { notebook_id } => {
                self.require_in(&forest, notebook_id, Capability::EditStructure)?;
            }
            Container::Folders { note_id } | Container::Tasks { note_id, .. } => {
                self.require_for(EntityKind::Note, note_id, Capability::EditStructure)?;
            }
        }
        plan_reorder(&forest, &request.container, request.from, request.to)
    }

    pub async fn move_task(&self, request: MoveTaskRequest) -> AppResult<()> {
        let planned = self
            .require_for(EntityKind::Task, &request.task_id, Capability::EditStructure)
            .and_then(|forest| plan_move(&forest, &request.task_id, &request.target));
        match planned {
            Ok(MovePlan::Unchanged) => Ok(()),
            Ok(MovePlan::Reorder(plan)) => self.execute(OptimisticCommand::from_reorder(plan)).await,
            Ok(MovePlan::ChangeContainer(change)) => {
                tracing::debug!(
                    task_id = %change.task_id,
                    order_index = change.order_index,
                    "moving task across containers"
                );
                self.execute(OptimisticCommand {
                    label: "move task",
                    patches: vec![change.patch],
                    writes: vec![DurableWrite::MoveTask {
                        task_id: change.task_id,
                        folder_id: change.folder_id,
                        order_index: change.order_index,
                    }],
                })
                .await
            }
            Err(error) => Err(self.settle_failure("move task", error).await),
        }
    }

    // ─── Sharing ────────────────────────────────────────────────────────────

    pub async fn generate_share_code(&self, notebook_id: &str) -> AppResult<String> {
        let result = async {
            let forest = self.require_for(EntityKind::Notebook, notebook_id, Capability::ManageNotebook)?;
            let code = self.durable.generate_share_code(notebook_id).await?;
            Ok::<_, AppError>((forest, code))
        }
        .await;
        match result {
            Ok((forest, code)) => {
                if let Some(current) = forest.notebook(notebook_id) {
                    let mut notebook = current.as_ref().clone();
                    notebook.share_code = Some(code.clone());
                    notebook.is_shared = true;
                    self.store.apply(&[Patch::UpsertNotebook(notebook)]);
                }
                Ok(code)
            }
            Err(error) => Err(self.settle_failure("generate share code", error).await),
        }
    }

    pub async fn revoke_share_code(&self, notebook_id: &str) -> AppResult<()> {
        let result = async {
            let forest = self.require_for(EntityKind::Notebook, notebook_id, Capability::ManageNotebook)?;
            self.durable.revoke_share_code(notebook_id).await?;
            Ok::<_, AppError>(forest)
        }
        .await;
        match result {
            Ok(forest) => {
                if let Some(current) = forest.notebook(notebook_id) {
                    let mut notebook = current.as_ref().clone();
                    notebook.share_code = None;
                    notebook.is_shared = false;
                    self.store.apply(&[Patch::UpsertNotebook(notebook)]);
                }
                Ok(())
            }
            Err(error) => Err(self.settle_failure("revoke share code", error).await),
        }
    }

    pub async fn set_notebook_shared(&self, notebook_id: &str, shared: bool) -> AppResult<()> {
        let result = async {
            self.require_for(EntityKind::Notebook, notebook_id, Capability::ManageNotebook)?;
            self.durable.set_notebook_shared(notebook_id, shared).await
        }
        .await;
        match result {
            Ok(notebook) => {
                self.store.apply(&[Patch::UpsertNotebook(notebook)]);
                Ok(())
            }
            Err(error) => Err(self.settle_failure("change sharing", error).await),
        }
    }

    pub async fn join_by_share_code(&self, code: &str) -> AppResult<NotebookMember> {
        let result = async {
            if code.trim().is_empty() {
                return Err(AppError::Validation("Share code is empty".to_string()));
            }
            self.durable.join_by_share_code(code).await
        }
        .await;
        match result {
            Ok(member) => {
                tracing::info!(notebook_id = %member.notebook_id, "joined shared notebook");
                // the joined notebook's tree only arrives with a full fetch
                let _ = self.refetch().await;
                self.notify(Notification::info("Joined notebook"));
                Ok(member)
            }
            Err(error) => Err(self.settle_failure("join notebook", error).await),
        }
    }

    // ─── Members ────────────────────────────────────────────────────────────

    pub async fn list_members(&self, notebook_id: &str) -> AppResult<Vec<NotebookMember>> {
        match self.durable.list_members(notebook_id).await {
            Ok(members) => {
                let patches = members.iter().cloned().map(Patch::UpsertMember).collect::<Vec<_>>();
                self.store.apply(&patches);
                Ok(members)
            }
            Err(error) => Err(self.settle_failure("load members", error).await),
        }
    }

    pub async fn set_member_role(&self, notebook_id: &str, user_id: &str, role: Role) -> AppResult<()> {
        let result = async {
            let forest = self.require_for(EntityKind::Notebook, notebook_id, Capability::ManageMembers)?;
            let unchanged = forest
                .members(notebook_id)
                .iter()
                .any(|member| member.user_id == user_id && member.role == role);
            if unchanged {
                return Ok(None);
            }
            self.durable.set_member_role(notebook_id, user_id, role).await.map(Some)
        }
        .await;
        match result {
            Ok(Some(member)) => {
                self.store.apply(&[Patch::UpsertMember(member)]);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(error) => Err(self.settle_failure("change member role", error).await),
        }
    }

    pub async fn remove_member(&self, notebook_id: &str, user_id: &str) -> AppResult<()> {
        let result = async {
            if user_id != self.viewer_id {
                self.require_for(EntityKind::Notebook, notebook_id, Capability::ManageMembers)?;
            }
            self.durable.remove_member(notebook_id, user_id).await
        }
        .await;
        match result {
            Ok(()) => {
                let mut patches = vec![Patch::RemoveMember {
                    notebook_id: notebook_id.to_string(),
                    user_id: user_id.to_string(),
                }];
                if user_id == self.viewer_id {
                    patches.push(Patch::RemoveNotebook {
                        id: notebook_id.to_string(),
                    });
                }
                self.store.apply(&patches);
                Ok(())
            }
            Err(error) => Err(self.settle_failure("remove member", error).await),
        }
    }

    /// Drops the viewer's own membership. Owners cannot leave their notebook.
    pub async fn leave_notebook(&self, notebook_id: &str) -> AppResult<()> {
        let forest = self.store.snapshot();
        if forest
            .notebook(notebook_id)
            .is_some_and(|notebook| notebook.owner_id == self.viewer_id)
        {
            let error = AppError::Validation("The owner cannot leave their own notebook".to_string());
            return Err(self.settle_failure("leave notebook", error).await);
        }
        let viewer_id = self.viewer_id.clone();
        self.remove_member(notebook_id, &viewer_id).await
    }
}

fn validated_title(raw: &str) -> AppResult<String> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(AppError::Validation("Title cannot be empty".to_string()));
    }
    Ok(title.to_string())
}
