use crate::errors::{AppError, AppResult};
use crate::models::{Container, DropTarget, EntityKind};
use crate::store::{Forest, Patch};

#[derive(Debug, Clone, PartialEq)]
pub struct ReorderPlan {
    pub container: Container,
    pub kind: EntityKind,
    pub ordered_ids: Vec<String>,
    pub patches: Vec<Patch>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerChange {
    pub task_id: String,
    pub from: Container,
    pub to: Container,
    pub folder_id: Option<String>,
    pub order_index: i64,
    pub patch: Patch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MovePlan {
    Unchanged,
    Reorder(ReorderPlan),
    ChangeContainer(ContainerChange),
}

pub fn kind_of(container: &Container) -> EntityKind {
    match container {
        Container::Notebooks => EntityKind::Notebook,
        Container::Notes { .. } => EntityKind::Note,
        Container::Folders { .. } => EntityKind::Folder,
        Container::Tasks { .. } => EntityKind::Task,
    }
}

pub fn move_position(ids: &[String], from: usize, to: usize) -> AppResult<Vec<String>> {
    if from >= ids.len() || to >= ids.len() {
        return Err(AppError::Validation(format!(
            "Position out of range: from {} to {} in a list of {}",
            from,
            to,
            ids.len()
        )));
    }
    let mut ordered = ids.to_vec();
    let moved = ordered.remove(from);
    ordered.insert(to, moved);
    Ok(ordered)
}

pub fn assign_indices(ordered_ids: &[String]) -> Vec<(String, i64)> {
    ordered_ids
        .iter()
        .enumerate()
        .map(|(rank, id)| (id.clone(), rank as i64))
        .collect()
}

pub fn plan_reorder(
    forest: &Forest,
    container: &Container,
    from: usize,
    to: usize,
) -> AppResult<Option<ReorderPlan>> {
    let current = forest.container_ids(container);
    let ordered_ids = move_position(&current, from, to)?;
    if ordered_ids == current && indices_match(forest, container, &ordered_ids) {
        return Ok(None);
    }
    Ok(Some(build_reorder(container.clone(), ordered_ids)))
}

fn indices_match(forest: &Forest, container: &Container, ordered_ids: &[String]) -> bool {
    let kind = kind_of(container);
    ordered_ids
        .iter()
        .enumerate()
        .all(|(rank, id)| forest.order_index_of(kind, id) == Some(rank as i64))
}

fn build_reorder(container: Container, ordered_ids: Vec<String>) -> ReorderPlan {
    let kind = kind_of(&container);
    let patches = assign_indices(&ordered_ids)
        .into_iter()
        .map(|(id, order_index)| Patch::SetOrderIndex { kind, id, order_index })
        .collect();
    ReorderPlan {
        container,
        kind,
        ordered_ids,
        patches,
    }
}

/// Dropping on a container appends at its end. Dropping on a task in another container
/// moves into that container, also appended at the end; a later drag inside the
/// destination positions it. Empty and non-empty destinations follow the same rule.
pub fn plan_move(forest: &Forest, task_id: &str, target: &DropTarget) -> AppResult<MovePlan> {
    let task = forest
        .task(task_id)
        .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;
    let source = task.container();

    let destination = match target {
        DropTarget::Container { note_id, folder_id } => {
            if let Some(folder_id) = folder_id {
                let folder = forest
                    .folder(folder_id)
                    .ok_or_else(|| AppError::NotFound(format!("folder {folder_id}")))?;
                if folder.note_id != *note_id {
                    return Err(AppError::Validation(format!(
                        "Folder {folder_id} does not belong to note {note_id}"
                    )));
                }
            }
            Container::Tasks {
                note_id: note_id.clone(),
                folder_id: folder_id.clone(),
            }
        }
        DropTarget::Item { task_id: target_id } => {
            if target_id == task_id {
                return Ok(MovePlan::Unchanged);
            }
            let target_task = forest
                .task(target_id)
                .ok_or_else(|| AppError::NotFound(format!("task {target_id}")))?;
            let destination = target_task.container();
            if destination == source {
                let ids = forest.container_ids(&source);
                let from = position(&ids, task_id)?;
                let to = position(&ids, target_id)?;
                return Ok(plan_reorder(forest, &source, from, to)?
                    .map(MovePlan::Reorder)
                    .unwrap_or(MovePlan::Unchanged));
            }
            destination
        }
    };

    let Container::Tasks {
        note_id: destination_note,
        folder_id: destination_folder,
    } = &destination
    else {
        return Err(AppError::Internal("task drop resolved to a non-task container".to_string()));
    };
    if *destination_note != task.note_id {
        return Err(AppError::Validation(
            "Tasks can only move between containers of the same note".to_string(),
        ));
    }

    if destination == source {
        let ids = forest.container_ids(&source);
        let from = position(&ids, task_id)?;
        return Ok(plan_reorder(forest, &source, from, ids.len() - 1)?
            .map(MovePlan::Reorder)
            .unwrap_or(MovePlan::Unchanged));
    }

    let order_index = forest
        .container_ids(&destination)
        .iter()
        .filter_map(|id| forest.order_index_of(EntityKind::Task, id))
        .max()
        .map(|max| max + 1)
        .unwrap_or(0);

    Ok(MovePlan::ChangeContainer(ContainerChange {
        task_id: task_id.to_string(),
        from: source,
        folder_id: destination_folder.clone(),
        to: destination.clone(),
        order_index,
        patch: Patch::SetTaskFolder {
            task_id: task_id.to_string(),
            folder_id: destination_folder.clone(),
            order_index,
        },
    }))
}

fn position(ids: &[String], id: &str) -> AppResult<usize> {
    ids.iter()
        .position(|existing| existing == id)
        .ok_or_else(|| AppError::NotFound(format!("{id} is not in its container")))
}
