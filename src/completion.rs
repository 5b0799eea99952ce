use crate::models::Task;
use crate::store::Forest;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleAction {
    Add,
    Remove,
}

pub fn toggle_action(task: &Task, user_id: &str) -> ToggleAction {
    if task.is_completed_by(user_id) {
        ToggleAction::Remove
    } else {
        ToggleAction::Add
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub percentage: u8,
}

impl Progress {
    fn new(completed: usize, total: usize) -> Self {
        Self {
            completed,
            total,
            percentage: percent(completed, total),
        }
    }
}

pub fn percent(numerator: usize, denominator: usize) -> u8 {
    if denominator == 0 {
        return 0;
    }
    let rounded = (numerator * 200 + denominator) / (denominator * 2);
    rounded.min(100) as u8
}

fn user_progress(tasks: &[&Arc<Task>], user_id: &str) -> Progress {
    let completed = tasks.iter().filter(|task| task.is_completed_by(user_id)).count();
    Progress::new(completed, tasks.len())
}

pub fn note_progress(forest: &Forest, note_id: &str, user_id: &str) -> Progress {
    user_progress(&forest.tasks_in_note(note_id), user_id)
}

pub fn notebook_progress(forest: &Forest, notebook_id: &str, user_id: &str) -> Progress {
    user_progress(&forest.tasks_in_notebook(notebook_id), user_id)
}

/// Group average for a shared notebook: all completion entries over `tasks × members`.
///
/// This is an approximation. Members who joined after tasks were completed, and readers
/// who never complete anything, still count fully in the denominator.
pub fn group_progress(forest: &Forest, notebook_id: &str) -> Progress {
    let tasks = forest.tasks_in_notebook(notebook_id);
    let entries = tasks.iter().map(|task| task.completions.len()).sum::<usize>();
    let member_count = member_count(forest, notebook_id);
    Progress::new(entries, tasks.len() * member_count)
}

pub fn member_count(forest: &Forest, notebook_id: &str) -> usize {
    let mut users = forest
        .members(notebook_id)
        .iter()
        .map(|member| member.user_id.as_str())
        .collect::<BTreeSet<_>>();
    if let Some(notebook) = forest.notebook(notebook_id) {
        users.insert(notebook.owner_id.as_str());
    }
    users.len()
}
