use crate::durable::{CommentFeed, DurableStore};
use crate::errors::{AppError, AppResult, JoinConflict};
use crate::models::{
    Comment, CommentEvent, CommentSummary, Completion, EntityKind, ForestRows, Note, Notebook, NotebookMember,
    Profile, Role, Task, TaskFolder,
};
use crate::policy::{require, resolve_role, Capability};
use crate::sharing::{generate_share_code, is_well_formed, normalize_share_code};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const MAX_SHARE_CODE_ATTEMPTS: usize = 16;

const NOTEBOOK_COLUMNS: &str = "n.id, n.title, n.owner_id, n.is_shared, n.share_code, n.order_index, n.created_at";
const MEMBER_COLUMNS: &str = "m.id, m.notebook_id, m.user_id, m.role, m.joined_at, p.name, p.avatar_url";
const NOTE_COLUMNS: &str = "id, notebook_id, title, order_index, created_at";
const FOLDER_COLUMNS: &str = "id, note_id, title, order_index, is_collapsed, created_at";
const TASK_COLUMNS: &str = "id, note_id, folder_id, title, order_index, created_at";
const COMPLETION_COLUMNS: &str = "c.id, c.task_id, c.user_id, c.completed_at, p.name, p.avatar_url";
const COMMENT_COLUMNS: &str = "c.id, c.task_id, c.user_id, c.content, c.created_at, p.name, p.avatar_url";

/// Notebooks the user `?1` owns or belongs to.
const VISIBLE_NOTEBOOKS: &str = "SELECT n.id FROM notebooks n
   WHERE n.owner_id = ?1
      OR EXISTS (SELECT 1 FROM notebook_members vm WHERE vm.notebook_id = n.id AND vm.user_id = ?1)";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    comment_feed: broadcast::Sender<CommentEvent>,
}

impl Database {
    pub fn new(path: &Path, feed_capacity: usize) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        let (comment_feed, _) = broadcast::channel(feed_capacity.max(1));

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
            comment_feed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn session(self: &Arc<Self>, user_id: &str) -> DbSession {
        DbSession {
            db: Arc::clone(self),
            user_id: user_id.to_string(),
        }
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    fn publish(&self, event: CommentEvent) {
        // no receivers simply means no open threads
        let _ = self.comment_feed.send(event);
    }

    pub fn upsert_profile(&self, profile: &Profile) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO profiles (user_id, name, email, avatar_url) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET name = excluded.name, email = excluded.email,
               avatar_url = excluded.avatar_url",
            params![profile.user_id, profile.name, profile.email, profile.avatar_url],
        )?;
        Ok(())
    }

    pub fn get_profile(&self, user_id: &str) -> AppResult<Option<Profile>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT user_id, name, email, avatar_url FROM profiles WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(Profile {
                    user_id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                    avatar_url: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    // ─── Whole-tree fetch ───────────────────────────────────────────────────

    pub fn fetch_forest(&self, user_id: &str) -> AppResult<ForestRows> {
        let conn = self.lock()?;

        let notebooks = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {NOTEBOOK_COLUMNS} FROM notebooks n WHERE n.id IN ({VISIBLE_NOTEBOOKS})"
            ))?;
            let rows = stmt.query_map(params![user_id], parse_notebook_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let members = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MEMBER_COLUMNS} FROM notebook_members m
                 LEFT JOIN profiles p ON p.user_id = m.user_id
                 WHERE m.notebook_id IN ({VISIBLE_NOTEBOOKS})"
            ))?;
            let rows = stmt.query_map(params![user_id], parse_member_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let visible_notes = format!("SELECT id FROM notes WHERE notebook_id IN ({VISIBLE_NOTEBOOKS})");

        let notes = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {NOTE_COLUMNS} FROM notes WHERE notebook_id IN ({VISIBLE_NOTEBOOKS})"
            ))?;
            let rows = stmt.query_map(params![user_id], parse_note_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let folders = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FOLDER_COLUMNS} FROM task_folders WHERE note_id IN ({visible_notes})"
            ))?;
            let rows = stmt.query_map(params![user_id], parse_folder_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut completions_by_task: HashMap<String, Vec<Completion>> = HashMap::new();
        {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COMPLETION_COLUMNS} FROM task_completions c
                 LEFT JOIN profiles p ON p.user_id = c.user_id
                 WHERE c.task_id IN (SELECT id FROM tasks WHERE note_id IN ({visible_notes}))
                 ORDER BY c.completed_at ASC"
            ))?;
            let rows = stmt.query_map(params![user_id], parse_completion_row)?;
            for row in rows {
                let completion = row?;
                completions_by_task
                    .entry(completion.task_id.clone())
                    .or_default()
                    .push(completion);
            }
        }

        let tasks = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE note_id IN ({visible_notes})"
            ))?;
            let rows = stmt.query_map(params![user_id], parse_task_row)?;
            let mut tasks = rows.collect::<Result<Vec<_>, _>>()?;
            for task in &mut tasks {
                task.completions = completions_by_task.remove(&task.id).unwrap_or_default();
            }
            tasks
        };

        let comment_summaries = {
            let mut stmt = conn.prepare(&format!(
                "SELECT t.id, COUNT(c.id), MAX(c.created_at), r.last_read_at
                 FROM tasks t
                 LEFT JOIN task_comments c ON c.task_id = t.id
                 LEFT JOIN comment_reads r ON r.task_id = t.id AND r.user_id = ?1
                 WHERE t.note_id IN ({visible_notes})
                 GROUP BY t.id, r.last_read_at"
            ))?;
            let rows = stmt.query_map(params![user_id], |row| {
                let latest: Option<String> = row.get(2)?;
                let last_read: Option<String> = row.get(3)?;
                Ok(CommentSummary {
                    task_id: row.get(0)?,
                    count: row.get(1)?,
                    latest_at: latest.as_deref().map(parse_time).transpose()?,
                    last_read_at: last_read.as_deref().map(parse_time).transpose()?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        Ok(ForestRows {
            notebooks,
            members,
            notes,
            folders,
            tasks,
            comment_summaries,
        })
    }

    // ─── Notebooks ──────────────────────────────────────────────────────────

    pub fn create_notebook(&self, user_id: &str, title: &str) -> AppResult<Notebook> {
        let now = now();
        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        let order_index: i64 = conn.query_row(
            "SELECT COALESCE(MAX(order_index) + 1, 0) FROM notebooks WHERE owner_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO notebooks (id, title, owner_id, is_shared, share_code, order_index, created_at)
             VALUES (?1, ?2, ?3, 0, NULL, ?4, ?5)",
            params![id, title, user_id, order_index, format_time(now)],
        )?;

        Ok(Notebook {
            id,
            title: title.to_string(),
            owner_id: user_id.to_string(),
            is_shared: false,
            share_code: None,
            order_index,
            created_at: now,
        })
    }

    pub fn rename_notebook(&self, user_id: &str, notebook_id: &str, title: &str) -> AppResult<Notebook> {
        let conn = self.lock()?;
        require_capability(&conn, notebook_id, user_id, Capability::ManageNotebook)?;
        conn.execute(
            "UPDATE notebooks SET title = ?1 WHERE id = ?2",
            params![title, notebook_id],
        )?;
        load_notebook(&conn, notebook_id)
    }

    pub fn delete_notebook(&self, user_id: &str, notebook_id: &str) -> AppResult<()> {
        let conn = self.lock()?;
        require_capability(&conn, notebook_id, user_id, Capability::ManageNotebook)?;
        conn.execute("DELETE FROM notebooks WHERE id = ?1", params![notebook_id])?;
        Ok(())
    }

    pub fn set_notebook_shared(&self, user_id: &str, notebook_id: &str, shared: bool) -> AppResult<Notebook> {
        let conn = self.lock()?;
        require_capability(&conn, notebook_id, user_id, Capability::ManageNotebook)?;
        conn.execute(
            "UPDATE notebooks SET is_shared = ?1 WHERE id = ?2",
            params![shared, notebook_id],
        )?;
        load_notebook(&conn, notebook_id)
    }

    pub fn generate_share_code(&self, user_id: &str, notebook_id: &str) -> AppResult<String> {
        let conn = self.lock()?;
        require_capability(&conn, notebook_id, user_id, Capability::ManageNotebook)?;
        for _ in 0..MAX_SHARE_CODE_ATTEMPTS {
            let code = generate_share_code();
            let taken: bool = conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM notebooks WHERE share_code = ?1)",
                params![code],
                |row| row.get(0),
            )?;
            if taken {
                continue;
            }
            conn.execute(
                "UPDATE notebooks SET share_code = ?1, is_shared = 1 WHERE id = ?2",
                params![code, notebook_id],
            )?;
            return Ok(code);
        }
        Err(AppError::Internal("could not allocate a unique share code".to_string()))
    }

    pub fn revoke_share_code(&self, user_id: &str, notebook_id: &str) -> AppResult<()> {
        let conn = self.lock()?;
        require_capability(&conn, notebook_id, user_id, Capability::ManageNotebook)?;
        conn.execute(
            "UPDATE notebooks SET share_code = NULL, is_shared = 0 WHERE id = ?1",
            params![notebook_id],
        )?;
        Ok(())
    }

    pub fn join_by_share_code(&self, user_id: &str, raw_code: &str) -> AppResult<NotebookMember> {
        let code = normalize_share_code(raw_code);
        if !is_well_formed(&code) {
            return Err(JoinConflict::InvalidCode.into());
        }
        let conn = self.lock()?;
        let notebook = conn
            .query_row(
                &format!("SELECT {NOTEBOOK_COLUMNS} FROM notebooks n WHERE n.share_code = ?1"),
                params![code],
                parse_notebook_row,
            )
            .optional()?
            .ok_or(JoinConflict::InvalidCode)?;
        if !notebook.is_shared {
            return Err(JoinConflict::NotShared.into());
        }
        if notebook_role(&conn, &notebook.id, user_id)?.is_some() {
            return Err(JoinConflict::AlreadyMember.into());
        }

        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO notebook_members (id, notebook_id, user_id, role, joined_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, notebook.id, user_id, Role::Reader.as_str(), format_time(now())],
        )?;
        load_member(&conn, &notebook.id, user_id)
    }

    // ─── Members ────────────────────────────────────────────────────────────

    pub fn list_members(&self, user_id: &str, notebook_id: &str) -> AppResult<Vec<NotebookMember>> {
        let conn = self.lock()?;
        require_member(&conn, notebook_id, user_id)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MEMBER_COLUMNS} FROM notebook_members m
             LEFT JOIN profiles p ON p.user_id = m.user_id
             WHERE m.notebook_id = ?1 ORDER BY m.joined_at ASC"
        ))?;
        let rows = stmt.query_map(params![notebook_id], parse_member_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_member_role(
        &self,
        user_id: &str,
        notebook_id: &str,
        member_id: &str,
        role: Role,
    ) -> AppResult<NotebookMember> {
        if role == Role::Owner {
            return Err(AppError::Validation("Ownership cannot be assigned through a role change".to_string()));
        }
        let conn = self.lock()?;
        require_capability(&conn, notebook_id, user_id, Capability::ManageMembers)?;
        let updated = conn.execute(
            "UPDATE notebook_members SET role = ?1 WHERE notebook_id = ?2 AND user_id = ?3",
            params![role.as_str(), notebook_id, member_id],
        )?;
        if updated == 0 {
            return Err(AppError::NotFound(format!("member {member_id} of notebook {notebook_id}")));
        }
        load_member(&conn, notebook_id, member_id)
    }

    /// Removing yourself is leaving, which any non-owner may do.
    pub fn remove_member(&self, user_id: &str, notebook_id: &str, member_id: &str) -> AppResult<()> {
        let conn = self.lock()?;
        let notebook = load_notebook(&conn, notebook_id)?;
        if notebook.owner_id == member_id {
            return Err(AppError::Validation("The owner cannot be removed from a notebook".to_string()));
        }
        if member_id != user_id {
            require_capability(&conn, notebook_id, user_id, Capability::ManageMembers)?;
        }
        let removed = conn.execute(
            "DELETE FROM notebook_members WHERE notebook_id = ?1 AND user_id = ?2",
            params![notebook_id, member_id],
        )?;
        if removed == 0 {
            return Err(AppError::NotFound(format!("member {member_id} of notebook {notebook_id}")));
        }
        Ok(())
    }

    // ─── Notes ──────────────────────────────────────────────────────────────

    pub fn create_note(&self, user_id: &str, notebook_id: &str, title: &str) -> AppResult<Note> {
        let now = now();
        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        require_capability(&conn, notebook_id, user_id, Capability::EditStructure)?;
        let order_index: i64 = conn.query_row(
            "SELECT COALESCE(MAX(order_index) + 1, 0) FROM notes WHERE notebook_id = ?1",
            params![notebook_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO notes (id, notebook_id, title, order_index, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, notebook_id, title, order_index, format_time(now)],
        )?;
        Ok(Note {
            id,
            notebook_id: notebook_id.to_string(),
            title: title.to_string(),
            order_index,
            created_at: now,
        })
    }

    pub fn rename_note(&self, user_id: &str, note_id: &str, title: &str) -> AppResult<Note> {
        let conn = self.lock()?;
        let notebook_id = notebook_of(&conn, EntityKind::Note, note_id)?;
        require_capability(&conn, &notebook_id, user_id, Capability::EditStructure)?;
        conn.execute("UPDATE notes SET title = ?1 WHERE id = ?2", params![title, note_id])?;
        conn.query_row(
            &format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1"),
            params![note_id],
            parse_note_row,
        )
        .map_err(AppError::from)
    }

    pub fn delete_note(&self, user_id: &str, note_id: &str) -> AppResult<()> {
        let conn = self.lock()?;
        let notebook_id = notebook_of(&conn, EntityKind::Note, note_id)?;
        require_capability(&conn, &notebook_id, user_id, Capability::EditStructure)?;
        conn.execute("DELETE FROM notes WHERE id = ?1", params![note_id])?;
        Ok(())
    }

    pub fn reorder_notes(&self, user_id: &str, notebook_id: &str, ordered_note_ids: &[String]) -> AppResult<()> {
        let mut conn = self.lock()?;
        require_capability(&conn, notebook_id, user_id, Capability::EditStructure)?;
        let tx = conn.transaction()?;
        for (index, note_id) in ordered_note_ids.iter().enumerate() {
            tx.execute(
                "UPDATE notes SET order_index = ?1 WHERE id = ?2 AND notebook_id = ?3",
                params![index as i64, note_id, notebook_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ─── Folders ────────────────────────────────────────────────────────────

    pub fn create_folder(&self, user_id: &str, note_id: &str, title: &str) -> AppResult<TaskFolder> {
        let now = now();
        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        let notebook_id = notebook_of(&conn, EntityKind::Note, note_id)?;
        require_capability(&conn, &notebook_id, user_id, Capability::EditStructure)?;
        let order_index: i64 = conn.query_row(
            "SELECT COALESCE(MAX(order_index) + 1, 0) FROM task_folders WHERE note_id = ?1",
            params![note_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO task_folders (id, note_id, title, order_index, is_collapsed, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![id, note_id, title, order_index, format_time(now)],
        )?;
        Ok(TaskFolder {
            id,
            note_id: note_id.to_string(),
            title: title.to_string(),
            order_index,
            is_collapsed: false,
            created_at: now,
        })
    }

    pub fn rename_folder(&self, user_id: &str, folder_id: &str, title: &str) -> AppResult<TaskFolder> {
        let conn = self.lock()?;
        let notebook_id = notebook_of(&conn, EntityKind::Folder, folder_id)?;
        require_capability(&conn, &notebook_id, user_id, Capability::EditStructure)?;
        conn.execute(
            "UPDATE task_folders SET title = ?1 WHERE id = ?2",
            params![title, folder_id],
        )?;
        load_folder(&conn, folder_id)
    }

    /// View state only; any member may fold or unfold.
    pub fn set_folder_collapsed(&self, user_id: &str, folder_id: &str, collapsed: bool) -> AppResult<TaskFolder> {
        let conn = self.lock()?;
        let notebook_id = notebook_of(&conn, EntityKind::Folder, folder_id)?;
        require_member(&conn, &notebook_id, user_id)?;
        conn.execute(
            "UPDATE task_folders SET is_collapsed = ?1 WHERE id = ?2",
            params![collapsed, folder_id],
        )?;
        load_folder(&conn, folder_id)
    }

    pub fn delete_folder(&self, user_id: &str, folder_id: &str) -> AppResult<()> {
        let conn = self.lock()?;
        let notebook_id = notebook_of(&conn, EntityKind::Folder, folder_id)?;
        require_capability(&conn, &notebook_id, user_id, Capability::EditStructure)?;
        conn.execute("DELETE FROM task_folders WHERE id = ?1", params![folder_id])?;
        Ok(())
    }

    // ─── Tasks ──────────────────────────────────────────────────────────────

    pub fn create_task(
        &self,
        user_id: &str,
        note_id: &str,
        folder_id: Option<&str>,
        title: &str,
    ) -> AppResult<Task> {
        let now = now();
        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        let notebook_id = notebook_of(&conn, EntityKind::Note, note_id)?;
        require_capability(&conn, &notebook_id, user_id, Capability::EditStructure)?;
        if let Some(folder_id) = folder_id {
            ensure_folder_in_note(&conn, folder_id, note_id)?;
        }
        let order_index: i64 = conn.query_row(
            "SELECT COALESCE(MAX(order_index) + 1, 0) FROM tasks WHERE note_id = ?1 AND folder_id IS ?2",
            params![note_id, folder_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO tasks (id, note_id, folder_id, title, order_index, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, note_id, folder_id, title, order_index, format_time(now)],
        )?;
        Ok(Task {
            id,
            note_id: note_id.to_string(),
            folder_id: folder_id.map(ToString::to_string),
            title: title.to_string(),
            order_index,
            created_at: now,
            completions: Vec::new(),
        })
    }

    pub fn rename_task(&self, user_id: &str, task_id: &str, title: &str) -> AppResult<Task> {
        let conn = self.lock()?;
        let notebook_id = notebook_of(&conn, EntityKind::Task, task_id)?;
        require_capability(&conn, &notebook_id, user_id, Capability::EditStructure)?;
        conn.execute("UPDATE tasks SET title = ?1 WHERE id = ?2", params![title, task_id])?;
        let mut task = conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![task_id],
            parse_task_row,
        )?;
        task.completions = load_completions(&conn, task_id)?;
        Ok(task)
    }

    pub fn delete_task(&self, user_id: &str, task_id: &str) -> AppResult<()> {
        let conn = self.lock()?;
        let notebook_id = notebook_of(&conn, EntityKind::Task, task_id)?;
        require_capability(&conn, &notebook_id, user_id, Capability::EditStructure)?;
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
        Ok(())
    }

    /// All ids must live in one notebook; indices 0..n follow the slice order.
    pub fn reorder_tasks(&self, user_id: &str, ordered_task_ids: &[String]) -> AppResult<()> {
        let Some(first) = ordered_task_ids.first() else {
            return Ok(());
        };
        let mut conn = self.lock()?;
        let notebook_id = notebook_of(&conn, EntityKind::Task, first)?;
        require_capability(&conn, &notebook_id, user_id, Capability::EditStructure)?;
        for task_id in &ordered_task_ids[1..] {
            if notebook_of(&conn, EntityKind::Task, task_id)? != notebook_id {
                return Err(AppError::Validation("Reordered tasks span several notebooks".to_string()));
            }
        }
        let tx = conn.transaction()?;
        for (index, task_id) in ordered_task_ids.iter().enumerate() {
            tx.execute(
                "UPDATE tasks SET order_index = ?1 WHERE id = ?2",
                params![index as i64, task_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn move_task(&self, user_id: &str, task_id: &str, folder_id: Option<&str>, order_index: i64) -> AppResult<()> {
        let conn = self.lock()?;
        let notebook_id = notebook_of(&conn, EntityKind::Task, task_id)?;
        require_capability(&conn, &notebook_id, user_id, Capability::EditStructure)?;
        if let Some(folder_id) = folder_id {
            let note_id: String = conn.query_row(
                "SELECT note_id FROM tasks WHERE id = ?1",
                params![task_id],
                |row| row.get(0),
            )?;
            ensure_folder_in_note(&conn, folder_id, &note_id)?;
        }
        conn.execute(
            "UPDATE tasks SET folder_id = ?1, order_index = ?2 WHERE id = ?3",
            params![folder_id, order_index, task_id],
        )?;
        Ok(())
    }

    /// Notebook rows only persist for their owner; folders and the rest go through role checks.
    pub fn update_order_indices(&self, user_id: &str, kind: EntityKind, updates: &[(String, i64)]) -> AppResult<()> {
        let mut conn = self.lock()?;
        if kind != EntityKind::Notebook {
            for (id, _) in updates {
                let notebook_id = notebook_of(&conn, kind, id)?;
                require_capability(&conn, &notebook_id, user_id, Capability::EditStructure)?;
            }
        }
        let tx = conn.transaction()?;
        for (id, order_index) in updates {
            match kind {
                EntityKind::Notebook => tx.execute(
                    "UPDATE notebooks SET order_index = ?1 WHERE id = ?2 AND owner_id = ?3",
                    params![order_index, id, user_id],
                )?,
                other => tx.execute(
                    &format!("UPDATE {} SET order_index = ?1 WHERE id = ?2", other.table()),
                    params![order_index, id],
                )?,
            };
        }
        tx.commit()?;
        Ok(())
    }

    // ─── Completions ────────────────────────────────────────────────────────

    pub fn insert_completion(&self, user_id: &str, task_id: &str) -> AppResult<Completion> {
        let conn = self.lock()?;
        let notebook_id = notebook_of(&conn, EntityKind::Task, task_id)?;
        require_capability(&conn, &notebook_id, user_id, Capability::Complete)?;
        conn.execute(
            "INSERT INTO task_completions (id, task_id, user_id, completed_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(task_id, user_id) DO NOTHING",
            params![Uuid::new_v4().to_string(), task_id, user_id, format_time(now())],
        )?;
        conn.query_row(
            &format!(
                "SELECT {COMPLETION_COLUMNS} FROM task_completions c
                 LEFT JOIN profiles p ON p.user_id = c.user_id
                 WHERE c.task_id = ?1 AND c.user_id = ?2"
            ),
            params![task_id, user_id],
            parse_completion_row,
        )
        .map_err(AppError::from)
    }

    pub fn delete_completion(&self, user_id: &str, task_id: &str) -> AppResult<()> {
        let conn = self.lock()?;
        let notebook_id = notebook_of(&conn, EntityKind::Task, task_id)?;
        require_capability(&conn, &notebook_id, user_id, Capability::Complete)?;
        conn.execute(
            "DELETE FROM task_completions WHERE task_id = ?1 AND user_id = ?2",
            params![task_id, user_id],
        )?;
        Ok(())
    }

    // ─── Comments ───────────────────────────────────────────────────────────

    pub fn list_comments(&self, user_id: &str, task_id: &str) -> AppResult<Vec<Comment>> {
        let conn = self.lock()?;
        let notebook_id = notebook_of(&conn, EntityKind::Task, task_id)?;
        require_member(&conn, &notebook_id, user_id)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COMMENT_COLUMNS} FROM task_comments c
             LEFT JOIN profiles p ON p.user_id = c.user_id
             WHERE c.task_id = ?1 ORDER BY c.created_at ASC, c.id ASC"
        ))?;
        let rows = stmt.query_map(params![task_id], parse_comment_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn insert_comment(&self, user_id: &str, task_id: &str, content: &str) -> AppResult<Comment> {
        let comment = {
            let conn = self.lock()?;
            let notebook_id = notebook_of(&conn, EntityKind::Task, task_id)?;
            require_capability(&conn, &notebook_id, user_id, Capability::Comment)?;
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO task_comments (id, task_id, user_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, task_id, user_id, content, format_time(now())],
            )?;
            conn.query_row(
                &format!(
                    "SELECT {COMMENT_COLUMNS} FROM task_comments c
                     LEFT JOIN profiles p ON p.user_id = c.user_id
                     WHERE c.id = ?1"
                ),
                params![id],
                parse_comment_row,
            )?
        };
        // the feed carries the bare row; subscribers resolve authors themselves
        self.publish(CommentEvent::Insert(Comment {
            author_name: None,
            author_avatar_url: None,
            ..comment.clone()
        }));
        Ok(comment)
    }

    /// Authors delete their own comments; the notebook owner may delete any.
    pub fn delete_comment(&self, user_id: &str, comment_id: &str) -> AppResult<()> {
        let task_id = {
            let conn = self.lock()?;
            let (task_id, author_id): (String, String) = conn
                .query_row(
                    "SELECT task_id, user_id FROM task_comments WHERE id = ?1",
                    params![comment_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| AppError::NotFound(format!("comment {comment_id}")))?;
            let notebook_id = notebook_of(&conn, EntityKind::Task, &task_id)?;
            if author_id != user_id {
                require_capability(&conn, &notebook_id, user_id, Capability::ManageNotebook)?;
            }
            conn.execute("DELETE FROM task_comments WHERE id = ?1", params![comment_id])?;
            task_id
        };
        self.publish(CommentEvent::Delete {
            id: comment_id.to_string(),
            task_id,
        });
        Ok(())
    }

    pub fn last_read_at(&self, user_id: &str, task_id: &str) -> AppResult<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT last_read_at FROM comment_reads WHERE task_id = ?1 AND user_id = ?2",
                params![task_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.as_deref().map(parse_time).transpose()?)
    }

    pub fn mark_read(&self, user_id: &str, task_id: &str, at: DateTime<Utc>) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO comment_reads (task_id, user_id, last_read_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(task_id, user_id) DO UPDATE SET last_read_at = excluded.last_read_at",
            params![task_id, user_id, format_time(at)],
        )?;
        Ok(())
    }

    pub fn subscribe_comments(&self, task_id: &str) -> CommentFeed {
        CommentFeed::new(task_id, self.comment_feed.subscribe())
    }
}

#[derive(Debug, Clone)]
pub struct DbSession {
    db: Arc<Database>,
    user_id: String,
}

impl DbSession {
    async fn blocking<T, F>(&self, call: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &str) -> AppResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let user_id = self.user_id.clone();
        tokio::task::spawn_blocking(move || call(&db, &user_id))
            .await
            .map_err(|error| AppError::Internal(format!("database task failed: {error}")))?
    }
}

#[async_trait]
impl DurableStore for DbSession {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn fetch_forest(&self) -> AppResult<ForestRows> {
        self.blocking(|db, user| db.fetch_forest(user)).await
    }

    async fn create_notebook(&self, title: &str) -> AppResult<Notebook> {
        let title = title.to_string();
        self.blocking(move |db, user| db.create_notebook(user, &title)).await
    }

    async fn rename_notebook(&self, notebook_id: &str, title: &str) -> AppResult<Notebook> {
        let (notebook_id, title) = (notebook_id.to_string(), title.to_string());
        self.blocking(move |db, user| db.rename_notebook(user, &notebook_id, &title))
            .await
    }

    async fn delete_notebook(&self, notebook_id: &str) -> AppResult<()> {
        let notebook_id = notebook_id.to_string();
        self.blocking(move |db, user| db.delete_notebook(user, &notebook_id)).await
    }

    async fn create_note(&self, notebook_id: &str, title: &str) -> AppResult<Note> {
        let (notebook_id, title) = (notebook_id.to_string(), title.to_string());
        self.blocking(move |db, user| db.create_note(user, &notebook_id, &title)).await
    }

    async fn rename_note(&self, note_id: &str, title: &str) -> AppResult<Note> {
        let (note_id, title) = (note_id.to_string(), title.to_string());
        self.blocking(move |db, user| db.rename_note(user, &note_id, &title)).await
    }

    async fn delete_note(&self, note_id: &str) -> AppResult<()> {
        let note_id = note_id.to_string();
        self.blocking(move |db, user| db.delete_note(user, &note_id)).await
    }

    async fn create_folder(&self, note_id: &str, title: &str) -> AppResult<TaskFolder> {
        let (note_id, title) = (note_id.to_string(), title.to_string());
        self.blocking(move |db, user| db.create_folder(user, &note_id, &title)).await
    }

    async fn rename_folder(&self, folder_id: &str, title: &str) -> AppResult<TaskFolder> {
        let (folder_id, title) = (folder_id.to_string(), title.to_string());
        self.blocking(move |db, user| db.rename_folder(user, &folder_id, &title)).await
    }

    async fn set_folder_collapsed(&self, folder_id: &str, collapsed: bool) -> AppResult<TaskFolder> {
        let folder_id = folder_id.to_string();
        self.blocking(move |db, user| db.set_folder_collapsed(user, &folder_id, collapsed))
            .await
    }

    async fn delete_folder(&self, folder_id: &str) -> AppResult<()> {
        let folder_id = folder_id.to_string();
        self.blocking(move |db, user| db.delete_folder(user, &folder_id)).await
    }

    async fn create_task(&self, note_id: &str, folder_id: Option<&str>, title: &str) -> AppResult<Task> {
        let (note_id, title) = (note_id.to_string(), title.to_string());
        let folder_id = folder_id.map(ToString::to_string);
        self.blocking(move |db, user| db.create_task(user, &note_id, folder_id.as_deref(), &title))
            .await
    }

    async fn rename_task(&self, task_id: &str, title: &str) -> AppResult<Task> {
        let (task_id, title) = (task_id.to_string(), title.to_string());
        self.blocking(move |db, user| db.rename_task(user, &task_id, &title)).await
    }

    async fn delete_task(&self, task_id: &str) -> AppResult<()> {
        let task_id = task_id.to_string();
        self.blocking(move |db, user| db.delete_task(user, &task_id)).await
    }

    async fn update_order_indices(&self, kind: EntityKind, updates: &[(String, i64)]) -> AppResult<()> {
        let updates = updates.to_vec();
        self.blocking(move |db, user| db.update_order_indices(user, kind, &updates))
            .await
    }

    async fn reorder_notes(&self, notebook_id: &str, ordered_note_ids: &[String]) -> AppResult<()> {
        let notebook_id = notebook_id.to_string();
        let ordered = ordered_note_ids.to_vec();
        self.blocking(move |db, user| db.reorder_notes(user, &notebook_id, &ordered))
            .await
    }

    async fn reorder_tasks(&self, ordered_task_ids: &[String]) -> AppResult<()> {
        let ordered = ordered_task_ids.to_vec();
        self.blocking(move |db, user| db.reorder_tasks(user, &ordered)).await
    }

    async fn move_task(&self, task_id: &str, folder_id: Option<&str>, order_index: i64) -> AppResult<()> {
        let task_id = task_id.to_string();
        let folder_id = folder_id.map(ToString::to_string);
        self.blocking(move |db, user| db.move_task(user, &task_id, folder_id.as_deref(), order_index))
            .await
    }

    async fn insert_completion(&self, task_id: &str) -> AppResult<Completion> {
        let task_id = task_id.to_string();
        self.blocking(move |db, user| db.insert_completion(user, &task_id)).await
    }

    async fn delete_completion(&self, task_id: &str) -> AppResult<()> {
        let task_id = task_id.to_string();
        self.blocking(move |db, user| db.delete_completion(user, &task_id)).await
    }

    async fn generate_share_code(&self, notebook_id: &str) -> AppResult<String> {
        let notebook_id = notebook_id.to_string();
        self.blocking(move |db, user| db.generate_share_code(user, &notebook_id))
            .await
    }

    async fn revoke_share_code(&self, notebook_id: &str) -> AppResult<()> {
        let notebook_id = notebook_id.to_string();
        self.blocking(move |db, user| db.revoke_share_code(user, &notebook_id)).await
    }

    async fn set_notebook_shared(&self, notebook_id: &str, shared: bool) -> AppResult<Notebook> {
        let notebook_id = notebook_id.to_string();
        self.blocking(move |db, user| db.set_notebook_shared(user, &notebook_id, shared))
            .await
    }

    async fn join_by_share_code(&self, code: &str) -> AppResult<NotebookMember> {
        let code = code.to_string();
        self.blocking(move |db, user| db.join_by_share_code(user, &code)).await
    }

    async fn list_members(&self, notebook_id: &str) -> AppResult<Vec<NotebookMember>> {
        let notebook_id = notebook_id.to_string();
        self.blocking(move |db, user| db.list_members(user, &notebook_id)).await
    }

    async fn set_member_role(&self, notebook_id: &str, user_id: &str, role: Role) -> AppResult<NotebookMember> {
        let (notebook_id, member_id) = (notebook_id.to_string(), user_id.to_string());
        self.blocking(move |db, user| db.set_member_role(user, &notebook_id, &member_id, role))
            .await
    }

    async fn remove_member(&self, notebook_id: &str, user_id: &str) -> AppResult<()> {
        let (notebook_id, member_id) = (notebook_id.to_string(), user_id.to_string());
        self.blocking(move |db, user| db.remove_member(user, &notebook_id, &member_id))
            .await
    }

    async fn list_comments(&self, task_id: &str) -> AppResult<Vec<Comment>> {
        let task_id = task_id.to_string();
        self.blocking(move |db, user| db.list_comments(user, &task_id)).await
    }

    async fn insert_comment(&self, task_id: &str, content: &str) -> AppResult<Comment> {
        let (task_id, content) = (task_id.to_string(), content.to_string());
        self.blocking(move |db, user| db.insert_comment(user, &task_id, &content))
            .await
    }

    async fn delete_comment(&self, comment_id: &str) -> AppResult<()> {
        let comment_id = comment_id.to_string();
        self.blocking(move |db, user| db.delete_comment(user, &comment_id)).await
    }

    async fn get_profile(&self, user_id: &str) -> AppResult<Option<Profile>> {
        let profile_id = user_id.to_string();
        self.blocking(move |db, _| db.get_profile(&profile_id)).await
    }

    async fn last_read_at(&self, task_id: &str) -> AppResult<Option<DateTime<Utc>>> {
        let task_id = task_id.to_string();
        self.blocking(move |db, user| db.last_read_at(user, &task_id)).await
    }

    async fn mark_read(&self, task_id: &str, at: DateTime<Utc>) -> AppResult<()> {
        let task_id = task_id.to_string();
        self.blocking(move |db, user| db.mark_read(user, &task_id, at)).await
    }

    fn subscribe_comments(&self, task_id: &str) -> CommentFeed {
        self.db.subscribe_comments(task_id)
    }
}

// ─── Access checks ──────────────────────────────────────────────────────────

fn notebook_role(conn: &Connection, notebook_id: &str, user_id: &str) -> AppResult<Option<Role>> {
    let notebook = load_notebook(conn, notebook_id)?;
    let member = conn
        .query_row(
            &format!(
                "SELECT {MEMBER_COLUMNS} FROM notebook_members m
                 LEFT JOIN profiles p ON p.user_id = m.user_id
                 WHERE m.notebook_id = ?1 AND m.user_id = ?2"
            ),
            params![notebook_id, user_id],
            parse_member_row,
        )
        .optional()?;
    Ok(resolve_role(&notebook, member.iter(), user_id))
}

fn require_capability(conn: &Connection, notebook_id: &str, user_id: &str, capability: Capability) -> AppResult<Role> {
    require(notebook_role(conn, notebook_id, user_id)?, capability)
}

fn require_member(conn: &Connection, notebook_id: &str, user_id: &str) -> AppResult<Role> {
    notebook_role(conn, notebook_id, user_id)?
        .ok_or_else(|| AppError::Authorization(format!("Not a member of notebook {notebook_id}")))
}

fn notebook_of(conn: &Connection, kind: EntityKind, id: &str) -> AppResult<String> {
    let sql = match kind {
        EntityKind::Notebook => "SELECT id FROM notebooks WHERE id = ?1",
        EntityKind::Note => "SELECT notebook_id FROM notes WHERE id = ?1",
        EntityKind::Folder => {
            "SELECT n.notebook_id FROM task_folders f JOIN notes n ON n.id = f.note_id WHERE f.id = ?1"
        }
        EntityKind::Task => "SELECT n.notebook_id FROM tasks t JOIN notes n ON n.id = t.note_id WHERE t.id = ?1",
    };
    conn.query_row(sql, params![id], |row| row.get(0))
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("{} {}", kind.table(), id)))
}

fn ensure_folder_in_note(conn: &Connection, folder_id: &str, note_id: &str) -> AppResult<()> {
    let owner_note: String = conn
        .query_row(
            "SELECT note_id FROM task_folders WHERE id = ?1",
            params![folder_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("task_folders {folder_id}")))?;
    if owner_note != note_id {
        return Err(AppError::Validation(format!(
            "Folder {folder_id} does not belong to note {note_id}"
        )));
    }
    Ok(())
}

fn load_notebook(conn: &Connection, notebook_id: &str) -> AppResult<Notebook> {
    conn.query_row(
        &format!("SELECT {NOTEBOOK_COLUMNS} FROM notebooks n WHERE n.id = ?1"),
        params![notebook_id],
        parse_notebook_row,
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(format!("notebooks {notebook_id}")))
}

fn load_member(conn: &Connection, notebook_id: &str, user_id: &str) -> AppResult<NotebookMember> {
    conn.query_row(
        &format!(
            "SELECT {MEMBER_COLUMNS} FROM notebook_members m
             LEFT JOIN profiles p ON p.user_id = m.user_id
             WHERE m.notebook_id = ?1 AND m.user_id = ?2"
        ),
        params![notebook_id, user_id],
        parse_member_row,
    )
    .map_err(AppError::from)
}

fn load_folder(conn: &Connection, folder_id: &str) -> AppResult<TaskFolder> {
    conn.query_row(
        &format!("SELECT {FOLDER_COLUMNS} FROM task_folders WHERE id = ?1"),
        params![folder_id],
        parse_folder_row,
    )
    .map_err(AppError::from)
}

fn load_completions(conn: &Connection, task_id: &str) -> AppResult<Vec<Completion>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COMPLETION_COLUMNS} FROM task_completions c
         LEFT JOIN profiles p ON p.user_id = c.user_id
         WHERE c.task_id = ?1 ORDER BY c.completed_at ASC"
    ))?;
    let rows = stmt.query_map(params![task_id], parse_completion_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ─── Row parsing ────────────────────────────────────────────────────────────

fn parse_notebook_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notebook> {
    let created_at: String = row.get(6)?;
    Ok(Notebook {
        id: row.get(0)?,
        title: row.get(1)?,
        owner_id: row.get(2)?,
        is_shared: row.get(3)?,
        share_code: row.get(4)?,
        order_index: row.get(5)?,
        created_at: parse_time(&created_at)?,
    })
}

fn parse_member_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotebookMember> {
    let role: String = row.get(3)?;
    let joined_at: String = row.get(4)?;
    Ok(NotebookMember {
        id: row.get(0)?,
        notebook_id: row.get(1)?,
        user_id: row.get(2)?,
        role: parse_role(&role)?,
        joined_at: parse_time(&joined_at)?,
        name: row.get(5)?,
        avatar_url: row.get(6)?,
    })
}

fn parse_note_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Note> {
    let created_at: String = row.get(4)?;
    Ok(Note {
        id: row.get(0)?,
        notebook_id: row.get(1)?,
        title: row.get(2)?,
        order_index: row.get(3)?,
        created_at: parse_time(&created_at)?,
    })
}

fn parse_folder_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskFolder> {
    let created_at: String = row.get(5)?;
    Ok(TaskFolder {
        id: row.get(0)?,
        note_id: row.get(1)?,
        title: row.get(2)?,
        order_index: row.get(3)?,
        is_collapsed: row.get(4)?,
        created_at: parse_time(&created_at)?,
    })
}

fn parse_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let created_at: String = row.get(5)?;
    Ok(Task {
        id: row.get(0)?,
        note_id: row.get(1)?,
        folder_id: row.get(2)?,
        title: row.get(3)?,
        order_index: row.get(4)?,
        created_at: parse_time(&created_at)?,
        completions: Vec::new(),
    })
}

fn parse_completion_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Completion> {
    let completed_at: String = row.get(3)?;
    Ok(Completion {
        id: row.get(0)?,
        task_id: row.get(1)?,
        user_id: row.get(2)?,
        completed_at: parse_time(&completed_at)?,
        name: row.get(4)?,
        avatar_url: row.get(5)?,
    })
}

fn parse_comment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Comment> {
    let created_at: String = row.get(4)?;
    Ok(Comment {
        id: row.get(0)?,
        task_id: row.get(1)?,
        user_id: row.get(2)?,
        content: row.get(3)?,
        created_at: parse_time(&created_at)?,
        author_name: row.get(5)?,
        author_avatar_url: row.get(6)?,
    })
}

fn parse_role(raw: &str) -> rusqlite::Result<Role> {
    Role::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown role '{raw}'"),
            )),
        )
    })
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
        })
}

/// Fixed-width micros so stored timestamps sort lexically.
fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::durable::{DurableStore, FeedMessage};
    use crate::errors::{AppError, JoinConflict};
    use crate::models::{CommentEvent, EntityKind, Profile, Role};
    use std::sync::Arc;

    fn open() -> (tempfile::TempDir, Arc<Database>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db"), 16).expect("db");
        for user in ["alice", "bob", "carol"] {
            db.upsert_profile(&Profile {
                user_id: user.to_string(),
                name: user.to_uppercase(),
                email: format!("{user}@example.com"),
                avatar_url: None,
            })
            .expect("profile");
        }
        (dir, Arc::new(db))
    }

    #[test]
    fn forest_fetch_returns_only_visible_notebooks() {
        let (_dir, db) = open();
        let mine = db.create_notebook("alice", "Mine").expect("notebook");
        db.create_notebook("bob", "Bob's").expect("notebook");
        let note = db.create_note("alice", &mine.id, "Week").expect("note");
        let task = db.create_task("alice", &note.id, None, "Milk").expect("task");
        db.insert_completion("alice", &task.id).expect("complete");

        let rows = db.fetch_forest("alice").expect("fetch");
        assert_eq!(rows.notebooks.len(), 1);
        assert_eq!(rows.notes.len(), 1);
        assert_eq!(rows.tasks.len(), 1);
        assert_eq!(rows.tasks[0].completions.len(), 1);
        assert_eq!(rows.tasks[0].completions[0].name.as_deref(), Some("ALICE"));
    }

    #[test]
    fn created_items_append_to_their_container() {
        let (_dir, db) = open();
        let notebook = db.create_notebook("alice", "Trip").expect("notebook");
        let note = db.create_note("alice", &notebook.id, "Packing").expect("note");
        let folder = db.create_folder("alice", &note.id, "Clothes").expect("folder");
        let first = db.create_task("alice", &note.id, None, "Passport").expect("task");
        let second = db.create_task("alice", &note.id, None, "Tickets").expect("task");
        let in_folder = db.create_task("alice", &note.id, Some(&folder.id), "Socks").expect("task");
        assert_eq!(first.order_index, 0);
        assert_eq!(second.order_index, 1);
        assert_eq!(in_folder.order_index, 0);
    }

    #[test]
    fn readers_cannot_edit_structure() {
        let (_dir, db) = open();
        let notebook = db.create_notebook("alice", "Shared").expect("notebook");
        let code = db.generate_share_code("alice", &notebook.id).expect("code");
        db.join_by_share_code("bob", &code).expect("join");

        let err = db.create_note("bob", &notebook.id, "Nope").expect_err("reader denied");
        assert!(matches!(err, AppError::Authorization(_)));

        db.set_member_role("alice", &notebook.id, "bob", Role::Admin).expect("promote");
        db.create_note("bob", &notebook.id, "Now allowed").expect("admin creates");
        let err = db
            .set_member_role("bob", &notebook.id, "alice", Role::Reader)
            .expect_err("admin cannot manage members");
        assert!(matches!(err, AppError::Authorization(_)));
    }

    #[test]
    fn join_failures_are_distinguishable_and_create_no_rows() {
        let (_dir, db) = open();
        let notebook = db.create_notebook("alice", "Shared").expect("notebook");

        let invalid = db.join_by_share_code("bob", "ZZZZZZZZ").expect_err("unknown code");
        assert!(matches!(invalid, AppError::JoinConflict(JoinConflict::InvalidCode)));
        let malformed = db.join_by_share_code("bob", "0O1I").expect_err("malformed");
        assert!(matches!(malformed, AppError::JoinConflict(JoinConflict::InvalidCode)));

        let code = db.generate_share_code("alice", &notebook.id).expect("code");
        db.set_notebook_shared("alice", &notebook.id, false).expect("unshare");
        let not_shared = db.join_by_share_code("bob", &code).expect_err("not shared");
        assert!(matches!(not_shared, AppError::JoinConflict(JoinConflict::NotShared)));

        let owner = db.join_by_share_code("alice", &code).expect_err("owner");
        assert!(matches!(owner, AppError::JoinConflict(JoinConflict::NotShared)));

        db.set_notebook_shared("alice", &notebook.id, true).expect("reshare");
        let already = db.join_by_share_code("alice", &code.to_lowercase()).expect_err("owner is member");
        assert!(matches!(already, AppError::JoinConflict(JoinConflict::AlreadyMember)));
        assert!(db.list_members("alice", &notebook.id).expect("members").is_empty());

        db.join_by_share_code("bob", &code).expect("join");
        let twice = db.join_by_share_code("bob", &code).expect_err("second join");
        assert!(matches!(twice, AppError::JoinConflict(JoinConflict::AlreadyMember)));
        assert_eq!(db.list_members("alice", &notebook.id).expect("members").len(), 1);
    }

    #[test]
    fn folder_delete_detaches_tasks_and_note_delete_cascades() {
        let (_dir, db) = open();
        let notebook = db.create_notebook("alice", "Home").expect("notebook");
        let note = db.create_note("alice", &notebook.id, "Chores").expect("note");
        let folder = db.create_folder("alice", &note.id, "Kitchen").expect("folder");
        let task = db.create_task("alice", &note.id, Some(&folder.id), "Dishes").expect("task");
        db.insert_comment("alice", &task.id, "soon").expect("comment");

        db.delete_folder("alice", &folder.id).expect("delete folder");
        let rows = db.fetch_forest("alice").expect("fetch");
        assert_eq!(rows.tasks.len(), 1);
        assert_eq!(rows.tasks[0].folder_id, None);

        db.delete_note("alice", &note.id).expect("delete note");
        let rows = db.fetch_forest("alice").expect("fetch");
        assert!(rows.tasks.is_empty());
        assert!(rows.comment_summaries.is_empty());
    }

    #[test]
    fn reorder_rpcs_assign_sequential_indices() {
        let (_dir, db) = open();
        let notebook = db.create_notebook("alice", "List").expect("notebook");
        let note = db.create_note("alice", &notebook.id, "Items").expect("note");
        let ids = ["a", "b", "c"]
            .iter()
            .map(|title| db.create_task("alice", &note.id, None, title).expect("task").id)
            .collect::<Vec<_>>();
        let reversed = ids.iter().rev().cloned().collect::<Vec<_>>();
        db.reorder_tasks("alice", &reversed).expect("reorder");

        let rows = db.fetch_forest("alice").expect("fetch");
        for (index, id) in reversed.iter().enumerate() {
            let task = rows.tasks.iter().find(|task| &task.id == id).expect("task");
            assert_eq!(task.order_index, index as i64);
        }

        let folder = db.create_folder("alice", &note.id, "F").expect("folder");
        db.update_order_indices("alice", EntityKind::Folder, &[(folder.id.clone(), 7)])
            .expect("folder index");
        let rows = db.fetch_forest("alice").expect("fetch");
        assert_eq!(rows.folders[0].order_index, 7);
    }

    #[test]
    fn completion_insert_is_unique_per_user() {
        let (_dir, db) = open();
        let notebook = db.create_notebook("alice", "List").expect("notebook");
        let note = db.create_note("alice", &notebook.id, "Items").expect("note");
        let task = db.create_task("alice", &note.id, None, "a").expect("task");
        let first = db.insert_completion("alice", &task.id).expect("complete");
        let second = db.insert_completion("alice", &task.id).expect("complete again");
        assert_eq!(first.id, second.id);
        db.delete_completion("alice", &task.id).expect("uncomplete");
        let rows = db.fetch_forest("alice").expect("fetch");
        assert!(rows.tasks[0].completions.is_empty());
    }

    #[tokio::test]
    async fn comment_feed_delivers_inserts_and_deletes_for_one_task() {
        let (_dir, db) = open();
        let notebook = db.create_notebook("alice", "List").expect("notebook");
        let note = db.create_note("alice", &notebook.id, "Items").expect("note");
        let task = db.create_task("alice", &note.id, None, "a").expect("task");
        let other = db.create_task("alice", &note.id, None, "b").expect("task");

        let session = db.session("alice");
        let mut feed = session.subscribe_comments(&task.id);
        session.insert_comment(&other.id, "elsewhere").await.expect("comment");
        let comment = session.insert_comment(&task.id, "hello").await.expect("comment");
        assert_eq!(comment.author_name.as_deref(), Some("ALICE"));
        session.delete_comment(&comment.id).await.expect("delete");

        let Some(FeedMessage::Event(CommentEvent::Insert(pushed))) = feed.next().await else {
            panic!("expected insert");
        };
        assert_eq!(pushed.id, comment.id);
        assert_eq!(
            feed.next().await,
            Some(FeedMessage::Event(CommentEvent::Delete {
                id: comment.id.clone(),
                task_id: task.id.clone(),
            }))
        );
    }

    #[test]
    fn unread_summary_follows_last_read_marker() {
        let (_dir, db) = open();
        let notebook = db.create_notebook("alice", "List").expect("notebook");
        let note = db.create_note("alice", &notebook.id, "Items").expect("note");
        let task = db.create_task("alice", &note.id, None, "a").expect("task");
        let comment = db.insert_comment("alice", &task.id, "hi").expect("comment");

        let rows = db.fetch_forest("alice").expect("fetch");
        assert!(rows.comment_summaries[0].has_unread());
        assert_eq!(rows.comment_summaries[0].count, 1);

        db.mark_read("alice", &task.id, comment.created_at).expect("mark");
        let rows = db.fetch_forest("alice").expect("fetch");
        assert!(!rows.comment_summaries[0].has_unread());
        assert_eq!(
            db.last_read_at("alice", &task.id).expect("read"),
            Some(comment.created_at)
        );
    }

    #[test]
    fn members_may_leave_but_owner_may_not_be_removed() {
        let (_dir, db) = open();
        let notebook = db.create_notebook("alice", "Shared").expect("notebook");
        let code = db.generate_share_code("alice", &notebook.id).expect("code");
        db.join_by_share_code("bob", &code).expect("join");
        db.join_by_share_code("carol", &code).expect("join");

        let err = db.remove_member("bob", &notebook.id, "carol").expect_err("reader cannot remove");
        assert!(matches!(err, AppError::Authorization(_)));
        db.remove_member("bob", &notebook.id, "bob").expect("leave");
        let err = db.remove_member("alice", &notebook.id, "alice").expect_err("owner stays");
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(db.list_members("alice", &notebook.id).expect("members").len(), 1);
    }
}
