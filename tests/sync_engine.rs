use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notebook_sync_lib::config::EngineConfig;
use notebook_sync_lib::coordinator::MutationCoordinator;
use notebook_sync_lib::db::{Database, DbSession};
use notebook_sync_lib::durable::{CommentFeed, DurableStore};
use notebook_sync_lib::errors::{AppError, AppResult, JoinConflict};
use notebook_sync_lib::models::{
    Comment, Completion, Container, CreateTaskPayload, DropTarget, EntityKind, ForestRows, MoveTaskRequest, Note,
    Notebook, NotebookMember, NotificationLevel, Profile, ReorderRequest, Role, Task, TaskFolder,
};
use notebook_sync_lib::store::EntityStore;
use notebook_sync_lib::Engine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

/// Delegates to a real session and fails selected calls on demand.
struct FlakyStore {
    inner: DbSession,
    fail_fetch: AtomicBool,
    fail_reorder: AtomicBool,
    fail_comments: AtomicBool,
    hold_reorder: AtomicBool,
    release: Notify,
    hold_profile: AtomicBool,
    lookup_started: Notify,
    release_profile: Notify,
}

impl FlakyStore {
    fn new(inner: DbSession) -> Self {
        Self {
            inner,
            fail_fetch: AtomicBool::new(false),
            fail_reorder: AtomicBool::new(false),
            fail_comments: AtomicBool::new(false),
            hold_reorder: AtomicBool::new(false),
            release: Notify::new(),
            hold_profile: AtomicBool::new(false),
            lookup_started: Notify::new(),
            release_profile: Notify::new(),
        }
    }
}

fn transient() -> AppError {
    AppError::Io("connection reset by peer".to_string())
}

#[async_trait]
impl DurableStore for FlakyStore {
    fn user_id(&self) -> &str {
        self.inner.user_id()
    }

    async fn fetch_forest(&self) -> AppResult<ForestRows> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(transient());
        }
        self.inner.fetch_forest().await
    }

    async fn create_notebook(&self, title: &str) -> AppResult<Notebook> {
        self.inner.create_notebook(title).await
    }

    async fn rename_notebook(&self, notebook_id: &str, title: &str) -> AppResult<Notebook> {
        self.inner.rename_notebook(notebook_id, title).await
    }

    async fn delete_notebook(&self, notebook_id: &str) -> AppResult<()> {
        self.inner.delete_notebook(notebook_id).await
    }

    async fn create_note(&self, notebook_id: &str, title: &str) -> AppResult<Note> {
        self.inner.create_note(notebook_id, title).await
    }

    async fn rename_note(&self, note_id: &str, title: &str) -> AppResult<Note> {
        self.inner.rename_note(note_id, title).await
    }

    async fn delete_note(&self, note_id: &str) -> AppResult<()> {
        self.inner.delete_note(note_id).await
    }

    async fn create_folder(&self, note_id: &str, title: &str) -> AppResult<TaskFolder> {
        self.inner.create_folder(note_id, title).await
    }

    async fn rename_folder(&self, folder_id: &str, title: &str) -> AppResult<TaskFolder> {
        self.inner.rename_folder(folder_id, title).await
    }

    async fn set_folder_collapsed(&self, folder_id: &str, collapsed: bool) -> AppResult<TaskFolder> {
        self.inner.set_folder_collapsed(folder_id, collapsed).await
    }

    async fn delete_folder(&self, folder_id: &str) -> AppResult<()> {
        self.inner.delete_folder(folder_id).await
    }

    async fn create_task(&self, note_id: &str, folder_id: Option<&str>, title: &str) -> AppResult<Task> {
        self.inner.create_task(note_id, folder_id, title).await
    }

    async fn rename_task(&self, task_id: &str, title: &str) -> AppResult<Task> {
        self.inner.rename_task(task_id, title).await
    }

    async fn delete_task(&self, task_id: &str) -> AppResult<()> {
        self.inner.delete_task(task_id).await
    }

    async fn update_order_indices(&self, kind: EntityKind, updates: &[(String, i64)]) -> AppResult<()> {
        self.inner.update_order_indices(kind, updates).await
    }

    async fn reorder_notes(&self, notebook_id: &str, ordered_note_ids: &[String]) -> AppResult<()> {
        self.inner.reorder_notes(notebook_id, ordered_note_ids).await
    }

    async fn reorder_tasks(&self, ordered_task_ids: &[String]) -> AppResult<()> {
        if self.hold_reorder.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        if self.fail_reorder.load(Ordering::SeqCst) {
            return Err(transient());
        }
        self.inner.reorder_tasks(ordered_task_ids).await
    }

    async fn move_task(&self, task_id: &str, folder_id: Option<&str>, order_index: i64) -> AppResult<()> {
        self.inner.move_task(task_id, folder_id, order_index).await
    }

    async fn insert_completion(&self, task_id: &str) -> AppResult<Completion> {
        self.inner.insert_completion(task_id).await
    }

    async fn delete_completion(&self, task_id: &str) -> AppResult<()> {
        self.inner.delete_completion(task_id).await
    }

    async fn generate_share_code(&self, notebook_id: &str) -> AppResult<String> {
        self.inner.generate_share_code(notebook_id).await
    }

    async fn revoke_share_code(&self, notebook_id: &str) -> AppResult<()> {
        self.inner.revoke_share_code(notebook_id).await
    }

    async fn set_notebook_shared(&self, notebook_id: &str, shared: bool) -> AppResult<Notebook> {
        self.inner.set_notebook_shared(notebook_id, shared).await
    }

    async fn join_by_share_code(&self, code: &str) -> AppResult<NotebookMember> {
        self.inner.join_by_share_code(code).await
    }

    async fn list_members(&self, notebook_id: &str) -> AppResult<Vec<NotebookMember>> {
        self.inner.list_members(notebook_id).await
    }

    async fn set_member_role(&self, notebook_id: &str, user_id: &str, role: Role) -> AppResult<NotebookMember> {
        self.inner.set_member_role(notebook_id, user_id, role).await
    }

    async fn remove_member(&self, notebook_id: &str, user_id: &str) -> AppResult<()> {
        self.inner.remove_member(notebook_id, user_id).await
    }

    async fn list_comments(&self, task_id: &str) -> AppResult<Vec<Comment>> {
        self.inner.list_comments(task_id).await
    }

    async fn insert_comment(&self, task_id: &str, content: &str) -> AppResult<Comment> {
        if self.fail_comments.load(Ordering::SeqCst) {
            return Err(transient());
        }
        let comment = self.inner.insert_comment(task_id, content).await?;
        if self.hold_profile.load(Ordering::SeqCst) {
            // answer only once the echo's author lookup is under way
            self.lookup_started.notified().await;
        }
        Ok(comment)
    }

    async fn delete_comment(&self, comment_id: &str) -> AppResult<()> {
        self.inner.delete_comment(comment_id).await
    }

    async fn get_profile(&self, user_id: &str) -> AppResult<Option<Profile>> {
        if self.hold_profile.load(Ordering::SeqCst) {
            self.lookup_started.notify_one();
            self.release_profile.notified().await;
        }
        self.inner.get_profile(user_id).await
    }

    async fn last_read_at(&self, task_id: &str) -> AppResult<Option<DateTime<Utc>>> {
        self.inner.last_read_at(task_id).await
    }

    async fn mark_read(&self, task_id: &str, at: DateTime<Utc>) -> AppResult<()> {
        self.inner.mark_read(task_id, at).await
    }

    fn subscribe_comments(&self, task_id: &str) -> CommentFeed {
        self.inner.subscribe_comments(task_id)
    }
}

struct World {
    _dir: tempfile::TempDir,
    db: Arc<Database>,
    notebook_id: String,
    note_id: String,
    code: String,
}

/// Alice owns a shared notebook with one note; bob and carol have profiles.
fn world() -> World {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Arc::new(Database::new(&dir.path().join("sync.db"), 64).expect("db"));
    for user in ["alice", "bob", "carol"] {
        db.upsert_profile(&Profile {
            user_id: user.to_string(),
            name: format!("{user} example"),
            email: format!("{user}@example.com"),
            avatar_url: None,
        })
        .expect("profile");
    }
    let notebook = db.create_notebook("alice", "Weekend").expect("notebook");
    let note = db.create_note("alice", &notebook.id, "Saturday").expect("note");
    let code = db.generate_share_code("alice", &notebook.id).expect("code");
    World {
        _dir: dir,
        db,
        notebook_id: notebook.id,
        note_id: note.id,
        code,
    }
}

fn root_titles(store: &EntityStore, note_id: &str) -> Vec<String> {
    titles(store, note_id, None)
}

fn titles(store: &EntityStore, note_id: &str, folder_id: Option<&str>) -> Vec<String> {
    let forest = store.snapshot();
    forest
        .container_ids(&Container::Tasks {
            note_id: note_id.to_string(),
            folder_id: folder_id.map(ToString::to_string),
        })
        .into_iter()
        .map(|id| forest.task(&id).expect("task").title.clone())
        .collect()
}

#[tokio::test]
async fn failed_reorder_rolls_back_to_the_snapshot() {
    let world = world();
    for title in ["A", "B", "C"] {
        world.db.create_task("alice", &world.note_id, None, title).expect("task");
    }
    let flaky = Arc::new(FlakyStore::new(world.db.session("alice")));
    let (notifications, mut notices) = broadcast::channel(16);
    let store = EntityStore::new();
    let coordinator = Arc::new(MutationCoordinator::new(
        store.clone(),
        Arc::clone(&flaky) as Arc<dyn DurableStore>,
        notifications,
        true,
    ));
    coordinator.start().await;
    assert_eq!(root_titles(&store, &world.note_id), vec!["A", "B", "C"]);

    flaky.hold_reorder.store(true, Ordering::SeqCst);
    flaky.fail_reorder.store(true, Ordering::SeqCst);
    let running = {
        let coordinator = Arc::clone(&coordinator);
        let note_id = world.note_id.clone();
        tokio::spawn(async move {
            coordinator
                .reorder(ReorderRequest {
                    container: Container::Tasks { note_id, folder_id: None },
                    from: 1,
                    to: 0,
                })
                .await
        })
    };

    let mut watcher = store.subscribe();
    tokio::time::timeout(
        Duration::from_secs(2),
        watcher.wait_for(|forest| {
            let ids = forest.container_ids(&Container::Tasks {
                note_id: world.note_id.clone(),
                folder_id: None,
            });
            ids.first().and_then(|id| forest.task(id)).is_some_and(|task| task.title == "B")
        }),
    )
    .await
    .expect("optimistic order visible")
    .expect("store alive");
    assert_eq!(root_titles(&store, &world.note_id), vec!["B", "A", "C"]);

    flaky.release.notify_one();
    let outcome = running.await.expect("join");
    assert!(matches!(outcome, Err(AppError::Io(_))));
    assert_eq!(root_titles(&store, &world.note_id), vec!["A", "B", "C"]);
    let notice = notices.try_recv().expect("failure notice");
    assert_eq!(notice.level, NotificationLevel::Error);
}

#[tokio::test]
async fn join_failures_are_distinguishable_and_leave_no_member_rows() {
    let world = world();
    let bob = Engine::with_store(EngineConfig::default(), Arc::clone(&world.db), "bob").await;
    let mut notices = bob.subscribe_notifications();

    let err = bob
        .coordinator()
        .join_by_share_code("QQQQQQQQ")
        .await
        .expect_err("unknown code");
    assert!(matches!(err, AppError::JoinConflict(JoinConflict::InvalidCode)));
    let invalid_notice = notices.try_recv().expect("notice");

    world
        .db
        .set_notebook_shared("alice", &world.notebook_id, false)
        .expect("unshare");
    let err = bob
        .coordinator()
        .join_by_share_code(&world.code)
        .await
        .expect_err("not shared");
    assert!(matches!(err, AppError::JoinConflict(JoinConflict::NotShared)));
    let not_shared_notice = notices.try_recv().expect("notice");
    assert_ne!(invalid_notice.message, not_shared_notice.message);
    assert!(world.db.list_members("alice", &world.notebook_id).expect("members").is_empty());
    assert!(bob.views().is_empty());

    world
        .db
        .set_notebook_shared("alice", &world.notebook_id, true)
        .expect("reshare");
    bob.coordinator()
        .join_by_share_code(&format!(" {} ", world.code.to_lowercase()))
        .await
        .expect("join");
    assert_eq!(bob.views().len(), 1);
    let err = bob
        .coordinator()
        .join_by_share_code(&world.code)
        .await
        .expect_err("already member");
    assert!(matches!(err, AppError::JoinConflict(JoinConflict::AlreadyMember)));
    assert_eq!(world.db.list_members("alice", &world.notebook_id).expect("members").len(), 1);
}

#[tokio::test]
async fn sending_a_comment_and_receiving_its_echo_yields_one_entry() {
    let world = world();
    let task = world.db.create_task("alice", &world.note_id, None, "Pack").expect("task");
    let alice = Engine::with_store(EngineConfig::default(), Arc::clone(&world.db), "alice").await;

    let thread = alice.open_thread(&task.id).await.expect("open");
    let mut receiver = thread.subscribe();
    let sent = thread.send("bring snacks").await.expect("send");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = tokio::time::timeout(
        Duration::from_secs(2),
        receiver.wait_for(|state| {
            !state.comments.is_empty() && state.comments.iter().all(|comment| comment.id == sent.id)
        }),
    )
    .await
    .expect("settled")
    .expect("open")
    .clone();
    assert_eq!(state.comments.len(), 1);

    let view_count = alice.views()[0].notes[0].root_tasks[0].comment_count;
    assert_eq!(view_count, 1);
    assert!(!alice.views()[0].notes[0].root_tasks[0].has_unread);
    thread.close().await;
}

#[tokio::test]
async fn failed_comment_send_restores_the_draft() {
    let world = world();
    let task = world.db.create_task("alice", &world.note_id, None, "Pack").expect("task");
    let flaky = Arc::new(FlakyStore::new(world.db.session("alice")));
    flaky.fail_comments.store(true, Ordering::SeqCst);
    let (notifications, mut notices) = broadcast::channel(16);

    let thread = notebook_sync_lib::comments::CommentThread::open(
        Arc::clone(&flaky) as Arc<dyn DurableStore>,
        EntityStore::new(),
        notifications,
        &task.id,
    )
    .await
    .expect("open");
    thread.set_draft("bring snacks");
    let err = thread.send("bring snacks").await.expect_err("send fails");
    assert!(matches!(err, AppError::Io(_)));

    let state = thread.snapshot();
    assert!(state.comments.is_empty());
    assert_eq!(state.draft, "bring snacks");
    assert_eq!(notices.try_recv().expect("notice").level, NotificationLevel::Error);
    thread.close().await;
}

#[tokio::test]
async fn author_lookup_finishing_after_send_settles_keeps_one_entry() {
    let world = world();
    let task = world.db.create_task("alice", &world.note_id, None, "Pack").expect("task");
    let flaky = Arc::new(FlakyStore::new(world.db.session("alice")));
    let (notifications, _) = broadcast::channel(16);
    let thread = notebook_sync_lib::comments::CommentThread::open(
        Arc::clone(&flaky) as Arc<dyn DurableStore>,
        EntityStore::new(),
        notifications,
        &task.id,
    )
    .await
    .expect("open");

    flaky.hold_profile.store(true, Ordering::SeqCst);
    let sent = thread.send("meet at noon").await.expect("send");
    let ids = thread
        .snapshot()
        .comments
        .iter()
        .map(|comment| comment.id.clone())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![sent.id.clone()]);

    flaky.hold_profile.store(false, Ordering::SeqCst);
    flaky.release_profile.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = thread.snapshot();
    assert_eq!(state.comments.len(), 1);
    assert_eq!(state.comments[0].id, sent.id);
    thread.close().await;
}

#[tokio::test]
async fn open_thread_stays_read_across_a_refetch() {
    let world = world();
    world.db.join_by_share_code("bob", &world.code).expect("bob joins");
    let task = world.db.create_task("alice", &world.note_id, None, "Tent").expect("task");
    let alice = Engine::with_store(EngineConfig::default(), Arc::clone(&world.db), "alice").await;
    let thread = alice.open_thread(&task.id).await.expect("open");
    let mut receiver = thread.subscribe();

    let posted = world.db.insert_comment("bob", &task.id, "got the tent").expect("bob comments");
    tokio::time::timeout(
        Duration::from_secs(2),
        receiver.wait_for(|state| state.contains(&posted.id)),
    )
    .await
    .expect("delivered")
    .expect("open");
    tokio::time::timeout(Duration::from_secs(2), async {
        while world
            .db
            .last_read_at("alice", &task.id)
            .expect("read marker")
            .map_or(true, |read| read < posted.created_at)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("read marker stored");

    alice.coordinator().refetch().await.expect("refetch");
    let summary = alice
        .store()
        .snapshot()
        .comment_summary(&task.id)
        .cloned()
        .expect("summary");
    assert_eq!(summary.count, 1);
    assert!(!summary.has_unread());
    thread.close().await;
}

#[tokio::test]
async fn unreachable_store_at_startup_degrades_to_empty_forest() {
    let world = world();
    let flaky = Arc::new(FlakyStore::new(world.db.session("alice")));
    flaky.fail_fetch.store(true, Ordering::SeqCst);
    let (notifications, mut notices) = broadcast::channel(16);
    let store = EntityStore::new();
    let coordinator = MutationCoordinator::new(store.clone(), flaky, notifications, true);

    coordinator.start().await;
    assert!(store.snapshot().is_empty());
    assert_eq!(notices.try_recv().expect("notice").level, NotificationLevel::Error);
}

#[tokio::test]
async fn round_trip_through_root_keeps_folder_order() {
    let world = world();
    let folder = world.db.create_folder("alice", &world.note_id, "Bag").expect("folder");
    for title in ["X", "Y", "Z"] {
        world
            .db
            .create_task("alice", &world.note_id, Some(&folder.id), title)
            .expect("task");
    }
    let alice = Engine::with_store(EngineConfig::default(), Arc::clone(&world.db), "alice").await;
    let forest = alice.store().snapshot();
    let y = forest
        .tasks_in_note(&world.note_id)
        .into_iter()
        .find(|task| task.title == "Y")
        .expect("Y")
        .id
        .clone();

    alice
        .coordinator()
        .move_task(MoveTaskRequest {
            task_id: y.clone(),
            target: DropTarget::Container {
                note_id: world.note_id.clone(),
                folder_id: None,
            },
        })
        .await
        .expect("to root");
    assert_eq!(root_titles(alice.store(), &world.note_id), vec!["Y"]);
    assert_eq!(titles(alice.store(), &world.note_id, Some(&folder.id)), vec!["X", "Z"]);

    alice
        .coordinator()
        .move_task(MoveTaskRequest {
            task_id: y,
            target: DropTarget::Container {
                note_id: world.note_id.clone(),
                folder_id: Some(folder.id.clone()),
            },
        })
        .await
        .expect("back to folder");
    assert!(root_titles(alice.store(), &world.note_id).is_empty());
    assert_eq!(titles(alice.store(), &world.note_id, Some(&folder.id)), vec!["X", "Z", "Y"]);
}

#[tokio::test]
async fn progress_counts_the_viewers_completions() {
    let world = world();
    let alice = Engine::with_store(EngineConfig::default(), Arc::clone(&world.db), "alice").await;
    assert_eq!(alice.note_progress(&world.note_id).percentage, 0);

    let mut tasks = Vec::new();
    for title in ["one", "two", "three", "four"] {
        let task = alice
            .coordinator()
            .create_task(CreateTaskPayload {
                note_id: world.note_id.clone(),
                folder_id: None,
                title: title.to_string(),
            })
            .await
            .expect("task");
        tasks.push(task);
    }
    alice.coordinator().toggle_completion(&tasks[0].id).await.expect("toggle");

    let progress = alice.note_progress(&world.note_id);
    assert_eq!((progress.completed, progress.total, progress.percentage), (1, 4, 25));
    assert_eq!(alice.notebook_progress(&world.notebook_id).percentage, 25);
    // a single user: entries over tasks x 1
    assert_eq!(alice.group_progress(&world.notebook_id).percentage, 25);
}
