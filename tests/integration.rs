//! Integration tests for the repository.

mod common;

use std::sync::Arc;

use common::{init_tracing, task_repo, Task};
use parking_lot::Mutex;
use serde_json::{json, Value};
use snapstore::{
    CommitOptions, Entity, Identity, NotificationConfig, NotificationFilter, Repository,
    Revision, StoreNotification,
};

// --- Single entity ---

#[tokio::test]
async fn test_commit_and_get_single_entity() {
    init_tracing();
    let (repo, db) = task_repo().await;

    let mut t1 = Task::new("t1").init();
    repo.commit(&mut t1, CommitOptions::default()).await.unwrap();

    let loaded = repo.get("t1").await.unwrap().unwrap();
    assert_eq!(loaded.id(), Some(&Identity::from("t1")));
    assert_eq!(loaded.revision(), Revision(1));
    assert_eq!(loaded.status, "initiated");
    assert!(loaded.core().events().is_empty());

    // 1 < rounds, so no snapshot was written.
    assert!(db.memory_collection("task.snapshots").is_empty());
    assert_eq!(db.memory_collection("task.events").len(), 1);
}

#[tokio::test]
async fn test_get_unknown_is_none() {
    let (repo, _) = task_repo().await;
    assert!(repo.get("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn test_numeric_identity() {
    let (repo, _) = task_repo().await;

    let mut task = Task::new(42i64).init();
    repo.commit(&mut task, CommitOptions::default()).await.unwrap();

    let loaded = repo.get(42i64).await.unwrap().unwrap();
    assert_eq!(loaded.id(), Some(&Identity::Num(42)));
    assert!(repo.get("42").await.unwrap().is_none());
}

#[tokio::test]
async fn test_incremental_commits_continue_revision() {
    let (repo, _) = task_repo().await;

    let mut task = Task::new("t2").init();
    repo.commit(&mut task, CommitOptions::default()).await.unwrap();

    let task = repo.get("t2").await.unwrap().unwrap();
    let mut task = task.start("Ana").end("Ben");
    repo.commit(&mut task, CommitOptions::default()).await.unwrap();

    let loaded = repo.get("t2").await.unwrap().unwrap();
    assert_eq!(loaded.revision(), Revision(3));
    assert_eq!(loaded.status, "ended");
    assert_eq!(loaded.started_by.as_deref(), Some("Ana"));
    assert_eq!(loaded.ended_by.as_deref(), Some("Ben"));
}

// --- Batches ---

#[tokio::test]
async fn test_commit_and_get_multiple_entities() {
    let (repo, _) = task_repo().await;

    let mut batch = vec![Task::new("foo").init(), Task::new("bar").init()];
    repo.commit_many(&mut batch, CommitOptions::default())
        .await
        .unwrap();

    let loaded = repo
        .get_many(&["foo".into(), "bar".into()])
        .await
        .unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].as_ref().unwrap().id(), Some(&Identity::from("foo")));
    assert_eq!(loaded[1].as_ref().unwrap().id(), Some(&Identity::from("bar")));
}

#[tokio::test]
async fn test_commit_and_get_multiple_by_snapshot() {
    let (repo, db) = task_repo().await;

    let mut batch = vec![
        Task::new("x").init().start("Martha"),
        Task::new("y").init().start("Josh"),
    ];
    repo.commit_many(&mut batch, CommitOptions::snapshot())
        .await
        .unwrap();
    assert_eq!(db.memory_collection("task.snapshots").len(), 2);
    assert!(batch.iter().all(|t| t.version() == Revision(2)));

    let loaded = repo.get_many(&["x".into(), "y".into()]).await.unwrap();
    let x = loaded[0].as_ref().unwrap();
    let y = loaded[1].as_ref().unwrap();
    assert_eq!(x.revision(), Revision(2));
    assert_eq!(y.revision(), Revision(2));
    assert_eq!(x.version(), Revision(2));
    assert_eq!(x.started_by.as_deref(), Some("Martha"));
    assert_eq!(y.started_by.as_deref(), Some("Josh"));
}

#[tokio::test]
async fn test_batch_preserves_input_order() {
    let (repo, _) = task_repo().await;

    let mut batch = vec![
        Task::new("a").init(),
        Task::new("b").init().start("Bo"),
        Task::new("c").init(),
    ];
    repo.commit_many(&mut batch, CommitOptions::default())
        .await
        .unwrap();

    let ids: Vec<Identity> = vec!["c".into(), "missing".into(), "a".into(), "b".into()];
    let loaded = repo.get_many(&ids).await.unwrap();

    assert_eq!(loaded.len(), 4);
    assert_eq!(loaded[0].as_ref().unwrap().id(), Some(&ids[0]));
    assert!(loaded[1].is_none());
    assert_eq!(loaded[2].as_ref().unwrap().id(), Some(&ids[2]));
    assert_eq!(loaded[3].as_ref().unwrap().revision(), Revision(2));
}

#[tokio::test]
async fn test_batch_and_single_agree() {
    let (repo, _) = task_repo().await;

    // One entity with a snapshot plus newer events, one without a snapshot.
    let mut snapped = vec![Task::new("s").init().start("Ida")];
    repo.commit_many(&mut snapped, CommitOptions::snapshot())
        .await
        .unwrap();
    let mut s = snapped.pop().unwrap().end("Ivo");
    repo.commit(&mut s, CommitOptions::default()).await.unwrap();
    let mut plain = Task::new("p").init().start("Per");
    repo.commit(&mut plain, CommitOptions::default()).await.unwrap();

    for id in ["s", "p"] {
        let single = repo.get(id).await.unwrap().unwrap();
        let batch = repo.get_many(&[id.into()]).await.unwrap();
        assert_eq!(batch.len(), 1);
        let batched = batch[0].as_ref().unwrap();

        assert_eq!(single.revision(), batched.revision());
        assert_eq!(single.version(), batched.version());
        assert_eq!(single.state().unwrap(), batched.state().unwrap());
    }

    // Both baselines in one call: one slot resumes from a snapshot, the other
    // replays from scratch.
    let ids: Vec<Identity> = vec!["s".into(), "p".into()];
    let batch = repo.get_many(&ids).await.unwrap();
    assert_eq!(batch.len(), 2);
    for (id, slot) in ids.iter().zip(&batch) {
        let single = repo.get(id.clone()).await.unwrap().unwrap();
        let batched = slot.as_ref().unwrap();

        assert_eq!(batched.id(), Some(id));
        assert_eq!(single.revision(), batched.revision());
        assert_eq!(single.version(), batched.version());
        assert_eq!(single.state().unwrap(), batched.state().unwrap());
    }

    let s = batch[0].as_ref().unwrap();
    assert_eq!(s.revision(), Revision(3));
    assert_eq!(s.version(), Revision(2));
    assert_eq!(s.ended_by.as_deref(), Some("Ivo"));
    let p = batch[1].as_ref().unwrap();
    assert_eq!(p.revision(), Revision(2));
    assert_eq!(p.version(), Revision(0));
    assert_eq!(p.started_by.as_deref(), Some("Per"));
}

#[tokio::test]
async fn test_get_many_empty_input() {
    let (repo, _) = task_repo().await;
    assert!(repo.get_many(&[]).await.unwrap().is_empty());
}

// --- All ---

#[tokio::test]
async fn test_get_all_on_empty_store() {
    let (repo, _) = task_repo().await;
    assert!(repo.get_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_get_all() {
    let (repo, _) = task_repo().await;

    let mut batch = vec![Task::new("one").init(), Task::new("two").init().start("Al")];
    repo.commit_many(&mut batch, CommitOptions::default())
        .await
        .unwrap();

    let all = repo.get_all().await.unwrap();
    let mut ids: Vec<String> = all.iter().filter_map(|t| t.id()).map(|id| id.to_string()).collect();
    ids.sort();
    assert_eq!(ids, vec!["one".to_string(), "two".to_string()]);
}

// --- Snapshot cadence ---

#[tokio::test]
async fn test_snapshot_taken_at_cadence() {
    let (repo, db) = task_repo().await;
    let snapshots = db.memory_collection("task.snapshots");

    let mut task = Task::new("c1");
    for n in 0..9 {
        task.record("tick", json!(n)).unwrap();
    }
    repo.commit(&mut task, CommitOptions::default()).await.unwrap();
    assert!(snapshots.is_empty());

    task.record("tick", json!(9)).unwrap();
    repo.commit(&mut task, CommitOptions::default()).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(task.version(), Revision(10));

    // Loading replays nothing newer than the snapshot.
    let loaded = repo.get("c1").await.unwrap().unwrap();
    assert_eq!(loaded.revision(), Revision(10));
    assert_eq!(loaded.version(), Revision(10));
}

#[tokio::test]
async fn test_custom_rounds() {
    let db = Arc::new(snapstore::MemoryDatabase::new());
    let repo = Repository::<Task>::builder()
        .factory(Task::new)
        .database(db.clone())
        .name("jobs")
        .rounds(2)
        .open()
        .await
        .unwrap();
    assert_eq!(repo.rounds(), 2);

    let mut task = Task::new("j1").init().start("Eve");
    repo.commit(&mut task, CommitOptions::default()).await.unwrap();

    assert_eq!(db.memory_collection("jobs.snapshots").len(), 1);
    assert_eq!(db.memory_collection("jobs.events").len(), 2);
}

// --- Notifications ---

#[tokio::test]
async fn test_queued_notifications_emitted_after_commit() {
    let (repo, _) = task_repo().await;
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));

    let mut task = Task::new("n1").init();
    let sink = Arc::clone(&seen);
    task.core_mut().on(
        "ended",
        Arc::new(move |args: &[Value]| sink.lock().extend(args.iter().cloned())),
    );
    let mut task = task.start("Ola").end("Kim");
    task.enqueue("ended", vec![json!("again")]);

    assert!(seen.lock().is_empty());
    repo.commit(&mut task, CommitOptions::default()).await.unwrap();

    assert_eq!(*seen.lock(), vec![json!("Kim"), json!("again")]);
    assert!(task.core().queued().is_empty());
}

#[tokio::test]
async fn test_commit_broadcasts_to_subscribers() {
    let (repo, _) = task_repo().await;
    let handle = repo.notifier().subscribe(NotificationConfig {
        filter: NotificationFilter::all(),
        ..Default::default()
    });

    let mut task = Task::new("b1").init().start("Uma");
    repo.commit(&mut task, CommitOptions::snapshot()).await.unwrap();

    let received = handle.drain();
    assert_eq!(
        received,
        vec![
            StoreNotification::Snapshotted {
                entity: "task".into(),
                id: "b1".into(),
                revision: Revision(2),
            },
            StoreNotification::Committed {
                entity: "task".into(),
                id: "b1".into(),
                revision: Revision(2),
                events: 2,
            },
        ]
    );
}

#[tokio::test]
async fn test_commit_without_events_is_not_broadcast() {
    let (repo, _) = task_repo().await;
    let handle = repo.notifier().subscribe(NotificationConfig {
        filter: NotificationFilter::all(),
        ..Default::default()
    });

    let mut idle = Task::new("idle");
    repo.commit(&mut idle, CommitOptions::default()).await.unwrap();
    assert!(handle.drain().is_empty());

    // A forced snapshot is still announced, but no commit is.
    repo.commit(&mut idle, CommitOptions::snapshot()).await.unwrap();
    assert_eq!(
        handle.drain(),
        vec![StoreNotification::Snapshotted {
            entity: "task".into(),
            id: "idle".into(),
            revision: Revision(0),
        }]
    );
}
