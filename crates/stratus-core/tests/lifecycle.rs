//! End-to-end upload lifecycle through `App` with the SQLite store and the
//! local mirror uploader.

use std::path::{Path, PathBuf};
use std::time::Duration;

use stratus_core::domain::TaskStatus;
use stratus_core::error::{AppError, GuardError};
use stratus_core::impls::local_mirror::SHARE_MANIFEST;
use stratus_core::impls::{LocalMirrorUploader, SqliteTaskStore};
use stratus_core::ports::TaskStore;
use stratus_core::{AppBuilder, AppConfig};
use tempfile::TempDir;

fn config(dir: &Path) -> AppConfig {
    let mut config = AppConfig {
        lock_path: dir.join("run").join("stratus.lock"),
        database_path: dir.join("db").join("tasks.db"),
        workers: 2,
        ..AppConfig::default()
    };
    config.uploader.repetition_secs = 1;
    config.uploader.max_attempts = 2;
    config.uploader.base_delay_secs = 0;
    config
}

fn recorded_folder(dir: &Path, name: &str) -> PathBuf {
    let folder = dir.join("recordings").join(name);
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(folder.join("segment-000.ts"), b"frames").unwrap();
    folder
}

#[tokio::test]
async fn manual_cycle_uploads_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let mirror = dir.path().join("mirror");
    let folder = recorded_folder(dir.path(), "news-0700");

    let mut app = AppBuilder::new(config(dir.path())).build().await.unwrap();
    let store = app.store();
    store
        .insert_task(&folder, &["ops@example.com".to_string()], TaskStatus::Processed)
        .await
        .unwrap();
    // 同じ folder は二重に積めない
    assert!(
        store
            .insert_task(&folder, &[], TaskStatus::Processed)
            .await
            .is_err()
    );

    app.register_uploader(LocalMirrorUploader::new(&mirror))
        .await
        .unwrap();
    let reports = app.run_dispatch_now().await;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].uploaded, 1);
    assert!(!folder.exists());
    assert!(store.get_task(&folder).await.unwrap().is_none());
    assert!(mirror.join("news-0700").join("segment-000.ts").exists());
    assert!(mirror.join("news-0700").join(SHARE_MANIFEST).exists());

    app.shutdown().await;
}

#[tokio::test]
async fn scheduled_job_drains_queue() {
    let dir = TempDir::new().unwrap();
    let mirror = dir.path().join("mirror");
    let folders: Vec<_> = (0..3)
        .map(|i| recorded_folder(dir.path(), &format!("show-{i}")))
        .collect();

    let mut app = AppBuilder::new(config(dir.path())).build().await.unwrap();
    let store = app.store();
    for folder in &folders {
        store
            .insert_task(folder, &[], TaskStatus::Processed)
            .await
            .unwrap();
    }
    app.register_uploader(LocalMirrorUploader::new(&mirror))
        .await
        .unwrap();
    app.start().unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let counts = store.counts_by_status().await.unwrap();
        if counts.total() == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue not drained: {counts:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    app.shutdown().await;

    for folder in &folders {
        assert!(!folder.exists());
        assert!(mirror.join(folder.file_name().unwrap()).exists());
    }
}

#[tokio::test]
async fn crash_leftovers_are_requeued_on_restart() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());
    let folder = recorded_folder(dir.path(), "late-night");

    // 前回プロセスが uploading のまま落ちた状態を作る
    {
        let store = SqliteTaskStore::open(&cfg.database_path, 1).await.unwrap();
        store
            .insert_task(&folder, &[], TaskStatus::Uploading)
            .await
            .unwrap();
        store.close().await;
    }

    let app = AppBuilder::new(cfg).build().await.unwrap();
    let task = app.store().get_task(&folder).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Processed);
    app.shutdown().await;
}

#[tokio::test]
async fn failed_uploads_end_in_failed_and_can_be_retried() {
    let dir = TempDir::new().unwrap();
    let mirror = dir.path().join("mirror");
    // store にはあるが folder が無い: mirror へのコピーが毎回失敗する
    let missing = dir.path().join("recordings").join("vanished");

    let mut app = AppBuilder::new(config(dir.path())).build().await.unwrap();
    let store = app.store();
    store
        .insert_task(&missing, &[], TaskStatus::Processed)
        .await
        .unwrap();
    app.register_uploader(LocalMirrorUploader::new(&mirror))
        .await
        .unwrap();

    let first = app.run_dispatch_now().await;
    assert_eq!(first[0].retried, 1);
    let second = app.run_dispatch_now().await;
    assert_eq!(second[0].failed, 1);

    let report = app.status().await.unwrap();
    assert_eq!(report.counts.failed, 1);
    assert_eq!(report.failed[0].attempts, 2);
    assert!(report.failed[0].last_error.is_some());

    // failed は次の cycle でも拾われない
    assert_eq!(app.run_dispatch_now().await[0].listed, 0);

    assert!(store.retry_failed(&missing).await.unwrap());
    let task = store.get_task(&missing).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Processed);
    assert_eq!(task.attempts, 0);

    app.shutdown().await;
}

#[tokio::test]
async fn only_one_app_per_lock_file() {
    let dir = TempDir::new().unwrap();
    let app = AppBuilder::new(config(dir.path())).build().await.unwrap();

    let second = AppBuilder::new(config(dir.path())).build().await;
    assert!(matches!(
        second,
        Err(AppError::Guard(GuardError::AlreadyRunning { .. }))
    ));

    app.shutdown().await;
}
