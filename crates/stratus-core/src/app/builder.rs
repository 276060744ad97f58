//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 起動順序（Fail-fast）
//! 1. ProcessGuard を取得（取れなければ何も触らずに `AlreadyRunning`）
//! 2. TaskStore を開く
//! 3. 前回クラッシュで `uploading` のまま残った task を `processed` に戻す
//! 4. Scheduler と共有 WorkerPool を作る
//!
//! 停止は逆順: scheduler 停止 → pool の drain → store close → guard 解放

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::app::dispatcher::{CycleReport, Dispatch, UploadDispatcher};
use crate::app::status::StatusReport;
use crate::app::worker_pool::WorkerPool;
use crate::config::AppConfig;
use crate::error::{AppError, StoreError};
use crate::guard::ProcessGuard;
use crate::impls::SqliteTaskStore;
use crate::ports::{Clock, PlatformUploader, SystemClock, TaskStore};
use crate::scheduler::{JobHandler, Scheduler, Trigger};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let mut app = AppBuilder::new(config).build().await?;
/// app.register_uploader(LocalMirrorUploader::new("/srv/mirror")).await?;
/// app.start()?;
/// // ...
/// app.shutdown().await;
/// ```
pub struct AppBuilder {
    config: AppConfig,
    store: Option<Arc<dyn TaskStore>>,
    clock: Arc<dyn Clock>,
}

impl AppBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use this store instead of opening `config.database_path`.
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Acquire the guard and wire everything up. Must run inside a tokio runtime.
    pub async fn build(self) -> Result<App, AppError> {
        self.config.validate()?;

        let guard = ProcessGuard::acquire(&self.config.lock_path)?;

        let (store, sqlite) = match self.store {
            Some(store) => (store, None),
            None => {
                let sqlite = Arc::new(
                    SqliteTaskStore::open(&self.config.database_path, self.config.max_connections)
                        .await?,
                );
                let store: Arc<dyn TaskStore> = sqlite.clone();
                (store, Some(sqlite))
            }
        };

        let requeued = store.requeue_interrupted().await?;
        if requeued > 0 {
            info!(requeued, "returned interrupted uploads to processed");
        }

        let pool = Arc::new(WorkerPool::new(self.config.workers));
        info!(
            database = %self.config.database_path.display(),
            workers = pool.size(),
            "app built"
        );

        Ok(App {
            config: self.config,
            store,
            sqlite,
            clock: self.clock,
            scheduler: Scheduler::new(),
            pool,
            dispatchers: Vec::new(),
            guard: Some(guard),
        })
    }
}

/// App はアプリケーションのランタイム
pub struct App {
    config: AppConfig,
    store: Arc<dyn TaskStore>,
    sqlite: Option<Arc<SqliteTaskStore>>,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler,
    pool: Arc<WorkerPool>,
    dispatchers: Vec<Arc<dyn Dispatch>>,
    guard: Option<ProcessGuard>,
}

impl App {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.store)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Authenticate `uploader` and register its recurring `upload.<platform>` job.
    ///
    /// Returns the job name.
    pub async fn register_uploader<U: PlatformUploader>(
        &mut self,
        uploader: U,
    ) -> Result<String, AppError> {
        let trigger = self.config.trigger(Utc::now())?;
        let dispatcher = Arc::new(
            UploadDispatcher::new(
                uploader,
                Arc::clone(&self.store),
                Arc::clone(&self.pool),
                Arc::clone(&self.clock),
                self.config.retry_policy(),
            )
            .await?,
        );
        let name = dispatcher.job_name().to_string();

        let handler: Arc<dyn JobHandler> = dispatcher.clone();
        self.scheduler
            .register_recurring_job(name.clone(), handler, trigger)?;
        self.dispatchers.push(dispatcher);
        Ok(name)
    }

    /// Register a maintenance-style job.
    pub fn register_job(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        trigger: Trigger,
    ) -> Result<(), AppError> {
        self.scheduler.register_recurring_job(name, handler, trigger)?;
        Ok(())
    }

    pub fn start(&self) -> Result<(), AppError> {
        self.scheduler.start()?;
        Ok(())
    }

    /// One cycle of every registered dispatcher, outside the schedule.
    pub async fn run_dispatch_now(&self) -> Vec<CycleReport> {
        let mut reports = Vec::with_capacity(self.dispatchers.len());
        for dispatcher in &self.dispatchers {
            reports.push(dispatcher.run_cycle().await);
        }
        reports
    }

    pub async fn status(&self) -> Result<StatusReport, StoreError> {
        StatusReport::collect(self.store.as_ref()).await
    }

    /// Stop the scheduler (waiting for in-flight firings), drain the pool,
    /// close the store, then release the guard.
    pub async fn shutdown(mut self) {
        self.scheduler.stop().await;
        self.pool.shutdown_and_join().await;
        if let Some(sqlite) = self.sqlite.take() {
            sqlite.close().await;
        }
        drop(self.guard.take());
        info!("app shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskStatus;
    use crate::error::GuardError;
    use crate::impls::{InMemoryTaskStore, LocalMirrorUploader};
    use std::path::Path;
    use tempfile::TempDir;

    fn config_in(dir: &Path) -> AppConfig {
        AppConfig {
            lock_path: dir.join("stratus.lock"),
            database_path: dir.join("tasks.db"),
            workers: 2,
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn second_app_on_same_lock_is_rejected_before_touching_store() {
        let dir = TempDir::new().unwrap();
        let first = AppBuilder::new(config_in(dir.path())).build().await.unwrap();

        let store = Arc::new(InMemoryTaskStore::new());
        let second = AppBuilder::new(config_in(dir.path()))
            .with_store(store.clone())
            .build()
            .await;

        assert!(matches!(
            second,
            Err(AppError::Guard(GuardError::AlreadyRunning { .. }))
        ));
        assert_eq!(store.mutation_count(), 0);
        first.shutdown().await;
    }

    #[tokio::test]
    async fn build_requeues_interrupted_uploads() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryTaskStore::new());
        store
            .insert_task(Path::new("/rec/x"), &[], TaskStatus::Uploading)
            .await
            .unwrap();

        let app = AppBuilder::new(config_in(dir.path()))
            .with_store(store.clone())
            .build()
            .await
            .unwrap();

        let task = store.get_task(Path::new("/rec/x")).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Processed);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn register_uploader_names_job_and_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let mut app = AppBuilder::new(config_in(dir.path()))
            .with_store(Arc::new(InMemoryTaskStore::new()))
            .build()
            .await
            .unwrap();

        let name = app
            .register_uploader(LocalMirrorUploader::new(dir.path().join("mirror")))
            .await
            .unwrap();
        assert_eq!(name, "upload.local-mirror");
        assert_eq!(app.scheduler().job_names(), vec![name]);

        let again = app
            .register_uploader(LocalMirrorUploader::new(dir.path().join("mirror2")))
            .await;
        assert!(matches!(again, Err(AppError::Scheduler(_))));
        app.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_releases_guard() {
        let dir = TempDir::new().unwrap();
        let app = AppBuilder::new(config_in(dir.path())).build().await.unwrap();
        app.start().unwrap();
        app.shutdown().await;

        let again = AppBuilder::new(config_in(dir.path())).build().await;
        assert!(again.is_ok());
        again.unwrap().shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_fails_before_guard() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(dir.path());
        config.workers = 0;

        let result = AppBuilder::new(config).build().await;

        assert!(matches!(result, Err(AppError::Config(_))));
        assert!(!dir.path().join("stratus.lock").exists());
    }

    #[tokio::test]
    async fn registered_maintenance_job_fires_after_start() {
        use crate::error::BoxError;
        use crate::scheduler::FnJob;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        let dir = TempDir::new().unwrap();
        let app = AppBuilder::new(config_in(dir.path()))
            .with_store(Arc::new(InMemoryTaskStore::new()))
            .build()
            .await
            .unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let job = FnJob::new(Arc::clone(&runs), |runs: Arc<AtomicUsize>| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<(), BoxError>(())
        });
        app.register_job(
            "maintenance.vacuum",
            Arc::new(job),
            Trigger::every(Duration::from_secs(3600), Utc::now()),
        )
        .unwrap();
        assert!(matches!(
            app.register_job(
                "maintenance.vacuum",
                Arc::new(FnJob::new((), |_: ()| async { Ok::<(), BoxError>(()) })),
                Trigger::every(Duration::from_secs(3600), Utc::now()),
            ),
            Err(AppError::Scheduler(_))
        ));

        app.start().unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while runs.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        app.shutdown().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
