//! stratus-core
//!
//! Upload lifecycle engine: recorded folders are queued in a persistent task
//! store, a recurring job fans them out to a platform uploader, and each
//! folder is deleted together with its task once the upload is confirmed.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（UploadTask, TaskStatus, RetryPolicy）
//! - **ports**: 抽象化レイヤー（TaskStore, PlatformUploader, Clock）
//! - **impls**: 実装（SqliteTaskStore, InMemoryTaskStore, LocalMirrorUploader）
//! - **scheduler**: recurring job の登録と起動
//! - **guard**: 1 lock file につき 1 プロセスだけが動くことを保証
//! - **app**: ワイヤリング（AppBuilder, UploadDispatcher, WorkerPool）
//! - **config**: TOML 設定
//! - **error**: エラー型

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod guard;
pub mod impls;
pub mod ports;
pub mod scheduler;

pub use app::{App, AppBuilder, CycleReport, StatusReport};
pub use config::AppConfig;
pub use error::{AppError, BoxError};
