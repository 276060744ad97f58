//! App - アプリケーション層
//!
//! ports と scheduler を組み合わせて upload lifecycle を組み立てる。
//!
//! # 主要コンポーネント
//! - **AppBuilder / App**: 起動順序（guard → store → requeue → scheduler + pool）と停止順序の管理
//! - **UploadDispatcher**: プラットフォームごとの recurring upload job
//! - **WorkerPool**: dispatcher 間で共有する固定サイズの worker 群
//! - **StatusReport**: 状態別件数と failed task の一覧

pub mod builder;
pub mod dispatcher;
pub mod status;
pub mod worker_pool;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder};
pub use self::dispatcher::{CycleReport, Dispatch, UploadDispatcher};
pub use self::status::StatusReport;
pub use self::worker_pool::WorkerPool;
