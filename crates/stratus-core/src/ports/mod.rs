//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（SQLite、ストレージプラットフォーム、時計）への
//! インターフェースを提供し、実装の詳細を隠蔽します。

pub mod clock;
pub mod task_store;
pub mod uploader;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::task_store::{StatusCounts, TaskStore};
pub use self::uploader::PlatformUploader;
