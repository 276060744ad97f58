//! Impls - ports の実装
//!
//! - `SqliteTaskStore`: 本番用の TaskStore
//! - `InMemoryTaskStore`: テスト・開発用
//! - `LocalMirrorUploader`: ローカルディレクトリを upload 先とする PlatformUploader

pub mod inmem_store;
pub mod local_mirror;
pub mod sqlite_store;

pub use self::inmem_store::InMemoryTaskStore;
pub use self::local_mirror::{LocalMirrorUploader, MirrorClient};
pub use self::sqlite_store::SqliteTaskStore;
