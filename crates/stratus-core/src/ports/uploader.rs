//! PlatformUploader port - ストレージプラットフォームごとの upload 実装
//!
//! Dispatcher はこの trait に対してジェネリック。プラットフォーム固有のプロトコルは
//! この crate の外で実装する（同梱は `LocalMirrorUploader` のみ）。

use std::path::Path;

use async_trait::async_trait;

use crate::error::UploadError;

/// PlatformUploader は認証済みクライアントと folder 単位の upload を提供
///
/// # 使用例
/// ```ignore
/// struct DriveUploader { creds: Credentials }
///
/// #[async_trait]
/// impl PlatformUploader for DriveUploader {
///     type Client = DriveClient;
///     fn platform(&self) -> &str { "drive" }
///     async fn authenticate(&self) -> Result<DriveClient, UploadError> { ... }
///     async fn upload(&self, client: &DriveClient, folder: &Path, share_list: &[String])
///         -> Result<(), UploadError> { ... }
/// }
/// ```
///
/// # 契約
/// - `upload` が `Ok(())` を返した時点で、リモート側に folder が確定していること
/// - `Err` の場合 task は retry policy に従って再試行される（folder は消さない）
/// - 同じ client が複数 worker から同時に使われる（`Send + Sync`）
#[async_trait]
pub trait PlatformUploader: Send + Sync + 'static {
    type Client: Send + Sync + 'static;

    /// Short platform name; used in the scheduler job name `upload.<platform>`.
    fn platform(&self) -> &str;

    async fn authenticate(&self) -> Result<Self::Client, UploadError>;

    async fn upload(
        &self,
        client: &Self::Client,
        folder: &Path,
        share_list: &[String],
    ) -> Result<(), UploadError>;
}
