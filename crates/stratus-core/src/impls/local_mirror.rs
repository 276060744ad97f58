//! LocalMirrorUploader - ローカルディレクトリへの「アップロード」
//!
//! 本物のクラウドプラットフォームの代わりに、folder を mirror root 以下へコピーし、
//! 共有先を `share_list.json` として横に書き出す。CLI とテストで使う。

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::UploadError;
use crate::ports::PlatformUploader;

pub const SHARE_MANIFEST: &str = "share_list.json";

pub struct LocalMirrorUploader {
    root: PathBuf,
}

/// Authenticated handle: the verified mirror root.
#[derive(Debug, Clone)]
pub struct MirrorClient {
    root: PathBuf,
}

impl MirrorClient {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl LocalMirrorUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl PlatformUploader for LocalMirrorUploader {
    type Client = MirrorClient;

    fn platform(&self) -> &str {
        "local-mirror"
    }

    async fn authenticate(&self) -> Result<MirrorClient, UploadError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| UploadError::Auth {
                platform: self.platform().to_string(),
                message: format!("mirror root {} is not usable: {e}", self.root.display()),
            })?;
        Ok(MirrorClient {
            root: self.root.clone(),
        })
    }

    async fn upload(
        &self,
        client: &MirrorClient,
        folder: &Path,
        share_list: &[String],
    ) -> Result<(), UploadError> {
        let name = folder.file_name().ok_or_else(|| UploadError::Transfer {
            folder: folder.to_path_buf(),
            message: "folder has no final path component".to_string(),
        })?;
        if !tokio::fs::metadata(folder).await?.is_dir() {
            return Err(UploadError::Transfer {
                folder: folder.to_path_buf(),
                message: "not a directory".to_string(),
            });
        }

        let dest = client.root.join(name);
        let partial = client.root.join(hidden(name, ".partial"));
        let previous = client.root.join(hidden(name, ".previous"));

        remove_if_exists(&partial).await?;
        copy_tree(folder.to_path_buf(), partial.clone()).await?;

        let manifest = serde_json::to_vec_pretty(share_list)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        tokio::fs::write(partial.join(SHARE_MANIFEST), manifest).await?;

        // 既存の dest は新しいコピーが rename で確定するまで退避しておく
        remove_if_exists(&previous).await?;
        let replaced = match tokio::fs::rename(&dest, &previous).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = tokio::fs::rename(&partial, &dest).await {
            if replaced {
                if let Err(restore) = tokio::fs::rename(&previous, &dest).await {
                    warn!(dest = %dest.display(), error = %restore, "failed to put previous copy back");
                }
            }
            return Err(e.into());
        }
        if replaced {
            remove_if_exists(&previous).await?;
        }

        debug!(folder = %folder.display(), dest = %dest.display(), "mirrored folder");
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn hidden(name: &OsStr, suffix: &str) -> OsString {
    let mut hidden = OsString::from(".");
    hidden.push(name);
    hidden.push(suffix);
    hidden
}

/// Copy `src` into `dst` (created if missing) on the blocking pool.
async fn copy_tree(src: PathBuf, dst: PathBuf) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        for entry in WalkDir::new(&src).follow_links(false) {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(&src)
                .map_err(std::io::Error::other)?;
            let target = dst.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                std::fs::copy(entry.path(), &target)?;
            }
        }
        Ok::<(), std::io::Error>(())
    })
    .await
    .map_err(std::io::Error::other)?
}
