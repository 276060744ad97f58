//! Status - task store の状況を 1 つの view にまとめる（CLI の `status` 用）

use serde::Serialize;

use crate::domain::{TaskStatus, UploadTask};
use crate::error::StoreError;
use crate::ports::{StatusCounts, TaskStore};

/// Counts per status plus every task that gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub counts: StatusCounts,
    pub failed: Vec<UploadTask>,
}

impl StatusReport {
    pub async fn collect(store: &dyn TaskStore) -> Result<Self, StoreError> {
        let counts = store.counts_by_status().await?;
        let failed = store.list_tasks_by_status(TaskStatus::Failed).await?;
        Ok(Self { counts, failed })
    }

    /// Nothing waiting and nothing stuck.
    pub fn is_idle(&self) -> bool {
        self.counts.total() == 0
    }
}
