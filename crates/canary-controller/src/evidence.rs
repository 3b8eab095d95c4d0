//! Failure evidence — what gets shipped for post-mortem when a rollout fails.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use canary_state::{HealthSample, RolloutRecord, epoch_millis};

use crate::error::EvidenceError;

/// Structured post-mortem bundle for one failed rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceBundle {
    pub service: String,
    pub rollout_id: String,
    pub from_tag: String,
    pub to_tag: String,
    pub reason: String,
    pub logs: Vec<String>,
    pub health_history: Vec<HealthSample>,
    pub capture_error: Option<String>,
    pub captured_at_ms: u64,
}

impl EvidenceBundle {
    pub fn new(record: &RolloutRecord, reason: &str) -> Self {
        Self {
            service: record.service.clone(),
            rollout_id: record.id.clone(),
            from_tag: record.from_tag.clone(),
            to_tag: record.to_tag.clone(),
            reason: reason.to_string(),
            logs: Vec::new(),
            health_history: Vec::new(),
            capture_error: None,
            captured_at_ms: epoch_millis(),
        }
    }
}

/// External store for evidence bundles.
///
/// Publication is best-effort: the controller never waits on it before
/// finishing a rollback.
#[async_trait]
pub trait EvidenceSink: Send + Sync {
    /// Key the bundle will be stored under, recorded on the rollout record.
    fn key(&self, bundle: &EvidenceBundle) -> String;

    async fn publish(&self, bundle: &EvidenceBundle) -> Result<(), EvidenceError>;
}

/// Writes each bundle as pretty-printed JSON into a directory.
pub struct FileEvidenceSink {
    dir: PathBuf,
}

impl FileEvidenceSink {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path(&self, bundle: &EvidenceBundle) -> PathBuf {
        self.dir
            .join(format!("{}-{}.json", bundle.service, bundle.rollout_id))
    }
}

#[async_trait]
impl EvidenceSink for FileEvidenceSink {
    fn key(&self, bundle: &EvidenceBundle) -> String {
        self.path(bundle).display().to_string()
    }

    async fn publish(&self, bundle: &EvidenceBundle) -> Result<(), EvidenceError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(bundle)?;
        let path = self.path(bundle);
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, body).await?;
        tokio::fs::rename(&staging, &path).await?;
        info!(service = %bundle.service, path = %path.display(), "evidence bundle written");
        Ok(())
    }
}

/// Emits bundles through `tracing` only.
#[derive(Default)]
pub struct LogEvidenceSink;

#[async_trait]
impl EvidenceSink for LogEvidenceSink {
    fn key(&self, bundle: &EvidenceBundle) -> String {
        format!("log:{}", bundle.rollout_id)
    }

    async fn publish(&self, bundle: &EvidenceBundle) -> Result<(), EvidenceError> {
        let body = serde_json::to_string(bundle)?;
        warn!(
            service = %bundle.service,
            rollout = %bundle.rollout_id,
            from = %bundle.from_tag,
            to = %bundle.to_tag,
            reason = %bundle.reason,
            bundle = %body,
            "rollout failure evidence"
        );
        Ok(())
    }
}
