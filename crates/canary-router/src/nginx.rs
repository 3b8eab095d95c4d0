//! nginx adapter — renders the weight map as upstream blocks.
//!
//! Each apply renders the complete file, writes it to a staging path in
//! the same directory, optionally runs a validation command against the
//! staged file, and renames it over the live file. The rename is the
//! publish point. A reload command then tells nginx to pick it up; nginx
//! drains in-flight requests on the old workers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{RouterError, RouterResult};
use crate::router::TrafficRouter;
use crate::split::{TrafficSplit, WeightMap};

/// Placeholder in validation command arguments, replaced with the staged file path.
pub const STAGED_PATH_PLACEHOLDER: &str = "{path}";

/// Backend addresses of the two groups behind one upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAddrs {
    pub stable: String,
    pub canary: String,
}

/// Traffic router that drives nginx through a generated include file.
pub struct NginxRouter {
    config_path: PathBuf,
    upstreams: HashMap<String, UpstreamAddrs>,
    test_command: Option<Vec<String>>,
    reload_command: Option<Vec<String>>,
    command_timeout: Duration,
    /// Splits currently published. The lock also serializes applies.
    applied: Mutex<WeightMap>,
}

impl NginxRouter {
    pub fn new(config_path: &Path) -> Self {
        Self {
            config_path: config_path.to_path_buf(),
            upstreams: HashMap::new(),
            test_command: None,
            reload_command: None,
            command_timeout: Duration::from_secs(10),
            applied: Mutex::new(WeightMap::new()),
        }
    }

    /// Register the upstream for a service.
    pub fn with_upstream(mut self, service: &str, addrs: UpstreamAddrs) -> Self {
        self.upstreams.insert(service.to_string(), addrs);
        self
    }

    /// Command run against the staged file before publishing (e.g. `nginx -t -c {path}`).
    pub fn with_test_command(mut self, argv: Vec<String>) -> Self {
        self.test_command = (!argv.is_empty()).then_some(argv);
        self
    }

    /// Command run after publishing (e.g. `nginx -s reload`).
    pub fn with_reload_command(mut self, argv: Vec<String>) -> Self {
        self.reload_command = (!argv.is_empty()).then_some(argv);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .config_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".staging");
        self.config_path.with_file_name(name)
    }

    /// Render every configured upstream. Services without a split get all-stable.
    pub fn render(&self, map: &WeightMap) -> String {
        let mut services: Vec<&String> = self.upstreams.keys().collect();
        services.sort();

        let mut out = String::from("# Generated by canaryd. Manual edits are overwritten.\n");
        for service in services {
            let addrs = &self.upstreams[service];
            let split = map.get(service).copied().unwrap_or_default();
            out.push_str(&format!("\nupstream {service} {{\n"));
            // nginx rejects weight=0, so a zero-weight group is left out entirely.
            if split.stable_weight > 0 {
                out.push_str(&format!(
                    "    server {} weight={};\n",
                    addrs.stable, split.stable_weight
                ));
            }
            if split.canary_weight > 0 {
                out.push_str(&format!(
                    "    server {} weight={};\n",
                    addrs.canary, split.canary_weight
                ));
            }
            out.push_str("}\n");
        }
        out
    }

    /// Write `content` to the staging path, validate it, and rename it live.
    async fn publish(&self, content: &str) -> RouterResult<()> {
        let staging = self.staging_path();
        tokio::fs::write(&staging, content).await?;

        if let Some(argv) = &self.test_command {
            let staged = staging.to_string_lossy();
            let argv: Vec<String> = argv
                .iter()
                .map(|a| a.replace(STAGED_PATH_PLACEHOLDER, &staged))
                .collect();
            if let Err(reason) = run_command(&argv, self.command_timeout).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(RouterError::Validation(reason));
            }
        }

        tokio::fs::rename(&staging, &self.config_path).await?;
        Ok(())
    }

    async fn reload(&self) -> RouterResult<()> {
        match &self.reload_command {
            Some(argv) => run_command(argv, self.command_timeout)
                .await
                .map_err(RouterError::Reload),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TrafficRouter for NginxRouter {
    async fn apply_split(
        &self,
        service: &str,
        stable_weight: u8,
        canary_weight: u8,
    ) -> RouterResult<()> {
        let split = TrafficSplit::new(stable_weight, canary_weight)?;
        if !self.upstreams.contains_key(service) {
            return Err(RouterError::UnknownService(service.to_string()));
        }

        let mut applied = self.applied.lock().await;
        let mut candidate = applied.clone();
        candidate.insert(service.to_string(), split);

        let rendered = self.render(&candidate);
        let on_disk = tokio::fs::read_to_string(&self.config_path).await.ok();
        if on_disk.as_deref() == Some(rendered.as_str()) {
            debug!(service, %split, "split already in effect");
            *applied = candidate;
            return Ok(());
        }

        self.publish(&rendered).await?;

        if let Err(e) = self.reload().await {
            // Put the previous file back so disk matches what nginx is serving.
            warn!(service, error = %e, "reload failed, restoring previous config");
            let previous = on_disk.unwrap_or_else(|| self.render(&applied));
            if let Err(restore) = self.publish(&previous).await {
                warn!(service, error = %restore, "failed to restore previous config");
            }
            return Err(e);
        }

        info!(service, %split, path = ?self.config_path, "nginx upstreams published");
        *applied = candidate;
        Ok(())
    }

    async fn current_split(&self, service: &str) -> Option<TrafficSplit> {
        self.applied.lock().await.get(service).copied()
    }

    async fn weight_map(&self) -> WeightMap {
        self.applied.lock().await.clone()
    }
}

/// Run a command to completion, returning stderr on failure.
async fn run_command(argv: &[String], timeout: Duration) -> Result<(), String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| "empty command".to_string())?;

    let output = tokio::time::timeout(
        timeout,
        tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| format!("{program} timed out after {timeout:?}"))?
    .map_err(|e| format!("{program}: {e}"))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}
