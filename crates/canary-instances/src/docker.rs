//! Docker backend — one container per replica, driven through the CLI.
//!
//! Containers carry `canary.service`, `canary.role`, `canary.tag` and
//! `canary.index` labels, which are the source of truth for `current_tag`.
//! Both groups of a service join the same network; nginx reaches them
//! through the per-role network alias.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use canary_state::{GroupRole, HealthStatus, InstanceGroup};

use crate::error::{InstanceError, InstanceResult};
use crate::manager::InstanceGroupManager;

/// Settings for the Docker backend.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// `docker` binary.
    pub docker_bin: String,
    /// Network every container joins.
    pub network: String,
    /// Prefix prepended to every container name.
    pub name_prefix: String,
    /// Image repository per service (tag is appended).
    pub images: HashMap<String, String>,
    /// How long a fresh container must survive before it counts as started.
    pub startup_grace: Duration,
    /// Grace period passed to `docker stop`.
    pub stop_timeout: Duration,
    /// Upper bound for any single CLI call.
    pub command_timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            network: "banking-network".to_string(),
            name_prefix: "banking-".to_string(),
            images: HashMap::new(),
            startup_grace: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
        }
    }
}

/// A container as reported by `docker ps`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Container {
    name: String,
    tag: String,
    index: u32,
    running: bool,
}

/// Instance groups backed by Docker containers.
pub struct DockerGroupManager {
    config: DockerConfig,
    /// Last verdict per group, valid only for the tag it was recorded against.
    health: RwLock<HashMap<(String, GroupRole), (String, HealthStatus)>>,
}

impl DockerGroupManager {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            health: RwLock::new(HashMap::new()),
        }
    }

    fn image(&self, service: &str, tag: &str) -> InstanceResult<String> {
        self.config
            .images
            .get(service)
            .map(|repo| format!("{repo}:{tag}"))
            .ok_or_else(|| InstanceError::Command(format!("no image configured for {service}")))
    }

    async fn docker(&self, args: &[&str]) -> InstanceResult<String> {
        let output = tokio::time::timeout(
            self.config.command_timeout,
            tokio::process::Command::new(&self.config.docker_bin)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| InstanceError::Command(format!("docker {} timed out", args.join(" "))))?
        .map_err(|e| InstanceError::Command(format!("docker: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(InstanceError::Command(format!(
                "docker {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn list(&self, service: &str, role: GroupRole) -> InstanceResult<Vec<Container>> {
        let service_filter = format!("label=canary.service={service}");
        let role_filter = format!("label=canary.role={role}");
        let out = self
            .docker(&[
                "ps",
                "-a",
                "--filter",
                &service_filter,
                "--filter",
                &role_filter,
                "--format",
                PS_FORMAT,
            ])
            .await?;
        let mut containers: Vec<Container> = out.lines().filter_map(parse_ps_line).collect();
        containers.sort_by_key(|c| c.index);
        Ok(containers)
    }

    async fn remove(&self, name: &str) -> InstanceResult<()> {
        let grace = self.config.stop_timeout.as_secs().to_string();
        if let Err(e) = self.docker(&["stop", "-t", &grace, name]).await {
            debug!(container = name, error = %e, "stop failed, forcing removal");
        }
        self.docker(&["rm", "-f", name]).await?;
        Ok(())
    }

    /// Start one replica and wait out the startup grace period.
    async fn start_replica(
        &self,
        service: &str,
        role: GroupRole,
        tag: &str,
        index: u32,
    ) -> InstanceResult<String> {
        let image = self.image(service, tag)?;
        let name = container_name(&self.config.name_prefix, service, role, index, tag);
        let alias = network_alias(service, role);
        let labels = [
            format!("canary.service={service}"),
            format!("canary.role={role}"),
            format!("canary.tag={tag}"),
            format!("canary.index={index}"),
        ];

        // A leftover container with the same name would make `run` fail.
        let _ = self.docker(&["rm", "-f", &name]).await;

        let mut args: Vec<&str> = vec![
            "run",
            "-d",
            "--name",
            &name,
            "--network",
            &self.config.network,
            "--network-alias",
            &alias,
            "--restart",
            "on-failure",
        ];
        for label in &labels {
            args.push("--label");
            args.push(label);
        }
        args.push(&image);

        self.docker(&args)
            .await
            .map_err(|e| InstanceError::provision(service, role, e.to_string()))?;

        tokio::time::sleep(self.config.startup_grace).await;

        let state = self
            .docker(&[
                "inspect",
                "-f",
                "{{.State.Running}} {{.RestartCount}}",
                &name,
            ])
            .await
            .map_err(|e| InstanceError::provision(service, role, e.to_string()))?;

        if !started_cleanly(&state) {
            warn!(container = %name, state = state.trim(), "replica failed to start");
            let _ = self.docker(&["rm", "-f", &name]).await;
            return Err(InstanceError::provision(
                service,
                role,
                format!("{name} is crash-looping ({})", state.trim()),
            ));
        }
        Ok(name)
    }
}

#[async_trait]
impl InstanceGroupManager for DockerGroupManager {
    async fn ensure(
        &self,
        service: &str,
        role: GroupRole,
        tag: &str,
        replicas: u32,
    ) -> InstanceResult<()> {
        let existing = self
            .list(service, role)
            .await
            .map_err(|e| InstanceError::provision(service, role, e.to_string()))?;

        let at_target = existing.len() == replicas as usize
            && existing.iter().all(|c| c.tag == tag && c.running);
        if at_target {
            debug!(service, %role, tag, "group already at target");
            return Ok(());
        }

        // Rolling replace: bring up the new replica before removing the old one.
        for index in 0..replicas {
            let current: Vec<&Container> = existing.iter().filter(|c| c.index == index).collect();
            if current.iter().any(|c| c.tag == tag && c.running) && current.len() == 1 {
                continue;
            }
            let started = self.start_replica(service, role, tag, index).await?;
            for old in current.iter().filter(|c| c.name != started) {
                self.remove(&old.name).await?;
            }
            debug!(service, %role, index, container = %started, "replica replaced");
        }

        // Scale down anything beyond the target count.
        for extra in existing.iter().filter(|c| c.index >= replicas) {
            self.remove(&extra.name).await?;
        }

        info!(service, %role, tag, replicas, "group ensured");
        Ok(())
    }

    async fn current_tag(&self, service: &str, role: GroupRole) -> InstanceResult<String> {
        let containers = self.list(service, role).await?;
        containers
            .into_iter()
            .find(|c| c.running)
            .map(|c| c.tag)
            .ok_or_else(|| InstanceError::NotProvisioned {
                service: service.to_string(),
                role,
            })
    }

    async fn teardown(&self, service: &str, role: GroupRole) -> InstanceResult<()> {
        let containers = self.list(service, role).await?;
        for c in &containers {
            self.docker(&["rm", "-f", &c.name]).await?;
        }
        self.health
            .write()
            .expect("health lock")
            .remove(&(service.to_string(), role));
        if !containers.is_empty() {
            info!(service, %role, removed = containers.len(), "group torn down");
        }
        Ok(())
    }

    async fn logs(
        &self,
        service: &str,
        role: GroupRole,
        lines: usize,
    ) -> InstanceResult<Vec<String>> {
        let tail = lines.to_string();
        let mut collected = Vec::new();
        for c in self.list(service, role).await? {
            let out = tokio::time::timeout(
                self.config.command_timeout,
                tokio::process::Command::new(&self.config.docker_bin)
                    .args(["logs", "--tail", &tail, &c.name])
                    .kill_on_drop(true)
                    .output(),
            )
            .await
            .map_err(|_| InstanceError::Command(format!("docker logs {} timed out", c.name)))?
            .map_err(|e| InstanceError::Command(format!("docker: {e}")))?;

            // Containers log to both streams.
            for stream in [&out.stdout, &out.stderr] {
                collected.extend(
                    String::from_utf8_lossy(stream)
                        .lines()
                        .map(|line| format!("{}: {line}", c.name)),
                );
            }
        }
        let skip = collected.len().saturating_sub(lines);
        Ok(collected.into_iter().skip(skip).collect())
    }

    async fn record_health(
        &self,
        service: &str,
        role: GroupRole,
        status: HealthStatus,
    ) -> InstanceResult<()> {
        let tag = match self.current_tag(service, role).await {
            Ok(tag) => tag,
            Err(InstanceError::NotProvisioned { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.health
            .write()
            .expect("health lock")
            .insert((service.to_string(), role), (tag, status));
        Ok(())
    }

    async fn describe(&self, service: &str, role: GroupRole) -> InstanceResult<InstanceGroup> {
        let containers = self.list(service, role).await?;
        let recorded = self
            .health
            .read()
            .expect("health lock")
            .get(&(service.to_string(), role))
            .cloned();
        summarize(service, role, &containers, recorded)
    }
}

/// Fold running containers into a group. Recorded health only applies to
/// the tag it was recorded against.
fn summarize(
    service: &str,
    role: GroupRole,
    containers: &[Container],
    recorded: Option<(String, HealthStatus)>,
) -> InstanceResult<InstanceGroup> {
    let running: Vec<&Container> = containers.iter().filter(|c| c.running).collect();
    let Some(first) = running.first() else {
        return Err(InstanceError::NotProvisioned {
            service: service.to_string(),
            role,
        });
    };
    let health = match recorded {
        Some((tag, status)) if tag == first.tag => status,
        _ => HealthStatus::Unknown,
    };
    Ok(InstanceGroup {
        service: service.to_string(),
        role,
        tag: first.tag.clone(),
        replica_count: running.len() as u32,
        health,
    })
}

const PS_FORMAT: &str =
    "{{.Names}}\t{{.Label \"canary.tag\"}}\t{{.Label \"canary.index\"}}\t{{.State}}";

fn parse_ps_line(line: &str) -> Option<Container> {
    let mut parts = line.trim().split('\t');
    let name = parts.next()?.to_string();
    let tag = parts.next()?.to_string();
    let index = parts.next()?.parse().ok()?;
    let running = parts.next()? == "running";
    if name.is_empty() || tag.is_empty() {
        return None;
    }
    Some(Container {
        name,
        tag,
        index,
        running,
    })
}

/// `docker inspect` output is `"<running> <restart count>"`.
fn started_cleanly(state: &str) -> bool {
    let mut parts = state.split_whitespace();
    let running = parts.next() == Some("true");
    let restarts: u32 = parts.next().and_then(|n| n.parse().ok()).unwrap_or(u32::MAX);
    running && restarts == 0
}

/// Container names must match `[a-zA-Z0-9][a-zA-Z0-9_.-]+`.
fn sanitize_tag(tag: &str) -> String {
    tag.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn container_name(prefix: &str, service: &str, role: GroupRole, index: u32, tag: &str) -> String {
    format!("{prefix}{service}-{role}-{index}-{}", sanitize_tag(tag))
}

/// DNS alias the proxy uses to reach a group.
pub fn network_alias(service: &str, role: GroupRole) -> String {
    match role {
        GroupRole::Stable => format!("{service}-service"),
        GroupRole::Canary => format!("{service}-service-canary"),
    }
}
