//! Daemon configuration, loaded from a TOML file.
//!
//! ```toml
//! [daemon]
//! listen = "0.0.0.0:8090"
//! data_dir = "/var/lib/canary"
//!
//! [evaluation]
//! interval = "5s"
//! window = "60s"
//! failure_threshold = 2
//!
//! [router]
//! kind = "nginx"
//! config_path = "/etc/nginx/conf.d/canary-upstreams.conf"
//! test_command = ["nginx", "-t", "-c", "{path}"]
//! reload_command = ["nginx", "-s", "reload"]
//!
//! [instances]
//! kind = "docker"
//!
//! [services.account]
//! image = "banking/account-service"
//! replicas = 2
//! port = 8000
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use canary_controller::{ControllerConfig, EvaluationConfig};
use canary_health::{GroupEndpoints, parse_duration};
use canary_instances::docker::network_alias;
use canary_router::UpstreamAddrs;
use canary_state::{DEFAULT_STABLE_TAG, GroupRole};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    pub daemon: DaemonConfig,
    pub evaluation: EvaluationConfig,
    pub router: RouterConfig,
    pub instances: InstancesConfig,
    pub evidence: EvidenceConfig,
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address the REST API binds to.
    pub listen: String,
    /// Directory holding the release store.
    pub data_dir: PathBuf,
    /// Stable tag assumed for services that were never promoted.
    pub default_stable_tag: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8090".to_string(),
            data_dir: PathBuf::from("/var/lib/canary"),
            default_stable_tag: DEFAULT_STABLE_TAG.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterKind {
    #[default]
    Memory,
    Nginx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub kind: RouterKind,
    /// Generated upstream include file (nginx only).
    pub config_path: PathBuf,
    /// Validates the staged file; `{path}` is replaced with its location.
    pub test_command: Option<Vec<String>>,
    pub reload_command: Option<Vec<String>>,
    pub command_timeout: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            kind: RouterKind::Memory,
            config_path: PathBuf::from("/etc/nginx/conf.d/canary-upstreams.conf"),
            test_command: None,
            reload_command: None,
            command_timeout: "10s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancesKind {
    #[default]
    Local,
    Docker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstancesConfig {
    pub kind: InstancesKind,
    pub docker_bin: String,
    pub network: String,
    pub name_prefix: String,
    pub startup_grace: String,
    pub stop_timeout: String,
    pub command_timeout: String,
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            kind: InstancesKind::Local,
            docker_bin: "docker".to_string(),
            network: "banking-network".to_string(),
            name_prefix: "banking-".to_string(),
            startup_grace: "5s".to_string(),
            stop_timeout: "30s".to_string(),
            command_timeout: "60s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    /// Directory for evidence bundles. Unset means bundles are only logged.
    pub dir: Option<PathBuf>,
}

/// One managed service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Image repository; defaults to `{service}-service`.
    pub image: Option<String>,
    pub replicas: u32,
    /// Port every replica listens on.
    pub port: u16,
    /// Overrides the stable group's `host:port`.
    pub stable_address: Option<String>,
    /// Overrides the canary group's `host:port`.
    pub canary_address: Option<String>,
    pub health_path: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            image: None,
            replicas: 1,
            port: 8000,
            stable_address: None,
            canary_address: None,
            health_path: "/health".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn image(&self, service: &str) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| format!("{service}-service"))
    }

    pub fn address(&self, service: &str, role: GroupRole) -> String {
        let configured = match role {
            GroupRole::Stable => &self.stable_address,
            GroupRole::Canary => &self.canary_address,
        };
        configured
            .clone()
            .unwrap_or_else(|| format!("{}:{}", network_alias(service, role), self.port))
    }

    pub fn endpoints(&self, service: &str) -> GroupEndpoints {
        GroupEndpoints {
            stable_address: self.address(service, GroupRole::Stable),
            canary_address: self.address(service, GroupRole::Canary),
            health_path: self.health_path.clone(),
        }
    }

    pub fn upstream(&self, service: &str) -> UpstreamAddrs {
        UpstreamAddrs {
            stable: self.address(service, GroupRole::Stable),
            canary: self.address(service, GroupRole::Canary),
        }
    }
}

impl CanaryConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_addr()?;
        if self.daemon.default_stable_tag.trim().is_empty() {
            bail!("daemon.default_stable_tag must not be empty");
        }
        self.evaluation
            .validate()
            .map_err(|e| anyhow::anyhow!(e))?;

        if self.router.kind == RouterKind::Nginx {
            if self.router.config_path.as_os_str().is_empty() {
                bail!("router.config_path is required for the nginx router");
            }
            for (name, argv) in [
                ("test_command", &self.router.test_command),
                ("reload_command", &self.router.reload_command),
            ] {
                if argv.as_ref().is_some_and(|a| a.is_empty()) {
                    bail!("router.{name} must not be an empty list");
                }
            }
        }
        check_duration("router.command_timeout", &self.router.command_timeout)?;
        for (name, value) in [
            ("instances.startup_grace", &self.instances.startup_grace),
            ("instances.stop_timeout", &self.instances.stop_timeout),
            ("instances.command_timeout", &self.instances.command_timeout),
        ] {
            check_duration(name, value)?;
        }

        for (name, service) in &self.services {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                bail!("services.{name}: name must be alphanumeric or '-'");
            }
            if service.replicas == 0 {
                bail!("services.{name}.replicas must be at least 1");
            }
            if !service.health_path.starts_with('/') {
                bail!("services.{name}.health_path must start with '/'");
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.daemon
            .listen
            .parse()
            .with_context(|| format!("daemon.listen: invalid address {:?}", self.daemon.listen))
    }

    pub fn db_path(&self) -> PathBuf {
        self.daemon.data_dir.join("canary.redb")
    }

    /// Controller view: gate settings plus replica counts.
    pub fn controller(&self) -> ControllerConfig {
        self.services.iter().fold(
            ControllerConfig::new(self.evaluation.clone()),
            |config, (name, service)| config.with_service(name, service.replicas),
        )
    }
}

fn check_duration(name: &str, value: &str) -> anyhow::Result<()> {
    if parse_duration(value).is_none() {
        bail!("{name}: invalid duration {value:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[daemon]
listen = "127.0.0.1:9000"
data_dir = "/tmp/canary"

[evaluation]
interval = "2s"
window = "10s"
failure_threshold = 3
on_timeout = "conclude"

[router]
kind = "nginx"
config_path = "/tmp/upstreams.conf"
reload_command = ["nginx", "-s", "reload"]

[instances]
kind = "docker"
network = "bank"

[evidence]
dir = "/tmp/evidence"

[services.account]
image = "registry.local/account"
replicas = 2

[services.transaction]
port = 8001
canary_address = "10.0.0.9:8001"
"#;

    #[test]
    fn parses_full_file() {
        let config = CanaryConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.listen_addr().unwrap().port(), 9000);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/canary/canary.redb"));
        assert_eq!(config.evaluation.failure_threshold, 3);
        assert_eq!(config.evaluation.required_checks(), 5);
        assert_eq!(config.router.kind, RouterKind::Nginx);
        assert_eq!(config.instances.kind, InstancesKind::Docker);
        assert_eq!(config.instances.network, "bank");
        assert_eq!(config.instances.name_prefix, "banking-");
        assert_eq!(config.evidence.dir, Some(PathBuf::from("/tmp/evidence")));
        assert_eq!(config.services.len(), 2);
    }

    #[test]
    fn service_addresses_default_to_network_aliases() {
        let config = CanaryConfig::parse(SAMPLE).unwrap();
        let account = &config.services["account"];
        assert_eq!(account.image("account"), "registry.local/account");
        let endpoints = account.endpoints("account");
        assert_eq!(endpoints.stable_address, "account-service:8000");
        assert_eq!(endpoints.canary_address, "account-service-canary:8000");
        assert_eq!(endpoints.health_path, "/health");

        let transaction = &config.services["transaction"];
        assert_eq!(transaction.image("transaction"), "transaction-service");
        let upstream = transaction.upstream("transaction");
        assert_eq!(upstream.stable, "transaction-service:8001");
        assert_eq!(upstream.canary, "10.0.0.9:8001");
    }

    #[test]
    fn controller_view_carries_replicas() {
        let controller = CanaryConfig::parse(SAMPLE).unwrap().controller();
        assert_eq!(controller.replicas("account"), 2);
        assert_eq!(controller.replicas("transaction"), 1);
        assert!(!controller.is_known("ledger"));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = CanaryConfig::parse("").unwrap();
        assert_eq!(config.daemon.default_stable_tag, "latest");
        assert_eq!(config.router.kind, RouterKind::Memory);
        assert_eq!(config.instances.kind, InstancesKind::Local);
        assert!(config.services.is_empty());
        assert!(config.controller().is_known("anything"));
    }

    #[test]
    fn rejects_bad_values() {
        for bad in [
            "[daemon]\nlisten = \"nowhere\"",
            "[evaluation]\ninterval = \"soon\"",
            "[evaluation]\nfailure_threshold = 0",
            "[router]\nkind = \"nginx\"\nreload_command = []",
            "[instances]\nstop_timeout = \"forever\"",
            "[services.account]\nreplicas = 0",
            "[services.account]\nhealth_path = \"health\"",
            "[services.\"bad name\"]\n",
        ] {
            assert!(CanaryConfig::parse(bad).is_err(), "accepted: {bad}");
        }
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = CanaryConfig::from_file(Path::new("/nonexistent/canary.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
