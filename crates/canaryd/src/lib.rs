//! canaryd — the canary release daemon.
//!
//! Assembles the release store, traffic router, instance group manager,
//! health prober and evidence sink from a [`CanaryConfig`] and hands them
//! to the [`CanaryController`].

pub mod config;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use canary_controller::{
    CanaryController, Components, EvidenceSink, FileEvidenceSink, LogEvidenceSink,
};
use canary_health::{HttpProber, parse_duration};
use canary_instances::{DockerConfig, DockerGroupManager, InstanceGroupManager, LocalGroupManager};
use canary_router::{MemoryRouter, NginxRouter, TrafficRouter};
use canary_state::{ReleaseStore, StateStore};

pub use config::{CanaryConfig, InstancesKind, RouterKind, ServiceConfig};

/// Open the release store under `daemon.data_dir`.
pub fn open_store(config: &CanaryConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.daemon.data_dir).with_context(|| {
        format!(
            "failed to create data dir {}",
            config.daemon.data_dir.display()
        )
    })?;
    let path = config.db_path();
    let store = StateStore::open(&path)?.with_default_tag(&config.daemon.default_stable_tag);
    info!(path = %path.display(), "release store opened");
    Ok(store)
}

/// Build a controller over an already-open store.
pub fn build_controller(
    config: &CanaryConfig,
    store: StateStore,
) -> anyhow::Result<CanaryController> {
    let store: Arc<dyn ReleaseStore> = Arc::new(store);
    let components = Components {
        store,
        router: build_router(config),
        instances: build_instances(config),
        prober: Arc::new(build_prober(config)),
        evidence: build_evidence(config),
    };
    Ok(CanaryController::new(components, config.controller()))
}

fn build_router(config: &CanaryConfig) -> Arc<dyn TrafficRouter> {
    match config.router.kind {
        RouterKind::Memory => {
            info!("in-memory traffic router");
            Arc::new(MemoryRouter::new())
        }
        RouterKind::Nginx => {
            let mut router = NginxRouter::new(&config.router.config_path)
                .with_command_timeout(duration(&config.router.command_timeout));
            if let Some(argv) = &config.router.test_command {
                router = router.with_test_command(argv.clone());
            }
            if let Some(argv) = &config.router.reload_command {
                router = router.with_reload_command(argv.clone());
            }
            for (name, service) in &config.services {
                router = router.with_upstream(name, service.upstream(name));
            }
            info!(path = %config.router.config_path.display(), "nginx traffic router");
            Arc::new(router)
        }
    }
}

fn build_instances(config: &CanaryConfig) -> Arc<dyn InstanceGroupManager> {
    match config.instances.kind {
        InstancesKind::Local => {
            info!("local instance groups");
            Arc::new(LocalGroupManager::new())
        }
        InstancesKind::Docker => {
            let images: HashMap<String, String> = config
                .services
                .iter()
                .map(|(name, service)| (name.clone(), service.image(name)))
                .collect();
            let docker = DockerConfig {
                docker_bin: config.instances.docker_bin.clone(),
                network: config.instances.network.clone(),
                name_prefix: config.instances.name_prefix.clone(),
                images,
                startup_grace: duration(&config.instances.startup_grace),
                stop_timeout: duration(&config.instances.stop_timeout),
                command_timeout: duration(&config.instances.command_timeout),
            };
            info!(network = %docker.network, "docker instance groups");
            Arc::new(DockerGroupManager::new(docker))
        }
    }
}

fn build_prober(config: &CanaryConfig) -> HttpProber {
    config
        .services
        .iter()
        .fold(HttpProber::new(), |prober, (name, service)| {
            prober.with_service(name, service.endpoints(name))
        })
}

fn build_evidence(config: &CanaryConfig) -> Arc<dyn EvidenceSink> {
    match &config.evidence.dir {
        Some(dir) => Arc::new(FileEvidenceSink::new(dir)),
        None => Arc::new(LogEvidenceSink),
    }
}

// Durations are checked by `CanaryConfig::validate`.
fn duration(value: &str) -> Duration {
    parse_duration(value).unwrap_or_default()
}
