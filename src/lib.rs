//! Single-node instance orchestrator.
//!
//! [`App`] wires the subsystems together around one [`EventBus`]: the
//! [`InstanceService`] publishes lifecycle and log events, the [`LogBroker`]
//! buffers them per instance and the [`ProxyRouter`] forwards HTTP traffic by
//! host according to the [`RedirectTable`].

pub mod bus;
pub mod config;
pub mod error;
pub mod instance;
pub mod logs;
pub mod paths;
pub mod proxy;
pub mod runner;
pub mod service;
pub mod storage;
pub mod validation;

use std::sync::Arc;

use bus::{EventBus, Listener};
use config::AppConfig;
use instance::{ConnectivityProbe, HttpProbe, InstanceService};
use logs::LogBroker;
use proxy::{ProxyRouter, RedirectTable};
use runner::{ContainerRunner, DockerRunner};
use service::ServiceCatalog;
use storage::{FsInstanceStore, InstanceStore};

pub use error::{AppError, ErrorKind, Result};

pub struct App {
    config: AppConfig,
    bus: Arc<EventBus>,
    catalog: Arc<ServiceCatalog>,
    instances: Arc<InstanceService>,
    logs: Arc<LogBroker>,
    router: Arc<ProxyRouter>,
}

impl App {
    /// Build the application on top of the docker CLI and an HTTP probe.
    pub fn new(config: AppConfig) -> Result<Self> {
        let runner = DockerRunner::new(config.docker_bin.clone(), config.paths())?;
        let probe = HttpProbe::new(config.probe_url.clone(), config.probe_timeout())?;
        Self::with_parts(config, Arc::new(runner), Arc::new(probe))
    }

    pub fn with_parts(
        config: AppConfig,
        runner: Arc<dyn ContainerRunner>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Result<Self> {
        config.validate()?;
        let paths = config.paths();
        paths.ensure_dirs()?;

        let bus = Arc::new(EventBus::new());

        let catalog = Arc::new(ServiceCatalog::new());
        catalog.load_dir(&config.services_dir())?;

        let logs = Arc::new(LogBroker::new(config.log_buffer_size));
        let listener: Arc<dyn Listener> = Arc::clone(&logs) as Arc<dyn Listener>;
        bus.add_listener(listener);

        let redirects = Arc::new(RedirectTable::load(&paths.redirects_path())?);
        let router = Arc::new(ProxyRouter::new(redirects)?);

        let store: Arc<dyn InstanceStore> = Arc::new(FsInstanceStore::new(paths));
        let instances = InstanceService::new(
            Arc::clone(&bus),
            store,
            runner,
            Arc::clone(&catalog),
            probe,
        )
        .with_host(config.host.clone())
        .with_supported_versions(config.version_req()?);

        Ok(Self {
            config,
            bus,
            catalog,
            instances: Arc::new(instances),
            logs,
            router,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn catalog(&self) -> &Arc<ServiceCatalog> {
        &self.catalog
    }

    pub fn instances(&self) -> &Arc<InstanceService> {
        &self.instances
    }

    pub fn logs(&self) -> &Arc<LogBroker> {
        &self.logs
    }

    pub fn router(&self) -> &Arc<ProxyRouter> {
        &self.router
    }

    pub fn redirects(&self) -> &Arc<RedirectTable> {
        self.router.table()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::bus::{Event, LogPayload, Subscription};
    use crate::instance::testing::{FakeProbe, FakeRunner};
    use crate::instance::InstanceStatus;
    use crate::service::{fixtures, InstallMethod};

    fn build_app(dir: &std::path::Path) -> App {
        let config = AppConfig {
            data_dir: dir.to_path_buf(),
            ..AppConfig::default()
        };
        App::with_parts(
            config,
            Arc::new(FakeRunner::default()),
            Arc::new(FakeProbe::new(true)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn instance_round_trip_through_the_app() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_app(dir.path());

        let mut statuses = Subscription::spawn(
            Arc::clone(app.bus()),
            |e: &Event| matches!(e, Event::StatusChanged { .. }),
            CancellationToken::new(),
        );

        let instance = app
            .instances()
            .install(fixtures::redis(), InstallMethod::Docker)
            .await
            .unwrap();
        assert_eq!(instance.status, InstanceStatus::Off);
        assert_eq!(instance.env["PORT"], "6379");

        app.instances().start(&instance.id).await.unwrap();
        app.instances().stop(&instance.id).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(5), statuses.recv())
                .await
                .unwrap()
                .unwrap();
            if let Event::StatusChanged { status, .. } = event {
                seen.push(status);
            }
        }
        assert_eq!(
            seen,
            vec![
                InstanceStatus::Starting,
                InstanceStatus::Running,
                InstanceStatus::Off
            ]
        );

        app.instances().delete(&instance.id).await.unwrap();
        assert!(app.instances().get_all().is_empty());
        assert!(!dir.path().join("instances").join(&instance.id).exists());
    }

    #[tokio::test]
    async fn persisted_instances_reload() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let app = build_app(dir.path());
            app.instances()
                .install(fixtures::postgres(), InstallMethod::Docker)
                .await
                .unwrap()
                .id
        };

        let app = build_app(dir.path());
        assert_eq!(app.instances().load_all().unwrap(), 1);
        let loaded = app.instances().get(&id).unwrap();
        assert_eq!(loaded.env["POSTGRES_USER"], "postgres");
        assert_eq!(loaded.service, fixtures::postgres());
    }

    #[tokio::test]
    async fn log_events_reach_the_broker() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_app(dir.path());
        let instance = app
            .instances()
            .install(fixtures::redis(), InstallMethod::Docker)
            .await
            .unwrap();
        app.instances().start(&instance.id).await.unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let lines = app.logs().load_buffer(&instance.id);
                if lines
                    .iter()
                    .any(|l| l.payload == LogPayload::Stdout("ready".to_string()))
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok());
    }

    #[test]
    fn redirects_load_from_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let app = build_app(dir.path());
            app.redirects()
                .add_redirect("app.local", "http://127.0.0.1:8080")
                .unwrap()
        };

        let app = build_app(dir.path());
        let redirect = app.redirects().get_redirect_by_host("app.local").unwrap();
        assert_eq!(redirect.id, id);
    }
}
