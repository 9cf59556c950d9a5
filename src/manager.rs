//! Lifecycle manager
//!
//! Entry point for every operator action. Holds the one [`SecretStore`] all
//! components read from and hands out controllers wired to the same command
//! runner.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::backup::{BackupEngine, RestoreReport};
use crate::command::{CommandRunner, SystemCommandRunner};
use crate::config::VpnctlConfig;
use crate::docker::DockerController;
use crate::error::VpnctlResult;
use crate::geodata::GeodataUpdater;
use crate::keygen::KeyGenerator;
use crate::links::{self, ClientLink};
use crate::operation::StepLog;
use crate::panel::{HttpPanel, PanelApi, PanelClient, SetupReport};
use crate::port::{self, MigrationReport, PortMigrator};
use crate::secrets::{defaults, keys, SecretRecord, SecretStore};
use crate::template;

/// Opens a panel session for the current store values
pub type PanelFactory =
    Box<dyn Fn(&VpnctlConfig, &SecretStore) -> VpnctlResult<Box<dyn PanelApi>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RotationStep {
    KeysGenerated,
    InboundConfigured,
    HysteriaConfigured,
    StackRestarted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RotationReport {
    pub setup: SetupReport,
    pub links: Vec<ClientLink>,
    pub completed: Vec<RotationStep>,
}

pub struct LifecycleManager {
    config: VpnctlConfig,
    store: SecretStore,
    runner: Arc<dyn CommandRunner>,
    panel_factory: PanelFactory,
    keygen: KeyGenerator,
}

impl LifecycleManager {
    /// Manager acting on the host: real processes, HTTP panel
    pub fn new(config: VpnctlConfig) -> VpnctlResult<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new());
        let keygen = KeyGenerator::with_default_chain(runner.clone(), &config.docker);
        Self::with_parts(config, runner, Box::new(http_panel), keygen)
    }

    pub fn with_parts(
        config: VpnctlConfig,
        runner: Arc<dyn CommandRunner>,
        panel_factory: PanelFactory,
        keygen: KeyGenerator,
    ) -> VpnctlResult<Self> {
        let store = SecretStore::open(config.env_file())?;
        Ok(Self {
            config,
            store,
            runner,
            panel_factory,
            keygen,
        })
    }

    pub fn config(&self) -> &VpnctlConfig {
        &self.config
    }

    pub fn store(&self) -> &SecretStore {
        &self.store
    }

    fn docker(&self) -> DockerController {
        DockerController::new(
            self.runner.clone(),
            self.config.paths.project_dir.clone(),
            self.config.docker.helper_image.clone(),
        )
    }

    fn panel_client(&self) -> VpnctlResult<PanelClient> {
        let api = (self.panel_factory)(&self.config, &self.store)?;
        Ok(PanelClient::new(
            api,
            self.config.panel.clone(),
            self.config.routing.clone(),
            self.docker(),
        ))
    }

    /// Fresh key pair, client id, short id and passwords into the store
    pub async fn generate_keys(&mut self) -> VpnctlResult<SecretRecord> {
        self.keygen.generate_keys(&mut self.store).await
    }

    pub async fn setup_inbound(&self) -> VpnctlResult<SetupReport> {
        self.panel_client()?.setup_inbound(&self.store).await
    }

    pub fn client_links(&self) -> VpnctlResult<Vec<ClientLink>> {
        links::client_links(&self.store)
    }

    pub async fn update_geodata(&self) -> VpnctlResult<()> {
        GeodataUpdater::new(&self.config, self.runner.clone())
            .update()
            .await
    }

    pub async fn change_hysteria_port(&mut self, input: &str) -> VpnctlResult<MigrationReport> {
        PortMigrator::new(&self.config, self.runner.clone())
            .change_hysteria_port(&mut self.store, input)
            .await
    }

    pub async fn change_panel_port(&mut self, input: &str) -> VpnctlResult<MigrationReport> {
        PortMigrator::new(&self.config, self.runner.clone())
            .change_panel_port(&mut self.store, input)
            .await
    }

    pub async fn create_backup(&self) -> VpnctlResult<PathBuf> {
        BackupEngine::new(&self.config, self.runner.clone())
            .create_backup()
            .await
    }

    /// Restore and pick up the restored secret store
    ///
    /// The store is re-read even when the restore stopped part way, since
    /// `.env` may already have been replaced.
    pub async fn restore_backup(&mut self, archive: &Path) -> VpnctlResult<RestoreReport> {
        let result = BackupEngine::new(&self.config, self.runner.clone())
            .restore_backup(archive)
            .await;
        let reloaded = self.store.reload();
        let report = result?;
        reloaded?;
        Ok(report)
    }

    /// Render the Hysteria2 config for the port currently in the store
    pub fn regenerate_hysteria_config(&self) -> VpnctlResult<()> {
        let port = port::stored_port(&self.store, keys::HYSTERIA_PORT, defaults::HYSTERIA_PORT)?;
        template::render_hysteria_config(
            &self.store,
            &self.config.hysteria_template(),
            &self.config.hysteria_config(),
            port,
        )
    }

    pub async fn restart_stack(&self) -> VpnctlResult<()> {
        self.docker().restart_all().await
    }

    /// Full credential rotation: new secrets pushed to every consumer
    pub async fn rotate_keys(&mut self) -> VpnctlResult<RotationReport> {
        let mut log = StepLog::new("key rotation");

        self.generate_keys()
            .await
            .map_err(|e| log.fail(RotationStep::KeysGenerated, e))?;
        log.mutated("secret store");
        log.complete(RotationStep::KeysGenerated);

        let setup = self
            .setup_inbound()
            .await
            .map_err(|e| log.fail(RotationStep::InboundConfigured, e))?;
        log.mutated("panel inbounds");
        log.complete(RotationStep::InboundConfigured);

        self.regenerate_hysteria_config()
            .map_err(|e| log.fail(RotationStep::HysteriaConfigured, e))?;
        log.mutated("hysteria2 config");
        log.complete(RotationStep::HysteriaConfigured);

        self.restart_stack()
            .await
            .map_err(|e| log.fail(RotationStep::StackRestarted, e))?;
        log.complete(RotationStep::StackRestarted);

        info!("Key rotation complete");
        Ok(RotationReport {
            setup,
            links: self.client_links()?,
            completed: log.into_completed(),
        })
    }
}

fn http_panel(config: &VpnctlConfig, store: &SecretStore) -> VpnctlResult<Box<dyn PanelApi>> {
    let panel = HttpPanel::new(
        PanelClient::base_url(&config.panel, store),
        Duration::from_secs(config.panel.request_timeout_secs),
    )?;
    Ok(Box::new(panel))
}
