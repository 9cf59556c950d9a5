//! Port migration for the Hysteria2 listener and the panel
//!
//! Each migration walks `Requested -> Validated -> FirewallUpdated ->
//! ConfigRewritten -> DaemonRestarted -> Done`. Firewall and fail2ban calls
//! only produce warnings; every other step aborts the migration and the error
//! names the step and the stores already changed. Nothing is rolled back.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::command::CommandRunner;
use crate::config::VpnctlConfig;
use crate::docker::DockerController;
use crate::error::{VpnctlError, VpnctlResult};
use crate::firewall::{FirewallController, Protocol};
use crate::operation::StepLog;
use crate::secrets::{defaults, keys, SecretStore};
use crate::template;
use crate::validation::{validate_port, PortKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationState {
    Requested,
    Validated,
    FirewallUpdated,
    ConfigRewritten,
    DaemonRestarted,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationTarget {
    Hysteria,
    Panel,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub target: MigrationTarget,
    pub old_port: u16,
    pub new_port: u16,
    pub completed: Vec<MigrationState>,
    /// Best-effort steps that did not succeed
    pub warnings: Vec<String>,
}

pub struct PortMigrator {
    firewall: FirewallController,
    docker: DockerController,
    hysteria_template: PathBuf,
    hysteria_config: PathBuf,
    hysteria_service: String,
    panel_container: String,
    panel_binary: String,
    fail2ban_jail: PathBuf,
}

impl PortMigrator {
    pub fn new(config: &VpnctlConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            firewall: FirewallController::new(runner.clone()),
            docker: DockerController::new(
                runner,
                config.paths.project_dir.clone(),
                config.docker.helper_image.clone(),
            ),
            hysteria_template: config.hysteria_template(),
            hysteria_config: config.hysteria_config(),
            hysteria_service: config.docker.hysteria_service.clone(),
            panel_container: config.panel.container.clone(),
            panel_binary: config.panel.binary.clone(),
            fail2ban_jail: config.paths.fail2ban_jail.clone(),
        }
    }

    /// Move the Hysteria2 listener to `input`
    pub async fn change_hysteria_port(&self, store: &mut SecretStore, input: &str) -> VpnctlResult<MigrationReport> {
        let new_port = validate_port(input, PortKind::Listener)?;
        let old_port = stored_port(store, keys::HYSTERIA_PORT, defaults::HYSTERIA_PORT)?;

        let mut log = StepLog::new("hysteria port migration");
        let mut warnings = Vec::new();
        log.complete(MigrationState::Requested);

        if new_port == old_port {
            info!("Hysteria2 already listens on {}", new_port);
            return Ok(finished(MigrationTarget::Hysteria, old_port, new_port, log, warnings));
        }

        store
            .set(keys::HYSTERIA_PORT, &new_port.to_string())
            .map_err(|e| log.fail(MigrationState::Validated, e))?;
        log.mutated("secret store");
        log.complete(MigrationState::Validated);

        warnings.extend(self.firewall.delete_allow(old_port, Protocol::Udp).await);
        warnings.extend(
            self.firewall
                .allow(new_port, Protocol::Udp, "Hysteria2 (Auto)")
                .await,
        );
        log.complete(MigrationState::FirewallUpdated);

        template::apply_hysteria_config(
            store,
            &self.hysteria_template,
            &self.hysteria_config,
            old_port,
            new_port,
        )
        .map_err(|e| log.fail(MigrationState::ConfigRewritten, e))?;
        log.mutated("hysteria2 config");
        log.complete(MigrationState::ConfigRewritten);

        self.docker
            .restart_service(&self.hysteria_service)
            .await
            .map_err(|e| log.fail(MigrationState::DaemonRestarted, e))?;
        log.complete(MigrationState::DaemonRestarted);

        Ok(finished(MigrationTarget::Hysteria, old_port, new_port, log, warnings))
    }

    /// Move the panel web UI to `input`
    ///
    /// The new firewall rule goes in before the old one is dropped so the
    /// operator is never locked out of the panel.
    pub async fn change_panel_port(&self, store: &mut SecretStore, input: &str) -> VpnctlResult<MigrationReport> {
        let new_port = validate_port(input, PortKind::Panel)?;
        let old_port = stored_port(store, keys::XUI_PORT, defaults::XUI_PORT)?;

        let mut log = StepLog::new("panel port migration");
        let mut warnings = Vec::new();
        log.complete(MigrationState::Requested);

        if new_port == old_port {
            info!("Panel already listens on {}", new_port);
            return Ok(finished(MigrationTarget::Panel, old_port, new_port, log, warnings));
        }

        store
            .set(keys::XUI_PORT, &new_port.to_string())
            .map_err(|e| log.fail(MigrationState::Validated, e))?;
        log.mutated("secret store");
        log.complete(MigrationState::Validated);

        warnings.extend(
            self.firewall
                .allow(new_port, Protocol::Tcp, "3x-ui Panel (new)")
                .await,
        );
        warnings.extend(self.firewall.delete_allow(old_port, Protocol::Tcp).await);
        log.complete(MigrationState::FirewallUpdated);

        let port_arg = new_port.to_string();
        self.docker
            .exec(
                &self.panel_container,
                &[self.panel_binary.as_str(), "setting", "-port", port_arg.as_str()],
            )
            .await
            .map_err(|e| log.fail(MigrationState::ConfigRewritten, e))?;
        log.mutated("panel settings");

        if self.fail2ban_jail.exists() {
            match self.firewall.update_jail_port(&self.fail2ban_jail, old_port, new_port) {
                Some(warning) => warnings.push(warning),
                None => {
                    log.mutated("fail2ban jail");
                    warnings.extend(self.firewall.restart_fail2ban().await);
                }
            }
        } else {
            warnings.push(format!(
                "No fail2ban jail at {}, intrusion prevention not updated",
                self.fail2ban_jail.display()
            ));
        }
        log.complete(MigrationState::ConfigRewritten);

        self.docker
            .restart_container(&self.panel_container)
            .await
            .map_err(|e| log.fail(MigrationState::DaemonRestarted, e))?;
        log.complete(MigrationState::DaemonRestarted);

        Ok(finished(MigrationTarget::Panel, old_port, new_port, log, warnings))
    }
}

/// Port currently recorded in the store
pub(crate) fn stored_port(store: &SecretStore, key: &str, default: &str) -> VpnctlResult<u16> {
    let value = store.get_or(key, default);
    validate_port(value, PortKind::Listener)
        .map_err(|_| VpnctlError::validation(format!("{} in the secret store is not a port: {}", key, value)))
}

fn finished(
    target: MigrationTarget,
    old_port: u16,
    new_port: u16,
    mut log: StepLog<MigrationState>,
    warnings: Vec<String>,
) -> MigrationReport {
    if log.last_completed() == Some(MigrationState::Requested) {
        log.complete(MigrationState::Validated);
    }
    log.complete(MigrationState::Done);
    MigrationReport {
        target,
        old_port,
        new_port,
        completed: log.into_completed(),
        warnings,
    }
}
