//! vpnctl - VPN Gateway Lifecycle Library
//!
//! Async management library for a self-hosted VLESS-Reality / Hysteria2
//! gateway running under docker compose:
//! - Secret store (the deployment `.env` file)
//! - Reality key pair and credential generation
//! - 3x-ui panel provisioning over its HTTP API
//! - Hysteria2 config rendering from templates
//! - Coordinated port changes (firewall, daemon config, panel, fail2ban)
//! - Backup archives and restore, including the panel database volume
//!
//! Every host mutation goes through a [`CommandRunner`], every panel call
//! through a [`PanelApi`].

pub mod error;
pub mod config;
pub mod validation;
pub mod command;
pub mod docker;
pub mod firewall;
pub mod secrets;
pub mod keygen;
pub mod template;
pub mod links;
pub mod panel;
pub mod port;
pub mod backup;
pub mod geodata;
pub mod operation;
pub mod manager;

// Re-export commonly used types
pub use error::{VpnctlError, VpnctlResult};
pub use config::{VpnctlConfig, DEFAULT_CONFIG_PATH};
pub use command::{CommandOutput, CommandRunner, Invocation, SystemCommandRunner};
pub use docker::DockerController;
pub use firewall::FirewallController;
pub use secrets::{SecretRecord, SecretStore};
pub use keygen::{KeyGenerator, KeyPair, KeyPairSource};
pub use links::ClientLink;
pub use panel::{HttpPanel, LoginOutcome, PanelApi, PanelClient, SetupReport, SetupStep};
pub use port::{MigrationReport, MigrationState, MigrationTarget, PortMigrator};
pub use backup::{BackupEngine, RestoreReport, RestoreStep};
pub use geodata::GeodataUpdater;
pub use operation::StepLog;
pub use manager::{LifecycleManager, PanelFactory, RotationReport, RotationStep};
