//! 3x-ui panel client
//!
//! Owns the reality inbound and the selective egress route on the panel.
//! Values flow one way: read from the secret store, pushed to the panel.

pub mod api;
pub mod http;
pub mod routing;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::{PanelSettings, RoutingSettings};
use crate::docker::DockerController;
use crate::error::{VpnctlError, VpnctlResult};
use crate::links::REALITY_PORT;
use crate::operation::StepLog;
use crate::secrets::{defaults, keys, SecretStore};
use crate::validation;

pub use api::{ApiResponse, Credentials, Inbound, InboundRequest, PanelApi};
pub use http::HttpPanel;

/// Remark the managed inbound is created with
pub const INBOUND_REMARK: &str = "VLESS-REALITY-AUTO";

const CLIENT_EMAIL: &str = "client@vpn";

/// How the session was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginOutcome {
    Configured,
    /// Factory credentials worked and were replaced by the configured ones
    Healed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SetupStep {
    LoggedIn,
    ExistingRemoved,
    InboundAdded,
    RoutingEnsured,
    TemplateSaved,
    PanelRestarted,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupReport {
    pub login: LoginOutcome,
    pub removed_inbounds: Vec<i64>,
    pub routing_changed: bool,
    pub completed: Vec<SetupStep>,
}

pub struct PanelClient {
    api: Box<dyn PanelApi>,
    settings: PanelSettings,
    routing: RoutingSettings,
    docker: DockerController,
}

impl PanelClient {
    pub fn new(
        api: Box<dyn PanelApi>,
        settings: PanelSettings,
        routing: RoutingSettings,
        docker: DockerController,
    ) -> Self {
        Self {
            api,
            settings,
            routing,
            docker,
        }
    }

    /// Panel base URL for the port recorded in the store
    pub fn base_url(settings: &PanelSettings, store: &SecretStore) -> String {
        format!(
            "http://{}:{}",
            settings.host,
            store.get_or(keys::XUI_PORT, defaults::XUI_PORT)
        )
    }

    fn configured_credentials(&self, store: &SecretStore) -> Credentials {
        Credentials::new(
            store.get_or(keys::XUI_USERNAME, &self.settings.default_username),
            store.get_or(keys::XUI_PASSWORD, &self.settings.default_password),
        )
    }

    /// Log in with the configured pair, falling back once to the factory pair
    ///
    /// A successful fallback immediately replaces the factory credentials
    /// with the configured ones.
    pub async fn login(&self, store: &SecretStore) -> VpnctlResult<LoginOutcome> {
        let configured = self.configured_credentials(store);
        if self.api.login(&configured.username, &configured.password).await? {
            info!("Logged in to panel as {}", configured.username);
            return Ok(LoginOutcome::Configured);
        }

        let factory = Credentials::new(
            self.settings.default_username.as_str(),
            self.settings.default_password.as_str(),
        );
        if factory == configured {
            return Err(VpnctlError::Auth(format!(
                "credentials for {} rejected",
                configured.username
            )));
        }

        warn!("Configured panel credentials rejected, trying factory credentials");
        if !self.api.login(&factory.username, &factory.password).await? {
            return Err(VpnctlError::Auth(
                "both configured and factory credentials rejected".to_string(),
            ));
        }

        self.api.update_user(&factory, &configured).await?;
        info!("Panel credentials reset to the configured pair");
        Ok(LoginOutcome::Healed)
    }

    /// Replace the reality inbound and make sure the egress route exists
    ///
    /// No rollback: a failure reports the step it stopped at and what on the
    /// panel had already changed.
    pub async fn setup_inbound(&self, store: &SecretStore) -> VpnctlResult<SetupReport> {
        // Everything the inbound needs must be in the store before we touch the panel
        let request = reality_inbound(store)?;
        let mut log = StepLog::new("inbound setup");

        let login = self
            .login(store)
            .await
            .map_err(|e| log.fail(SetupStep::LoggedIn, e))?;
        if login == LoginOutcome::Healed {
            log.mutated("panel credentials");
        }
        log.complete(SetupStep::LoggedIn);

        let existing = self
            .api
            .list_inbounds()
            .await
            .map_err(|e| log.fail(SetupStep::ExistingRemoved, e))?;
        let mut removed_inbounds = Vec::new();
        for inbound in existing.iter().filter(|i| i.port == REALITY_PORT) {
            self.api
                .delete_inbound(inbound.id)
                .await
                .map_err(|e| log.fail(SetupStep::ExistingRemoved, e))?;
            info!("Removed inbound {} on port {}", inbound.id, inbound.port);
            log.mutated("panel inbounds");
            removed_inbounds.push(inbound.id);
        }
        log.complete(SetupStep::ExistingRemoved);

        self.api
            .add_inbound(&request)
            .await
            .map_err(|e| log.fail(SetupStep::InboundAdded, e))?;
        log.mutated("panel inbounds");
        log.complete(SetupStep::InboundAdded);

        let mut config = self
            .api
            .xray_config()
            .await
            .map_err(|e| log.fail(SetupStep::RoutingEnsured, e))?;
        let outbound_added = routing::ensure_outbound(&mut config, &self.routing);
        let rule_added = routing::ensure_routing_rule(&mut config, &self.routing);
        let routing_changed = outbound_added || rule_added;
        log.complete(SetupStep::RoutingEnsured);

        if routing_changed {
            self.api
                .update_xray_template(&config)
                .await
                .map_err(|e| log.fail(SetupStep::TemplateSaved, e))?;
            log.mutated("panel xray template");
            log.complete(SetupStep::TemplateSaved);

            self.docker
                .restart_container(&self.settings.container)
                .await
                .map_err(|e| log.fail(SetupStep::PanelRestarted, e))?;
            log.complete(SetupStep::PanelRestarted);
        } else {
            info!("Egress route '{}' already present", self.routing.warp_tag);
        }

        Ok(SetupReport {
            login,
            removed_inbounds,
            routing_changed,
            completed: log.into_completed(),
        })
    }
}

/// Reality inbound definition from current store values
pub fn reality_inbound(store: &SecretStore) -> VpnctlResult<InboundRequest> {
    let sni = store.get_or(keys::REALITY_SNI, defaults::REALITY_SNI);
    validation::validate_hostname(sni)?;
    let client_id = store.require(keys::VLESS_UUID)?;
    let private_key = store.require(keys::REALITY_PRIVATE_KEY)?;
    let short_id = store.require(keys::REALITY_SHORT_ID)?;

    let settings = json!({
        "clients": [{"id": client_id, "flow": "xtls-rprx-vision", "email": CLIENT_EMAIL}],
        "decryption": "none",
        "fallbacks": []
    });
    let stream_settings = json!({
        "network": "tcp",
        "security": "reality",
        "realitySettings": {
            "show": false,
            "dest": format!("{}:443", sni),
            "proxyProtocol": 0,
            "serverNames": [sni],
            "privateKey": private_key,
            "minClient": "",
            "maxClient": "",
            "format": "",
            "shortIds": [short_id]
        },
        "tcpSettings": {"header": {"type": "none"}}
    });
    let sniffing = json!({"enabled": true, "destOverride": ["http", "tls"]});

    Ok(InboundRequest {
        up: 0,
        down: 0,
        total: 0,
        remark: INBOUND_REMARK.to_string(),
        enable: true,
        expiry_time: 0,
        listen: String::new(),
        port: REALITY_PORT,
        protocol: "vless".to_string(),
        settings: settings.to_string(),
        stream_settings: stream_settings.to_string(),
        sniffing: sniffing.to_string(),
    })
}
