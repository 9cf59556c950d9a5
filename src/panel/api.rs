//! Panel REST API surface

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::VpnctlResult;

/// Envelope every panel endpoint answers with
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub obj: Value,
}

/// Inbound as listed by the panel; only the fields we match on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inbound {
    pub id: i64,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub remark: String,
}

/// Body of `inbounds/add`; nested settings travel as JSON strings
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRequest {
    pub up: u64,
    pub down: u64,
    pub total: u64,
    pub remark: String,
    pub enable: bool,
    pub expiry_time: i64,
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    pub settings: String,
    pub stream_settings: String,
    pub sniffing: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Session-authenticated panel endpoints
///
/// Implementations keep the session cookie between calls, so `login` must
/// succeed before anything else is called.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PanelApi: Send + Sync {
    /// `POST /login`; `Ok(false)` means the credentials were rejected
    async fn login(&self, username: &str, password: &str) -> VpnctlResult<bool>;

    /// `POST /panel/setting/updateUser`
    async fn update_user(&self, old: &Credentials, new: &Credentials) -> VpnctlResult<()>;

    /// `GET /panel/api/inbounds/list`
    async fn list_inbounds(&self) -> VpnctlResult<Vec<Inbound>>;

    /// `POST /panel/api/inbounds/del/{id}`
    async fn delete_inbound(&self, id: i64) -> VpnctlResult<()>;

    /// `POST /panel/api/inbounds/add`
    async fn add_inbound(&self, inbound: &InboundRequest) -> VpnctlResult<()>;

    /// `GET /panel/api/server/getConfigJson`
    async fn xray_config(&self) -> VpnctlResult<Value>;

    /// `POST /panel/setting/update` with the xray template
    async fn update_xray_template(&self, config: &Value) -> VpnctlResult<()>;
}
