//! reqwest-backed panel session

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::api::{ApiResponse, Credentials, Inbound, InboundRequest, PanelApi};
use crate::error::{VpnctlError, VpnctlResult};

pub struct HttpPanel {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPanel {
    /// Client with its own cookie jar holding the panel session
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> VpnctlResult<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send and decode the envelope, keeping the raw body for diagnostics
    async fn send(&self, endpoint: &str, request: RequestBuilder) -> VpnctlResult<(ApiResponse, String)> {
        debug!("Panel request {}", endpoint);
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(VpnctlError::api(endpoint, format!("HTTP {}: {}", status.as_u16(), body)));
        }
        let envelope = serde_json::from_str(&body).map_err(|_| VpnctlError::api(endpoint, body.clone()))?;
        Ok((envelope, body))
    }

    /// Send and require `success: true`
    async fn call(&self, endpoint: &str, request: RequestBuilder) -> VpnctlResult<Value> {
        let (envelope, body) = self.send(endpoint, request).await?;
        if !envelope.success {
            return Err(VpnctlError::api(endpoint, body));
        }
        Ok(envelope.obj)
    }
}

impl std::fmt::Debug for HttpPanel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPanel")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PanelApi for HttpPanel {
    async fn login(&self, username: &str, password: &str) -> VpnctlResult<bool> {
        let request = self
            .client
            .post(self.url("/login"))
            .form(&[("username", username), ("password", password)]);
        let (envelope, _) = self.send("/login", request).await?;
        Ok(envelope.success)
    }

    async fn update_user(&self, old: &Credentials, new: &Credentials) -> VpnctlResult<()> {
        let endpoint = "/panel/setting/updateUser";
        let request = self.client.post(self.url(endpoint)).form(&[
            ("oldUsername", old.username.as_str()),
            ("oldPassword", old.password.as_str()),
            ("newUsername", new.username.as_str()),
            ("newPassword", new.password.as_str()),
        ]);
        self.call(endpoint, request).await?;
        Ok(())
    }

    async fn list_inbounds(&self) -> VpnctlResult<Vec<Inbound>> {
        let endpoint = "/panel/api/inbounds/list";
        let obj = self.call(endpoint, self.client.get(self.url(endpoint))).await?;
        parse_inbounds(endpoint, obj)
    }

    async fn delete_inbound(&self, id: i64) -> VpnctlResult<()> {
        let endpoint = format!("/panel/api/inbounds/del/{}", id);
        self.call(&endpoint, self.client.post(self.url(&endpoint))).await?;
        Ok(())
    }

    async fn add_inbound(&self, inbound: &InboundRequest) -> VpnctlResult<()> {
        let endpoint = "/panel/api/inbounds/add";
        self.call(endpoint, self.client.post(self.url(endpoint)).json(inbound))
            .await?;
        Ok(())
    }

    async fn xray_config(&self) -> VpnctlResult<Value> {
        let endpoint = "/panel/api/server/getConfigJson";
        let obj = self.call(endpoint, self.client.get(self.url(endpoint))).await?;
        parse_config_obj(endpoint, obj)
    }

    async fn update_xray_template(&self, config: &Value) -> VpnctlResult<()> {
        let endpoint = "/panel/setting/update";
        let template = serde_json::to_string_pretty(config)?;
        let request = self
            .client
            .post(self.url(endpoint))
            .form(&[("xrayTemplateConfig", template.as_str())]);
        self.call(endpoint, request).await?;
        Ok(())
    }
}

/// `obj` of the inbound list; a panel with no inbounds answers `null`
fn parse_inbounds(endpoint: &str, obj: Value) -> VpnctlResult<Vec<Inbound>> {
    if obj.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(obj.clone()).map_err(|_| VpnctlError::api(endpoint, obj.to_string()))
}

/// `obj` of getConfigJson comes back either as an object or as its JSON text
fn parse_config_obj(endpoint: &str, obj: Value) -> VpnctlResult<Value> {
    match obj {
        Value::String(text) => {
            serde_json::from_str(&text).map_err(|_| VpnctlError::api(endpoint, text.clone()))
        }
        Value::Object(map) => Ok(Value::Object(map)),
        other => Err(VpnctlError::api(endpoint, other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base_url_normalized() {
        let panel = HttpPanel::new("http://localhost:2053/", Duration::from_secs(5)).unwrap();
        assert_eq!(panel.base_url(), "http://localhost:2053");
        assert_eq!(panel.url("/login"), "http://localhost:2053/login");
    }

    #[test]
    fn test_parse_inbounds() {
        let obj = json!([
            {"id": 3, "port": 443, "protocol": "vless", "remark": "VLESS-REALITY-AUTO", "up": 0},
            {"id": 4, "port": 8443, "protocol": "trojan", "remark": ""}
        ]);
        let inbounds = parse_inbounds("list", obj).unwrap();
        assert_eq!(inbounds.len(), 2);
        assert_eq!(inbounds[0].id, 3);
        assert_eq!(inbounds[1].port, 8443);

        assert!(parse_inbounds("list", Value::Null).unwrap().is_empty());
        assert!(parse_inbounds("list", json!({"id": "x"})).is_err());
    }

    #[test]
    fn test_config_obj_as_string_or_object() {
        let object = json!({"outbounds": [{"tag": "direct"}]});
        assert_eq!(parse_config_obj("cfg", object.clone()).unwrap(), object);

        let text = Value::String(object.to_string());
        assert_eq!(parse_config_obj("cfg", text).unwrap(), object);

        let err = parse_config_obj("cfg", Value::String("not json".to_string())).unwrap_err();
        match err {
            VpnctlError::Api { endpoint, body } => {
                assert_eq!(endpoint, "cfg");
                assert_eq!(body, "not json");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_inbound_request_wire_names() {
        let request = InboundRequest {
            up: 0,
            down: 0,
            total: 0,
            remark: "r".to_string(),
            enable: true,
            expiry_time: 0,
            listen: String::new(),
            port: 443,
            protocol: "vless".to_string(),
            settings: "{}".to_string(),
            stream_settings: "{}".to_string(),
            sniffing: "{}".to_string(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["expiryTime"], 0);
        assert_eq!(value["streamSettings"], "{}");
        assert!(value.get("stream_settings").is_none());
    }
}
