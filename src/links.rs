//! Client connection URIs
//!
//! Pure formatting over the secret store; nothing here touches the network.

use serde::Serialize;

use crate::error::VpnctlResult;
use crate::secrets::{defaults, keys, SecretStore};
use crate::validation;

/// Port the reality inbound always listens on
pub const REALITY_PORT: u16 = 443;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientLink {
    pub label: String,
    pub link: String,
}

/// Values the two URIs are built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkParams {
    pub client_id: String,
    pub public_key: String,
    pub short_id: String,
    pub sni: String,
    pub server_ip: String,
    pub hysteria_password: String,
    pub obfs_password: String,
    pub hysteria_port: String,
}

impl LinkParams {
    pub fn from_store(store: &SecretStore) -> VpnctlResult<Self> {
        let sni = store.get_or(keys::REALITY_SNI, defaults::REALITY_SNI);
        let server_ip = store.get_or(keys::SERVER_IP, defaults::SERVER_IP);
        validation::validate_hostname(sni)?;
        // Bracketed IPv6 literals are accepted as written
        let bare_ip = server_ip
            .strip_prefix('[')
            .and_then(|ip| ip.strip_suffix(']'))
            .unwrap_or(server_ip);
        validation::validate_hostname(bare_ip)?;

        Ok(Self {
            client_id: store.require(keys::VLESS_UUID)?.to_string(),
            public_key: store.require(keys::REALITY_PUBLIC_KEY)?.to_string(),
            short_id: store.require(keys::REALITY_SHORT_ID)?.to_string(),
            sni: sni.to_string(),
            server_ip: server_ip.to_string(),
            hysteria_password: store.require(keys::HYSTERIA_PASSWORD)?.to_string(),
            obfs_password: store.require(keys::HYSTERIA_OBFS_PASSWORD)?.to_string(),
            hysteria_port: store
                .get_or(keys::HYSTERIA_PORT, defaults::HYSTERIA_PORT)
                .to_string(),
        })
    }
}

/// Host part of a URI; IPv6 literals go in brackets
pub fn uri_host(host: &str) -> String {
    let host = host.trim();
    if host.starts_with('[') {
        host.to_string()
    } else if host.contains(':') {
        format!("[{}]", host)
    } else {
        urlencoding::encode(host).into_owned()
    }
}

fn enc(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

pub fn vless_link(params: &LinkParams) -> String {
    format!(
        "vless://{}@{}:{}?type=tcp&security=reality&pbk={}&fp=chrome&sni={}&sid={}&spx=%2F&flow=xtls-rprx-vision#VPN-VLESS-REALITY",
        enc(&params.client_id),
        uri_host(&params.server_ip),
        REALITY_PORT,
        enc(&params.public_key),
        enc(&params.sni),
        enc(&params.short_id),
    )
}

pub fn hysteria_link(params: &LinkParams) -> String {
    format!(
        "hysteria2://{}@{}:{}?insecure=1&sni={}&obfs=salamander&obfs-password={}#VPN-Hysteria2",
        enc(&params.hysteria_password),
        uri_host(&params.server_ip),
        enc(&params.hysteria_port),
        enc(&params.sni),
        enc(&params.obfs_password),
    )
}

/// Both client links from the current store
pub fn client_links(store: &SecretStore) -> VpnctlResult<Vec<ClientLink>> {
    let params = LinkParams::from_store(store)?;
    Ok(vec![
        ClientLink {
            label: "VLESS + REALITY".to_string(),
            link: vless_link(&params),
        },
        ClientLink {
            label: "Hysteria 2".to_string(),
            link: hysteria_link(&params),
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VpnctlError;
    use tempfile::TempDir;

    fn params() -> LinkParams {
        LinkParams {
            client_id: "11111111-1111-1111-1111-111111111111".to_string(),
            public_key: "abc123".to_string(),
            short_id: "deadbeef".to_string(),
            sni: "example.com".to_string(),
            server_ip: "203.0.113.5".to_string(),
            hysteria_password: "hpass".to_string(),
            obfs_password: "opass".to_string(),
            hysteria_port: "8443".to_string(),
        }
    }

    #[test]
    fn test_vless_link_exact() {
        assert_eq!(
            vless_link(&params()),
            "vless://11111111-1111-1111-1111-111111111111@203.0.113.5:443?type=tcp&security=reality&pbk=abc123&fp=chrome&sni=example.com&sid=deadbeef&spx=%2F&flow=xtls-rprx-vision#VPN-VLESS-REALITY"
        );
    }

    #[test]
    fn test_hysteria_link_exact() {
        assert_eq!(
            hysteria_link(&params()),
            "hysteria2://hpass@203.0.113.5:8443?insecure=1&sni=example.com&obfs=salamander&obfs-password=opass#VPN-Hysteria2"
        );
    }

    #[test]
    fn test_ipv6_host_is_bracketed() {
        let mut p = params();
        p.server_ip = "2001:db8::1".to_string();
        assert!(vless_link(&p).contains("@[2001:db8::1]:443?"));
        assert!(hysteria_link(&p).contains("@[2001:db8::1]:8443?"));
        assert_eq!(uri_host("[2001:db8::1]"), "[2001:db8::1]");
    }

    #[test]
    fn test_reserved_characters_are_encoded() {
        let mut p = params();
        p.hysteria_password = "a@b/c".to_string();
        assert!(hysteria_link(&p).starts_with("hysteria2://a%40b%2Fc@"));
    }

    #[test]
    fn test_links_from_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "VLESS_UUID=11111111-1111-1111-1111-111111111111\nREALITY_PUBLIC_KEY=abc123\nREALITY_SHORT_ID=deadbeef\nREALITY_SNI=example.com\nSERVER_IP=203.0.113.5\nHYSTERIA_PASSWORD=hpass\nHYSTERIA_OBFS_PASSWORD=opass\n",
        )
        .unwrap();
        let store = SecretStore::open(&path).unwrap();

        let links = client_links(&store).unwrap();
        assert_eq!(links[0].label, "VLESS + REALITY");
        assert_eq!(links[1].label, "Hysteria 2");
        assert!(links[1].link.contains(":443?insecure=1"));
    }

    #[test]
    fn test_bracketed_ipv6_server_from_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "VLESS_UUID=11111111-1111-1111-1111-111111111111\nREALITY_PUBLIC_KEY=abc123\nREALITY_SHORT_ID=deadbeef\nSERVER_IP=[2001:db8::1]\nHYSTERIA_PASSWORD=hpass\nHYSTERIA_OBFS_PASSWORD=opass\n",
        )
        .unwrap();
        let store = SecretStore::open(&path).unwrap();

        let links = client_links(&store).unwrap();
        assert!(links[0].link.contains("@[2001:db8::1]:443?"));

        std::fs::write(&path, "SERVER_IP=[2001:db8::1\n").unwrap();
        let store = SecretStore::open(&path).unwrap();
        assert!(matches!(client_links(&store), Err(VpnctlError::Validation(_))));
    }

    #[test]
    fn test_links_require_generated_keys() {
        let dir = TempDir::new().unwrap();
        let store = SecretStore::open(dir.path().join(".env")).unwrap();
        assert!(client_links(&store).is_err());
    }
}
