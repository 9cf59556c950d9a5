//! Configuration management for vpnctl
//!
//! Tool configuration only: paths, container names, images and routing
//! defaults. Generated secrets and ports live in the secret store.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::error::{VpnctlError, VpnctlResult};

/// Default location of the tool configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vpnctl/vpnctl.toml";

/// Main vpnctl configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VpnctlConfig {
    #[serde(default)]
    pub paths: ConfigPaths,
    #[serde(default)]
    pub panel: PanelSettings,
    #[serde(default)]
    pub docker: DockerSettings,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub geodata: GeodataSettings,
    #[serde(default)]
    pub routing: RoutingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// Deployment directory holding .env, docker-compose.yml and daemon configs
    #[serde(default = "default_project_dir")]
    pub project_dir: PathBuf,
    /// Where backup archives are written
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    /// Parent directory for restore scratch directories
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Host fail2ban jail referencing the panel port
    #[serde(default = "default_jail_file")]
    pub fail2ban_jail: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelSettings {
    #[serde(default = "default_panel_host")]
    pub host: String,
    #[serde(default = "default_panel_container")]
    pub container: String,
    /// Docker volume holding the panel database
    #[serde(default = "default_panel_volume")]
    pub volume: String,
    /// Panel CLI inside the container
    #[serde(default = "default_panel_binary")]
    pub binary: String,
    /// Factory credentials tried when the configured pair is rejected
    #[serde(default = "default_panel_credential")]
    pub default_username: String,
    #[serde(default = "default_panel_credential")]
    pub default_password: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSettings {
    /// Image whose xray binary generates reality keys
    #[serde(default = "default_xray_image")]
    pub xray_image: String,
    /// Image used for short-lived volume copy containers
    #[serde(default = "default_helper_image")]
    pub helper_image: String,
    #[serde(default = "default_keygen_timeout")]
    pub keygen_timeout_secs: u64,
    /// Compose service name of the Hysteria2 daemon
    #[serde(default = "default_hysteria_service")]
    pub hysteria_service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Number of archives kept after each backup
    #[serde(default = "default_retention")]
    pub retention: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeodataSettings {
    #[serde(default = "default_geoip_url")]
    pub geoip_url: String,
    #[serde(default = "default_geosite_url")]
    pub geosite_url: String,
    /// Directories inside the panel container receiving the .dat files
    #[serde(default = "default_geodata_dirs")]
    pub target_dirs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSettings {
    /// Tag of the selective egress outbound
    #[serde(default = "default_warp_tag")]
    pub warp_tag: String,
    #[serde(default = "default_warp_address")]
    pub warp_address: String,
    #[serde(default = "default_warp_port")]
    pub warp_port: u16,
    /// Domain matchers routed through the egress outbound
    #[serde(default = "default_warp_domains")]
    pub warp_domains: Vec<String>,
}

fn default_project_dir() -> PathBuf {
    PathBuf::from("/root/vpn")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/root/VPN-backups")
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_jail_file() -> PathBuf {
    PathBuf::from("/etc/fail2ban/jail.local")
}

fn default_panel_host() -> String {
    "localhost".to_string()
}

fn default_panel_container() -> String {
    "3x-ui".to_string()
}

fn default_panel_volume() -> String {
    "3xui-db".to_string()
}

fn default_panel_binary() -> String {
    "/app/x-ui".to_string()
}

fn default_panel_credential() -> String {
    "admin".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_xray_image() -> String {
    "teddysun/xray:latest".to_string()
}

fn default_helper_image() -> String {
    "alpine".to_string()
}

fn default_keygen_timeout() -> u64 {
    15
}

fn default_hysteria_service() -> String {
    "hysteria2".to_string()
}

fn default_retention() -> usize {
    5
}

fn default_geoip_url() -> String {
    "https://github.com/Loyalsoldier/v2ray-rules-dat/releases/latest/download/geoip.dat".to_string()
}

fn default_geosite_url() -> String {
    "https://github.com/Loyalsoldier/v2ray-rules-dat/releases/latest/download/geosite.dat".to_string()
}

fn default_geodata_dirs() -> Vec<String> {
    vec![
        "/usr/local/x-ui/bin".to_string(),
        "/usr/local/x-ui/bin/v2ray-rules-dat".to_string(),
    ]
}

fn default_warp_tag() -> String {
    "warp".to_string()
}

fn default_warp_address() -> String {
    "127.0.0.1".to_string()
}

fn default_warp_port() -> u16 {
    1080
}

fn default_warp_domains() -> Vec<String> {
    [
        "geosite:openai",
        "geosite:netflix",
        "geosite:disney",
        "geosite:primevideo",
        "geosite:twitter",
        "geosite:instagram",
        "geosite:meta",
        "domain:chatgpt.com",
        "domain:antigravity.com",
    ]
    .iter()
    .map(|d| d.to_string())
    .collect()
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            project_dir: default_project_dir(),
            backup_dir: default_backup_dir(),
            scratch_dir: default_scratch_dir(),
            fail2ban_jail: default_jail_file(),
        }
    }
}

impl Default for PanelSettings {
    fn default() -> Self {
        Self {
            host: default_panel_host(),
            container: default_panel_container(),
            volume: default_panel_volume(),
            binary: default_panel_binary(),
            default_username: default_panel_credential(),
            default_password: default_panel_credential(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            xray_image: default_xray_image(),
            helper_image: default_helper_image(),
            keygen_timeout_secs: default_keygen_timeout(),
            hysteria_service: default_hysteria_service(),
        }
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

impl Default for GeodataSettings {
    fn default() -> Self {
        Self {
            geoip_url: default_geoip_url(),
            geosite_url: default_geosite_url(),
            target_dirs: default_geodata_dirs(),
        }
    }
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            warp_tag: default_warp_tag(),
            warp_address: default_warp_address(),
            warp_port: default_warp_port(),
            warp_domains: default_warp_domains(),
        }
    }
}

impl VpnctlConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> VpnctlResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| VpnctlError::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| VpnctlError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from file, falling back to defaults when it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> VpnctlResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Secret store file inside the project directory
    pub fn env_file(&self) -> PathBuf {
        self.paths.project_dir.join(".env")
    }

    /// Hysteria2 daemon directory inside the project directory
    pub fn hysteria_dir(&self) -> PathBuf {
        self.paths.project_dir.join("hysteria2")
    }

    pub fn hysteria_config(&self) -> PathBuf {
        self.hysteria_dir().join("config.yaml")
    }

    pub fn hysteria_template(&self) -> PathBuf {
        self.hysteria_dir().join("config.yaml.template")
    }

    /// Project-local fail2ban configuration tree
    pub fn fail2ban_dir(&self) -> PathBuf {
        self.paths.project_dir.join("configs").join("fail2ban")
    }
}
