//! Secret store
//!
//! The `.env` file is the single source of truth for every generated key,
//! port and credential. Other components read from a [`SecretStore`] and push
//! derived representations outward; nothing writes back into it except the
//! key generator and the port migrator.
//!
//! Writes are read-modify-write under an exclusive `flock` on a sidecar lock
//! file, then an atomic rename, so unmanaged keys written by other tools
//! between our reads survive. There is still no cross-operation transaction:
//! two operators running migrations at once get last-write-wins per key.

use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{VpnctlError, VpnctlResult};

/// Well-known secret store keys
pub mod keys {
    pub const REALITY_PRIVATE_KEY: &str = "REALITY_PRIVATE_KEY";
    pub const REALITY_PUBLIC_KEY: &str = "REALITY_PUBLIC_KEY";
    pub const REALITY_SHORT_ID: &str = "REALITY_SHORT_ID";
    pub const REALITY_SNI: &str = "REALITY_SNI";
    pub const VLESS_UUID: &str = "VLESS_UUID";
    pub const HYSTERIA_PASSWORD: &str = "HYSTERIA_PASSWORD";
    pub const HYSTERIA_OBFS_PASSWORD: &str = "HYSTERIA_OBFS_PASSWORD";
    pub const HYSTERIA_PORT: &str = "HYSTERIA_PORT";
    pub const HYSTERIA_UP_MBPS: &str = "HYSTERIA_UP_MBPS";
    pub const HYSTERIA_DOWN_MBPS: &str = "HYSTERIA_DOWN_MBPS";
    pub const SERVER_IP: &str = "SERVER_IP";
    pub const XUI_PORT: &str = "XUI_PORT";
    pub const XUI_USERNAME: &str = "XUI_USERNAME";
    pub const XUI_PASSWORD: &str = "XUI_PASSWORD";
}

/// Defaults for values an operator sets once rather than ones we generate
pub mod defaults {
    pub const REALITY_SNI: &str = "www.microsoft.com";
    pub const SERVER_IP: &str = "127.0.0.1";
    pub const HYSTERIA_PORT: &str = "443";
    pub const BANDWIDTH_MBPS: &str = "100";
    pub const XUI_PORT: &str = "2053";
}

/// Everything the key generator produces in one rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretRecord {
    pub private_key: String,
    pub public_key: String,
    pub client_id: String,
    pub short_id: String,
    pub hysteria_password: String,
    pub obfs_password: String,
}

impl SecretRecord {
    /// Store entries for this record, in the order they are written
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            (keys::REALITY_PRIVATE_KEY, self.private_key.clone()),
            (keys::REALITY_PUBLIC_KEY, self.public_key.clone()),
            (keys::REALITY_SHORT_ID, self.short_id.clone()),
            (keys::VLESS_UUID, self.client_id.clone()),
            (keys::HYSTERIA_PASSWORD, self.hysteria_password.clone()),
            (keys::HYSTERIA_OBFS_PASSWORD, self.obfs_password.clone()),
        ]
    }

    /// Read the current record back out of a store
    pub fn from_store(store: &SecretStore) -> VpnctlResult<Self> {
        Ok(Self {
            private_key: store.require(keys::REALITY_PRIVATE_KEY)?.to_string(),
            public_key: store.require(keys::REALITY_PUBLIC_KEY)?.to_string(),
            client_id: store.require(keys::VLESS_UUID)?.to_string(),
            short_id: store.require(keys::REALITY_SHORT_ID)?.to_string(),
            hysteria_password: store.require(keys::HYSTERIA_PASSWORD)?.to_string(),
            obfs_password: store.require(keys::HYSTERIA_OBFS_PASSWORD)?.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    /// `raw` keeps the original text so untouched entries round-trip exactly
    Entry {
        key: String,
        value: String,
        raw: Option<String>,
    },
    Other(String),
}

/// Env-file backed key/value store
#[derive(Debug)]
pub struct SecretStore {
    path: PathBuf,
    lines: Vec<Line>,
}

impl SecretStore {
    /// Open the store; a missing file is an empty store
    pub fn open(path: impl Into<PathBuf>) -> VpnctlResult<Self> {
        let path = path.into();
        let lines = read_lines(&path)?;
        Ok(Self { path, lines })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the backing file, e.g. after a restore replaced it
    pub fn reload(&mut self) -> VpnctlResult<()> {
        self.lines = read_lines(&self.path)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        // Last assignment wins, as with shell sourcing
        self.lines.iter().rev().find_map(|line| match line {
            Line::Entry { key: k, value, .. } if k.as_str() == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Value or a documented default for operator-set entries
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.get(key) {
            Some(value) if !value.is_empty() => value,
            _ => default,
        }
    }

    /// Value that a dependent apply cannot run without
    pub fn require(&self, key: &str) -> VpnctlResult<&str> {
        match self.get(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(VpnctlError::MissingSecret(key.to_string())),
        }
    }

    /// Upsert one key and persist
    pub fn set(&mut self, key: &str, value: &str) -> VpnctlResult<()> {
        self.set_many([(key, value.to_string())])
    }

    /// Upsert several keys in a single write: either all land or none do
    pub fn set_many<I, K>(&mut self, pairs: I) -> VpnctlResult<()>
    where
        I: IntoIterator<Item = (K, String)>,
        K: AsRef<str>,
    {
        let pairs: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v))
            .collect();

        for (key, value) in &pairs {
            validate_entry(key, value)?;
        }

        let _lock = FileLock::acquire(&lock_path(&self.path))?;

        // Pick up whatever other writers left since we last read
        let mut lines = read_lines(&self.path)?;
        for (key, value) in &pairs {
            upsert(&mut lines, key, value);
        }

        write_atomic(&self.path, &render(&lines))?;
        self.lines = lines;

        debug!(
            "Secret store {:?} updated: {}",
            self.path,
            pairs.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>().join(", ")
        );
        Ok(())
    }
}

fn validate_entry(key: &str, value: &str) -> VpnctlResult<()> {
    let key_ok = !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !key_ok {
        return Err(VpnctlError::validation(format!("Invalid secret key name: {}", key)));
    }
    if value.contains('\n') || value.contains('\r') || value.contains('\0') {
        return Err(VpnctlError::validation(format!(
            "Value for {} contains a line break",
            key
        )));
    }
    // A single-quoted value cannot carry a single quote
    if value.contains('\'') && needs_quotes(value) {
        return Err(VpnctlError::validation(format!(
            "Value for {} cannot be quoted safely",
            key
        )));
    }
    Ok(())
}

fn upsert(lines: &mut Vec<Line>, key: &str, value: &str) {
    let mut found = false;
    // Rewrite the first occurrence, drop later duplicates
    lines.retain_mut(|line| match line {
        Line::Entry { key: k, value: v, raw } if k.as_str() == key => {
            if found {
                return false;
            }
            found = true;
            *v = value.to_string();
            *raw = None;
            true
        }
        _ => true,
    });
    if !found {
        lines.push(Line::Entry {
            key: key.to_string(),
            value: value.to_string(),
            raw: None,
        });
    }
}

fn read_lines(path: &Path) -> VpnctlResult<Vec<Line>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(parse(&content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn parse(content: &str) -> Vec<Line> {
    content
        .lines()
        .map(|raw| {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return Line::Other(raw.to_string());
            }
            let body = trimmed.strip_prefix("export ").unwrap_or(trimmed);
            match body.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => Line::Entry {
                    key: key.trim().to_string(),
                    value: unquote(value.trim()),
                    raw: Some(raw.to_string()),
                },
                _ => Line::Other(raw.to_string()),
            }
        })
        .collect()
}

fn unquote(value: &str) -> String {
    for quote in ['\'', '"'] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].to_string();
        }
    }
    // Unquoted values may carry a trailing comment
    match value.find(" #") {
        Some(idx) => value[..idx].trim_end().to_string(),
        None => value.to_string(),
    }
}

fn needs_quotes(value: &str) -> bool {
    value
        .chars()
        .any(|c| c.is_whitespace() || c == '#' || c == '"' || c == '\'' || c == '$')
}

fn render(lines: &[Line]) -> String {
    let mut out = String::new();
    for line in lines {
        match line {
            Line::Other(raw) | Line::Entry { raw: Some(raw), .. } => out.push_str(raw),
            Line::Entry { key, value, raw: None } => {
                if needs_quotes(value) {
                    out.push_str(&format!("{}='{}'", key, value));
                } else {
                    out.push_str(&format!("{}={}", key, value));
                }
            }
        }
        out.push('\n');
    }
    out
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| ".env".into());
    name.push(".lock");
    path.with_file_name(name)
}

/// Write through a sibling temp file and rename over the target
///
/// New files get mode 0600; existing files keep their mode.
pub(crate) fn write_atomic(path: &Path, content: &str) -> VpnctlResult<()> {
    let mode = fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o7777)
        .unwrap_or(0o600);

    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Exclusive advisory lock, released on drop
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
