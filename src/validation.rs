//! Input validation and sanitization
//!
//! Everything an operator types is checked here before any store is touched.

use crate::error::{VpnctlError, VpnctlResult};
use std::net::IpAddr;

/// Lowest port the panel may move to (non-privileged range)
pub const MIN_PANEL_PORT: u16 = 1024;

/// Maximum length for configuration values written into daemon configs
const MAX_CONFIG_VALUE_LEN: usize = 255;

/// Maximum length for command output surfaced to the operator
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Which listener a port is destined for; the allowed range differs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// VPN daemon listener, 1-65535
    Listener,
    /// Admin panel, 1024-65535
    Panel,
}

/// Parse and range-check an operator supplied port
///
/// Only plain ASCII digits are accepted: no sign, no whitespace, no empty input.
pub fn validate_port(input: &str, kind: PortKind) -> VpnctlResult<u16> {
    if input.is_empty() {
        return Err(VpnctlError::validation("Port cannot be empty"));
    }

    if !input.chars().all(|c| c.is_ascii_digit()) {
        return Err(VpnctlError::validation(format!(
            "Port must be numeric: {}",
            input
        )));
    }

    // Digits only, so the sole parse failure left is overflow
    let port: u32 = input
        .parse()
        .map_err(|_| VpnctlError::validation(format!("Port out of range: {}", input)))?;

    let min = match kind {
        PortKind::Listener => 1,
        PortKind::Panel => MIN_PANEL_PORT as u32,
    };

    if port < min || port > u16::MAX as u32 {
        return Err(VpnctlError::validation(format!(
            "Port {} outside allowed range {}-{}",
            input,
            min,
            u16::MAX
        )));
    }

    Ok(port as u16)
}

/// Validate a hostname or IP literal used as SNI or server address
pub fn validate_hostname(host: &str) -> VpnctlResult<()> {
    if host.is_empty() {
        return Err(VpnctlError::validation("Hostname cannot be empty"));
    }

    if host.len() > 253 {
        return Err(VpnctlError::validation("Hostname too long"));
    }

    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    for c in host.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '.' {
            return Err(VpnctlError::validation(format!(
                "Invalid hostname character: {}",
                c
            )));
        }
    }

    if host.starts_with('-') || host.starts_with('.') || host.ends_with('-') || host.ends_with('.') {
        return Err(VpnctlError::validation("Invalid hostname format"));
    }

    Ok(())
}

/// Reject values that would break a line-oriented config file
pub fn sanitize_config_value(value: &str) -> VpnctlResult<String> {
    if value.chars().any(|c| c.is_control() && c != '\t') {
        return Err(VpnctlError::validation(
            "Configuration value contains invalid control characters",
        ));
    }

    if value.len() > MAX_CONFIG_VALUE_LEN {
        return Err(VpnctlError::validation(format!(
            "Configuration value too long (max {} characters)",
            MAX_CONFIG_VALUE_LEN
        )));
    }

    Ok(value.to_string())
}

/// Trim command output before it is surfaced in an error
pub fn sanitize_error_message(stderr: &str) -> String {
    let mut sanitized = stderr.trim().to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str("... (truncated)");
    }

    sanitized
}
