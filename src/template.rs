//! Daemon config generation from `__TOKEN__` templates

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::error::{VpnctlError, VpnctlResult};
use crate::secrets::{defaults, keys, write_atomic, SecretStore};
use crate::validation;

/// Token names bound for the Hysteria2 template
pub mod tokens {
    pub const HYSTERIA_PASSWORD: &str = "HYSTERIA_PASSWORD";
    pub const HYSTERIA_UP: &str = "HYSTERIA_UP";
    pub const HYSTERIA_DOWN: &str = "HYSTERIA_DOWN";
    pub const HYSTERIA_MASQUERADE: &str = "HYSTERIA_MASQUERADE";
    pub const HYSTERIA_OBFS_PASSWORD: &str = "HYSTERIA_OBFS_PASSWORD";
    pub const HYSTERIA_PORT: &str = "HYSTERIA_PORT";
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"__([A-Z0-9_]+?)__").expect("token pattern is valid"))
}

/// Substitute every `__NAME__` token in `template` from `bindings`
///
/// Fails listing each token without a binding.
pub fn render(template: &str, bindings: &BTreeMap<String, String>) -> VpnctlResult<String> {
    let mut missing = BTreeSet::new();

    let rendered = token_pattern().replace_all(template, |caps: &regex::Captures| {
        let name = &caps[1];
        match bindings.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.insert(name.to_string());
                caps[0].to_string()
            }
        }
    });

    if !missing.is_empty() {
        return Err(VpnctlError::template(format!(
            "unresolved tokens: {}",
            missing.into_iter().collect::<Vec<_>>().join(", ")
        )));
    }
    Ok(rendered.into_owned())
}

/// Regenerate `output` in full from `template`
///
/// Nothing is written unless every token resolved.
pub fn apply_template(template: &Path, output: &Path, bindings: &BTreeMap<String, String>) -> VpnctlResult<()> {
    let source = fs::read_to_string(template).map_err(|e| {
        VpnctlError::template(format!("Failed to read template {:?}: {}", template, e))
    })?;
    let rendered = render(&source, bindings)?;
    write_atomic(output, &rendered)?;
    info!("Rendered {:?} from {:?}", output, template);
    Ok(())
}

/// Directive prefix of the Hysteria2 listener, `listen: :<port>`
pub const LISTEN_DIRECTIVE: &str = r"[ \t]*listen:[ \t]*:";

/// Move a port directive in place in an existing config
///
/// `prefix` is a regex for everything on the line before the port. The port
/// must be the whole remaining value (an optional trailing comment aside) and
/// the directive must occur exactly once, otherwise nothing is written.
pub fn replace_port_directive(path: &Path, prefix: &str, old_port: u16, new_port: u16) -> VpnctlResult<()> {
    let pattern = Regex::new(&format!(r"(?m)^({}){}([ \t]*(?:#.*)?)$", prefix, old_port))
        .map_err(|e| VpnctlError::template(format!("Bad directive pattern '{}': {}", prefix, e)))?;

    let content = fs::read_to_string(path)?;
    match pattern.find_iter(&content).count() {
        1 => {}
        0 => {
            return Err(VpnctlError::template(format!(
                "No directive for port {} found in {:?}",
                old_port, path
            )))
        }
        n => {
            return Err(VpnctlError::template(format!(
                "{} directives for port {} found in {:?}, refusing to guess",
                n, old_port, path
            )))
        }
    }

    let updated = pattern.replace(&content, format!("${{1}}{}${{2}}", new_port).as_str());
    write_atomic(path, &updated)?;
    debug!("Moved port directive {} -> {} in {:?}", old_port, new_port, path);
    Ok(())
}

/// Bindings for the Hysteria2 config, `port` being the listener to render
///
/// Passwords are required; the rest fall back to documented defaults.
pub fn hysteria_bindings(store: &SecretStore, port: u16) -> VpnctlResult<BTreeMap<String, String>> {
    let up = store.get_or(keys::HYSTERIA_UP_MBPS, defaults::BANDWIDTH_MBPS);
    let down = store.get_or(keys::HYSTERIA_DOWN_MBPS, defaults::BANDWIDTH_MBPS);

    let mut bindings = BTreeMap::new();
    bindings.insert(
        tokens::HYSTERIA_PASSWORD.to_string(),
        store.require(keys::HYSTERIA_PASSWORD)?.to_string(),
    );
    bindings.insert(
        tokens::HYSTERIA_OBFS_PASSWORD.to_string(),
        store.require(keys::HYSTERIA_OBFS_PASSWORD)?.to_string(),
    );
    bindings.insert(tokens::HYSTERIA_UP.to_string(), format!("{} mbps", up));
    bindings.insert(tokens::HYSTERIA_DOWN.to_string(), format!("{} mbps", down));
    bindings.insert(
        tokens::HYSTERIA_MASQUERADE.to_string(),
        store.get_or(keys::REALITY_SNI, defaults::REALITY_SNI).to_string(),
    );
    bindings.insert(tokens::HYSTERIA_PORT.to_string(), port.to_string());

    for value in bindings.values() {
        validation::sanitize_config_value(value)?;
    }
    Ok(bindings)
}

/// Regenerate the Hysteria2 config in full from its template
///
/// The only way credentials reach the daemon, so a missing template is an
/// error rather than a reason to keep the old file.
pub fn render_hysteria_config(store: &SecretStore, template: &Path, config: &Path, port: u16) -> VpnctlResult<()> {
    if !template.exists() {
        return Err(VpnctlError::template(format!(
            "No template at {:?}, credentials in {:?} cannot be regenerated",
            template, config
        )));
    }
    apply_template(template, config, &hysteria_bindings(store, port)?)
}

/// Move the Hysteria2 listener from `previous_port` to `port`
///
/// Renders from the template when one exists. Otherwise only the listen
/// directive is patched, which is all a port change needs.
pub fn apply_hysteria_config(
    store: &SecretStore,
    template: &Path,
    config: &Path,
    previous_port: u16,
    port: u16,
) -> VpnctlResult<()> {
    if template.exists() {
        return render_hysteria_config(store, template, config, port);
    }

    if !config.exists() {
        return Err(VpnctlError::template(format!(
            "Neither {:?} nor {:?} exists",
            template, config
        )));
    }
    if previous_port == port {
        debug!("No template at {:?} and port unchanged, leaving {:?}", template, config);
        return Ok(());
    }
    warn!("No template at {:?}, patching listen directive in {:?}", template, config);
    replace_port_directive(config, LISTEN_DIRECTIVE, previous_port, port)
}
