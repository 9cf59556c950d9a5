//! Host firewall (ufw) and intrusion prevention (fail2ban)
//!
//! The VPN keeps working without either, so every call here is best-effort:
//! failures come back as warning strings for the caller's report.

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::command::{run_best_effort, CommandRunner, Invocation};
use crate::template;

/// `port = <n>` inside a jail section
const JAIL_PORT_DIRECTIVE: &str = r"[ \t]*port[ \t]*=[ \t]*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

pub struct FirewallController {
    runner: Arc<dyn CommandRunner>,
}

impl FirewallController {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Open a port, returning a warning if ufw refused
    pub async fn allow(&self, port: u16, proto: Protocol, comment: &str) -> Option<String> {
        info!("Allowing {}/{} in firewall", port, proto.as_str());
        run_best_effort(
            self.runner.as_ref(),
            Invocation::new("ufw")
                .arg("allow")
                .arg(format!("{}/{}", port, proto.as_str()))
                .args(["comment", comment]),
        )
        .await
    }

    /// Drop a previously opened port, returning a warning if ufw refused
    pub async fn delete_allow(&self, port: u16, proto: Protocol) -> Option<String> {
        info!("Removing {}/{} from firewall", port, proto.as_str());
        run_best_effort(
            self.runner.as_ref(),
            Invocation::new("ufw")
                .args(["delete", "allow"])
                .arg(format!("{}/{}", port, proto.as_str())),
        )
        .await
    }

    /// Point the fail2ban jail at the new panel port
    ///
    /// A missing jail file only means fail2ban is not guarding the panel.
    pub fn update_jail_port(&self, jail: &Path, old_port: u16, new_port: u16) -> Option<String> {
        if !jail.exists() {
            info!("No fail2ban jail at {:?}, skipping", jail);
            return None;
        }

        match template::replace_port_directive(jail, JAIL_PORT_DIRECTIVE, old_port, new_port) {
            Ok(()) => None,
            Err(e) => {
                warn!("Failed to update fail2ban jail: {}", e);
                Some(e.to_string())
            }
        }
    }

    pub async fn restart_fail2ban(&self) -> Option<String> {
        run_best_effort(
            self.runner.as_ref(),
            Invocation::new("systemctl").args(["restart", "fail2ban"]),
        )
        .await
    }
}
