//! Routing rule databases (geoip.dat / geosite.dat) inside the panel container

use std::sync::Arc;
use tracing::info;

use crate::command::CommandRunner;
use crate::config::{GeodataSettings, PanelSettings, VpnctlConfig};
use crate::docker::DockerController;
use crate::error::{VpnctlError, VpnctlResult};

pub struct GeodataUpdater {
    docker: DockerController,
    settings: GeodataSettings,
    panel: PanelSettings,
}

impl GeodataUpdater {
    pub fn new(config: &VpnctlConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            docker: DockerController::new(
                runner,
                config.paths.project_dir.clone(),
                config.docker.helper_image.clone(),
            ),
            settings: config.geodata.clone(),
            panel: config.panel.clone(),
        }
    }

    /// Shell script downloading both files into every target directory
    fn download_script(&self) -> VpnctlResult<String> {
        if self.settings.target_dirs.is_empty() {
            return Err(VpnctlError::config("geodata.target_dirs is empty"));
        }
        let mut steps = Vec::new();
        for dir in &self.settings.target_dirs {
            for (file, url) in [
                ("geoip.dat", &self.settings.geoip_url),
                ("geosite.dat", &self.settings.geosite_url),
            ] {
                steps.push(format!("wget -O {}/{} {}", dir.trim_end_matches('/'), file, url));
            }
        }
        Ok(steps.join(" && "))
    }

    /// Download fresh databases and restart the panel to load them
    pub async fn update(&self) -> VpnctlResult<()> {
        let script = self.download_script()?;
        info!("Updating geodata in container {}", self.panel.container);
        self.docker
            .exec(&self.panel.container, &["bash", "-c", script.as_str()])
            .await?;
        self.docker.restart_container(&self.panel.container).await?;
        info!("Geodata updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;

    #[tokio::test]
    async fn test_update_downloads_then_restarts() {
        let runner = Arc::new(RecordingRunner::new());
        GeodataUpdater::new(&VpnctlConfig::default(), runner.clone())
            .update()
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(&calls[0].args[..4], &["exec", "3x-ui", "bash", "-c"]);
        let script = &calls[0].args[4];
        assert_eq!(script.matches("wget -O ").count(), 4);
        assert!(script.contains("wget -O /usr/local/x-ui/bin/geoip.dat https://github.com/Loyalsoldier/"));
        assert!(script.contains("/usr/local/x-ui/bin/v2ray-rules-dat/geosite.dat"));
        assert_eq!(calls[1].command_line(), "docker restart 3x-ui");
    }

    #[tokio::test]
    async fn test_download_failure_skips_restart() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail("wget", "wget: bad address 'github.com'");

        let err = GeodataUpdater::new(&VpnctlConfig::default(), runner.clone())
            .update()
            .await
            .unwrap_err();
        assert!(matches!(err, VpnctlError::ExternalProcess { .. }));
        assert_eq!(runner.calls().len(), 1);
    }
}
