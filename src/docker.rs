//! Container control
//!
//! Restarts individual daemons or the whole compose project, and moves data
//! in and out of named volumes through short-lived helper containers so no
//! host path of the volume is ever assumed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::command::{run_checked, CommandRunner, Invocation};
use crate::error::{VpnctlError, VpnctlResult};

pub struct DockerController {
    runner: Arc<dyn CommandRunner>,
    project_dir: PathBuf,
    helper_image: String,
}

impl DockerController {
    pub fn new(runner: Arc<dyn CommandRunner>, project_dir: PathBuf, helper_image: String) -> Self {
        Self {
            runner,
            project_dir,
            helper_image,
        }
    }

    fn compose(&self) -> Invocation {
        Invocation::new("docker")
            .arg("compose")
            .current_dir(&self.project_dir)
    }

    /// Restart one container by name
    pub async fn restart_container(&self, container: &str) -> VpnctlResult<()> {
        info!("Restarting container {}", container);
        run_checked(
            self.runner.as_ref(),
            Invocation::new("docker").args(["restart", container]),
        )
        .await?;
        Ok(())
    }

    /// Restart a single compose service, leaving the rest of the stack alone
    pub async fn restart_service(&self, service: &str) -> VpnctlResult<()> {
        info!("Restarting compose service {}", service);
        run_checked(
            self.runner.as_ref(),
            self.compose().args(["--env-file", ".env", "restart", service]),
        )
        .await?;
        Ok(())
    }

    /// Restart every service of the project
    pub async fn restart_all(&self) -> VpnctlResult<()> {
        info!("Restarting compose project in {:?}", self.project_dir);
        run_checked(self.runner.as_ref(), self.compose().arg("restart")).await?;
        Ok(())
    }

    /// Bring the whole stack up, dropping containers no longer in the compose file
    pub async fn up(&self) -> VpnctlResult<()> {
        info!("Bringing up compose project in {:?}", self.project_dir);
        run_checked(
            self.runner.as_ref(),
            self.compose().args(["up", "-d", "--remove-orphans"]),
        )
        .await?;
        Ok(())
    }

    /// Run a command inside a running container
    pub async fn exec(&self, container: &str, command: &[&str]) -> VpnctlResult<String> {
        let output = run_checked(
            self.runner.as_ref(),
            Invocation::new("docker")
                .args(["exec", container])
                .args(command.iter().copied()),
        )
        .await?;
        Ok(output.stdout_lossy())
    }

    pub async fn create_volume(&self, volume: &str) -> VpnctlResult<()> {
        run_checked(
            self.runner.as_ref(),
            Invocation::new("docker").args(["volume", "create", volume]),
        )
        .await?;
        Ok(())
    }

    /// Copy the contents of a named volume into a host directory
    pub async fn copy_out_of_volume(&self, volume: &str, dest: &Path) -> VpnctlResult<()> {
        info!("Copying volume {} to {:?}", volume, dest);
        self.helper_copy(format!("{}:/source:ro", volume), host_mount(dest, "/backup")?, "/source/.", "/backup/")
            .await
    }

    /// Copy a host directory into a named volume
    pub async fn copy_into_volume(&self, source: &Path, volume: &str) -> VpnctlResult<()> {
        info!("Copying {:?} into volume {}", source, volume);
        self.helper_copy(host_mount(source, "/source")?, format!("{}:/dest", volume), "/source/.", "/dest/")
            .await
    }

    async fn helper_copy(&self, from_mount: String, to_mount: String, from: &str, to: &str) -> VpnctlResult<()> {
        run_checked(
            self.runner.as_ref(),
            Invocation::new("docker")
                .args(["run", "--rm", "-v"])
                .arg(from_mount)
                .arg("-v")
                .arg(to_mount)
                .arg(self.helper_image.as_str())
                .args(["sh", "-c"])
                .arg(format!("cp -a {} {}", from, to)),
        )
        .await?;
        Ok(())
    }
}

fn host_mount(path: &Path, target: &str) -> VpnctlResult<String> {
    let path = path
        .to_str()
        .ok_or_else(|| VpnctlError::validation(format!("Path {:?} is not valid UTF-8", path)))?;
    Ok(format!("{}:{}", path, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;

    fn controller(runner: Arc<RecordingRunner>) -> DockerController {
        DockerController::new(runner, PathBuf::from("/root/vpn"), "alpine".to_string())
    }

    #[tokio::test]
    async fn test_restart_service_targets_one_service() {
        let runner = Arc::new(RecordingRunner::new());
        controller(runner.clone()).restart_service("hysteria2").await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].command_line(),
            "docker compose --env-file .env restart hysteria2"
        );
        assert_eq!(calls[0].cwd, Some(PathBuf::from("/root/vpn")));
    }

    #[tokio::test]
    async fn test_volume_copy_commands() {
        let runner = Arc::new(RecordingRunner::new());
        let docker = controller(runner.clone());
        docker
            .copy_out_of_volume("3xui-db", Path::new("/tmp/stage/3xui-db"))
            .await
            .unwrap();
        docker
            .copy_into_volume(Path::new("/tmp/restore/3xui-db"), "3xui-db")
            .await
            .unwrap();

        let lines = runner.command_lines();
        assert_eq!(
            lines[0],
            "docker run --rm -v 3xui-db:/source:ro -v /tmp/stage/3xui-db:/backup alpine sh -c cp -a /source/. /backup/"
        );
        assert_eq!(
            lines[1],
            "docker run --rm -v /tmp/restore/3xui-db:/source -v 3xui-db:/dest alpine sh -c cp -a /source/. /dest/"
        );
    }

    #[tokio::test]
    async fn test_restart_failure_is_error() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail("docker restart", "No such container: 3x-ui");
        let err = controller(runner).restart_container("3x-ui").await.unwrap_err();
        assert!(err.to_string().contains("No such container"));
    }
}
