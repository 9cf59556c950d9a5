//! Backup and restore of the complete deployment state
//!
//! An archive holds one top-level directory named after the archive with:
//!
//! ```text
//! VPN-backup-<timestamp>/
//!   .env
//!   hysteria2/
//!   fail2ban/      (only when the project has one)
//!   3xui-db/       (copied out of the panel's docker volume)
//! ```
//!
//! Restore accepts archives missing any of these entries.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::command::CommandRunner;
use crate::config::VpnctlConfig;
use crate::docker::DockerController;
use crate::error::{VpnctlError, VpnctlResult};
use crate::operation::StepLog;

pub const ARCHIVE_PREFIX: &str = "VPN-backup-";
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";
const RESTORE_PREFIX: &str = "VPN-restore-";

const ENV_ENTRY: &str = ".env";
const HYSTERIA_ENTRY: &str = "hysteria2";
const FAIL2BAN_ENTRY: &str = "fail2ban";
const DATABASE_ENTRY: &str = "3xui-db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RestoreStep {
    Extracted,
    SecretsRestored,
    HysteriaRestored,
    Fail2banRestored,
    DatabaseRestored,
    StackStarted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub archive: PathBuf,
    pub restored: Vec<String>,
    /// Components the archive did not contain
    pub skipped: Vec<String>,
    /// Uploaded archive deleted after use
    pub archive_removed: bool,
    pub completed: Vec<RestoreStep>,
}

pub struct BackupEngine {
    docker: DockerController,
    backup_dir: PathBuf,
    scratch_dir: PathBuf,
    env_file: PathBuf,
    hysteria_dir: PathBuf,
    fail2ban_dir: PathBuf,
    panel_volume: String,
    retention: usize,
}

impl BackupEngine {
    pub fn new(config: &VpnctlConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            docker: DockerController::new(
                runner,
                config.paths.project_dir.clone(),
                config.docker.helper_image.clone(),
            ),
            backup_dir: config.paths.backup_dir.clone(),
            scratch_dir: config.paths.scratch_dir.clone(),
            env_file: config.env_file(),
            hysteria_dir: config.hysteria_dir(),
            fail2ban_dir: config.fail2ban_dir(),
            panel_volume: config.panel.volume.clone(),
            retention: config.backup.retention,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Stage, pack and prune; returns the new archive
    pub async fn create_backup(&self) -> VpnctlResult<PathBuf> {
        if !self.env_file.is_file() {
            return Err(VpnctlError::archive(format!(
                "Nothing to back up: {} does not exist",
                self.env_file.display()
            )));
        }
        create_private_dir(&self.backup_dir)?;

        let name = unique_name(&self.backup_dir, ARCHIVE_PREFIX, ARCHIVE_SUFFIX).await;
        let staging = self.backup_dir.join(&name);
        let archive = self.backup_dir.join(format!("{}{}", name, ARCHIVE_SUFFIX));

        create_private_dir(&staging)?;
        let result = self.stage_and_pack(&staging, &name, &archive).await;
        if let Err(e) = fs::remove_dir_all(&staging) {
            warn!("Failed to remove staging directory {:?}: {}", staging, e);
        }
        if result.is_err() && archive.exists() {
            if let Err(e) = fs::remove_file(&archive) {
                warn!("Failed to remove partial archive {:?}: {}", archive, e);
            }
        }
        result?;

        info!("Backup written to {:?}", archive);

        for removed in prune_backups(&self.backup_dir, self.retention)? {
            info!("Removed old backup {:?}", removed);
        }
        Ok(archive)
    }

    async fn stage_and_pack(&self, staging: &Path, name: &str, archive: &Path) -> VpnctlResult<()> {
        fs::copy(&self.env_file, staging.join(ENV_ENTRY))?;

        if self.hysteria_dir.is_dir() {
            copy_tree(&self.hysteria_dir, &staging.join(HYSTERIA_ENTRY))?;
        } else {
            warn!("No Hysteria2 directory at {:?}, not included", self.hysteria_dir);
        }

        if self.fail2ban_dir.is_dir() {
            copy_tree(&self.fail2ban_dir, &staging.join(FAIL2BAN_ENTRY))?;
        }

        let db_dir = staging.join(DATABASE_ENTRY);
        create_private_dir(&db_dir)?;
        self.docker.copy_out_of_volume(&self.panel_volume, &db_dir).await?;

        pack(staging, name, archive)
    }

    /// Restore from `archive`, then bring the stack back up
    ///
    /// On failure the extracted files are left in place and the error carries
    /// their location.
    pub async fn restore_backup(&self, archive: &Path) -> VpnctlResult<RestoreReport> {
        if !archive.is_file() {
            return Err(VpnctlError::archive(format!(
                "{} is not a file",
                archive.display()
            )));
        }
        let uploaded = !is_inside(&self.backup_dir, archive);

        create_private_dir(&self.scratch_dir)?;
        let scratch = self
            .scratch_dir
            .join(unique_name(&self.scratch_dir, RESTORE_PREFIX, "").await);
        create_private_dir(&scratch)?;

        let mut report = match self.restore_from(archive, &scratch).await {
            Ok(report) => report,
            Err(e) => {
                return Err(VpnctlError::RestoreAborted {
                    scratch_dir: scratch,
                    source: Box::new(e),
                })
            }
        };

        if let Err(e) = fs::remove_dir_all(&scratch) {
            warn!("Failed to remove restore directory {:?}: {}", scratch, e);
        }
        if uploaded {
            match fs::remove_file(archive) {
                Ok(()) => report.archive_removed = true,
                Err(e) => warn!("Failed to remove consumed archive {:?}: {}", archive, e),
            }
        }

        info!("Restore from {:?} complete", archive);
        Ok(report)
    }

    async fn restore_from(&self, archive: &Path, scratch: &Path) -> VpnctlResult<RestoreReport> {
        let mut log = StepLog::new("restore");
        let mut restored = Vec::new();
        let mut skipped = Vec::new();

        let root = unpack(archive, scratch).map_err(|e| log.fail(RestoreStep::Extracted, e))?;
        log.complete(RestoreStep::Extracted);

        let env = root.join(ENV_ENTRY);
        if env.is_file() {
            if let Some(project_dir) = self.env_file.parent() {
                create_private_dir(project_dir).map_err(|e| log.fail(RestoreStep::SecretsRestored, e))?;
            }
            fs::copy(&env, &self.env_file).map_err(|e| log.fail(RestoreStep::SecretsRestored, e.into()))?;
            log.mutated("secret store");
            restored.push(ENV_ENTRY.to_string());
            log.complete(RestoreStep::SecretsRestored);
        } else {
            skipped.push(ENV_ENTRY.to_string());
        }

        let hysteria = root.join(HYSTERIA_ENTRY);
        if hysteria.is_dir() {
            copy_tree(&hysteria, &self.hysteria_dir).map_err(|e| log.fail(RestoreStep::HysteriaRestored, e))?;
            log.mutated("hysteria2 config");
            restored.push(HYSTERIA_ENTRY.to_string());
            log.complete(RestoreStep::HysteriaRestored);
        } else {
            skipped.push(HYSTERIA_ENTRY.to_string());
        }

        let fail2ban = root.join(FAIL2BAN_ENTRY);
        if fail2ban.is_dir() {
            copy_tree(&fail2ban, &self.fail2ban_dir).map_err(|e| log.fail(RestoreStep::Fail2banRestored, e))?;
            log.mutated("fail2ban config");
            restored.push(FAIL2BAN_ENTRY.to_string());
            log.complete(RestoreStep::Fail2banRestored);
        } else {
            skipped.push(FAIL2BAN_ENTRY.to_string());
        }

        let database = root.join(DATABASE_ENTRY);
        if database.is_dir() {
            self.docker
                .create_volume(&self.panel_volume)
                .await
                .map_err(|e| log.fail(RestoreStep::DatabaseRestored, e))?;
            self.docker
                .copy_into_volume(&database, &self.panel_volume)
                .await
                .map_err(|e| log.fail(RestoreStep::DatabaseRestored, e))?;
            log.mutated("panel database volume");
            restored.push(DATABASE_ENTRY.to_string());
            log.complete(RestoreStep::DatabaseRestored);
        } else {
            skipped.push(DATABASE_ENTRY.to_string());
        }

        for component in &skipped {
            info!("Archive has no {}, skipped", component);
        }

        self.docker
            .up()
            .await
            .map_err(|e| log.fail(RestoreStep::StackStarted, e))?;
        log.complete(RestoreStep::StackStarted);

        Ok(RestoreReport {
            archive: archive.to_path_buf(),
            restored,
            skipped,
            archive_removed: false,
            completed: log.into_completed(),
        })
    }
}

/// Timestamped name under `dir` that does not exist yet
async fn unique_name(dir: &Path, prefix: &str, suffix: &str) -> String {
    loop {
        let name = format!(
            "{}{}",
            prefix,
            chrono::Local::now().format("%Y%m%d_%H%M%S_%6f")
        );
        let taken = dir.join(&name).exists() || dir.join(format!("{}{}", name, suffix)).exists();
        if !taken {
            return name;
        }
        tokio::time::sleep(Duration::from_micros(10)).await;
    }
}

fn create_private_dir(path: &Path) -> VpnctlResult<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)?;
    Ok(())
}

/// Recursive copy merging into `dst`; symlinks are copied as links
pub fn copy_tree(src: &Path, dst: &Path) -> VpnctlResult<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());

        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn pack(staging: &Path, name: &str, archive: &Path) -> VpnctlResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(archive)?;

    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    builder
        .append_dir_all(name, staging)
        .map_err(|e| VpnctlError::archive(format!("Failed to pack {}: {}", name, e)))?;
    let encoder = builder.into_inner()?;
    encoder.finish()?.sync_all()?;
    Ok(())
}

/// Extract and return the single top-level directory
fn unpack(archive: &Path, scratch: &Path) -> VpnctlResult<PathBuf> {
    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.unpack(scratch)
        .map_err(|e| VpnctlError::archive(format!("Failed to extract {}: {}", archive.display(), e)))?;

    let entries: Vec<PathBuf> = fs::read_dir(scratch)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;

    match entries.as_slice() {
        [root] if root.is_dir() => {
            debug!("Archive root {:?}", root);
            Ok(root.clone())
        }
        [] => Err(VpnctlError::archive("Archive is empty")),
        _ => Err(VpnctlError::archive(format!(
            "Expected a single top-level directory, found {} entries",
            entries.len()
        ))),
    }
}

/// Backup archives in `dir`, oldest first by mtime then name
pub fn list_backups(dir: &Path) -> VpnctlResult<Vec<PathBuf>> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut archives: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in read {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(ARCHIVE_PREFIX) || !name.ends_with(ARCHIVE_SUFFIX) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        archives.push((metadata.modified()?, entry.path()));
    }

    archives.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(archives.into_iter().map(|(_, path)| path).collect())
}

/// Delete the oldest archives beyond `keep`; returns what was removed
pub fn prune_backups(dir: &Path, keep: usize) -> VpnctlResult<Vec<PathBuf>> {
    let archives = list_backups(dir)?;
    let excess = archives.len().saturating_sub(keep);
    let mut removed = Vec::with_capacity(excess);
    for path in archives.into_iter().take(excess) {
        fs::remove_file(&path)?;
        removed.push(path);
    }
    Ok(removed)
}

fn is_inside(dir: &Path, path: &Path) -> bool {
    let parent = path
        .canonicalize()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf));
    match (parent, dir.canonicalize().ok()) {
        (Some(parent), Some(dir)) => parent == dir,
        _ => false,
    }
}
