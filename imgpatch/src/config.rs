use std::path::{Component, Path, PathBuf};

use clap::Args;

use crate::error::{PatchError, PatchResult};

pub(crate) const DEFAULT_IMAGE_DIR: &str = "~/dev/fruit/public/fruitos/release/images";
const LOCK_FILE: &str = ".imgpatch.lock";

#[derive(Args, Debug, Clone)]
pub struct PatchArgs {
    /// Directory scanned for fruitos-*.img.gz release images
    #[arg(long, global = true, env = "IMAGEDIR", default_value = DEFAULT_IMAGE_DIR)]
    pub image_dir: String,
    /// Where decompressed images, mount points and the local config copy live
    #[arg(long, global = true, default_value = ".")]
    pub work_dir: PathBuf,
    /// Name of the configuration document on the boot partition
    #[arg(long, global = true, default_value = bootimg::CONFIG_FILE)]
    pub config_name: String,
    /// Partition number of the boot partition
    #[arg(long, global = true, default_value = bootimg::BOOT_PARTITION)]
    pub boot_partition: String,
    /// Skip the host prerequisite checks (commands on PATH, sudo)
    #[arg(long, global = true)]
    pub skip_checks: bool,
}

/// Fully resolved settings for one run; nothing downstream reads the
/// environment or the current directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchConfig {
    pub image_dir: PathBuf,
    pub work_dir: PathBuf,
    pub config_name: String,
    pub boot_partition: String,
    pub check_prerequisites: bool,
}

impl PatchConfig {
    /// Resolve CLI arguments against the caller's home and current directory.
    pub fn resolve(args: PatchArgs, home: Option<&Path>, cwd: &Path) -> PatchResult<Self> {
        validate_file_name(&args.config_name)?;
        if args.boot_partition.is_empty()
            || !args.boot_partition.chars().all(|c| c.is_ascii_digit())
        {
            return Err(PatchError::Config(format!(
                "boot partition must be a partition number, got {:?}",
                args.boot_partition
            )));
        }

        let image_dir = expand_home(&args.image_dir, home)?;
        Ok(Self {
            image_dir: absolutize(image_dir, cwd),
            work_dir: absolutize(args.work_dir, cwd),
            config_name: args.config_name,
            boot_partition: args.boot_partition,
            check_prerequisites: !args.skip_checks,
        })
    }

    /// The operator's working copy of the configuration document.
    pub fn local_config(&self) -> PathBuf {
        self.work_dir.join(&self.config_name)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.work_dir.join(LOCK_FILE)
    }
}

fn validate_file_name(name: &str) -> PatchResult<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(PatchError::Config(format!(
            "config name must be a plain file name, got {name:?}"
        ))),
    }
}

/// Expand a leading `~` to `home`.
fn expand_home(path: &str, home: Option<&Path>) -> PatchResult<PathBuf> {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return Ok(PathBuf::from(path)),
    };
    let home = home.ok_or_else(|| {
        PatchError::Config(format!("cannot expand {path}: HOME is not set"))
    })?;
    Ok(home.join(rest))
}

fn absolutize(path: PathBuf, cwd: &Path) -> PathBuf {
    if path.is_relative() {
        cwd.join(path)
    } else {
        path
    }
}
