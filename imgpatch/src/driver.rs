//! The discover → decompress → fetch config → confirm → update pipeline.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bootimg::{BootConfig, CommandExecutor, Image};
use tracing::{info, warn};

use crate::config::PatchConfig;
use crate::error::{PatchError, PatchResult};
use crate::lock;
use crate::operator::Operator;

/// Exit status used when the operator abandons the run (128 + SIGINT).
const ABANDONED_EXIT: u8 = 130;

/// How a run ended when no error occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `list` printed this many images.
    Listed(usize),
    /// A local copy of the configuration document exists (fetched or kept).
    Fetched { fetched: bool },
    /// The local configuration document has no public key; nothing was changed.
    NeedsConfiguration,
    /// The operator declined or interrupted before any image was touched.
    Abandoned,
    /// This many images now carry the local configuration document.
    Updated(usize),
}

impl Outcome {
    pub fn exit_status(&self) -> u8 {
        match self {
            Self::NeedsConfiguration => 1,
            Self::Abandoned => ABANDONED_EXIT,
            Self::Listed(_) | Self::Fetched { .. } | Self::Updated(_) => 0,
        }
    }
}

/// Exit status of a failed run.
pub fn error_exit_status(error: &PatchError) -> u8 {
    match error {
        PatchError::Interrupted => ABANDONED_EXIT,
        _ => 1,
    }
}

/// What to do with the configuration document once the boot partition is mounted.
enum Transfer<'a> {
    /// Copy it from the image to `dest`.
    Fetch { dest: &'a Path },
    /// Overwrite it with `source`.
    Install { source: &'a Path },
}

/// Print the images found in the image dir.
pub async fn run_list(
    config: &PatchConfig,
    executor: Arc<dyn CommandExecutor>,
    operator: &dyn Operator,
) -> PatchResult<Outcome> {
    let images = discover(config, executor).await?;
    for image in &images {
        let name = image.name();
        operator.notify(&format!(
            "{}\tversion={}\tvariant={:?}\t{}",
            name,
            name.version,
            name.variant,
            image.source_path().display()
        ));
    }
    Ok(Outcome::Listed(images.len()))
}

/// Ensure a local copy of the configuration document exists, pulling it from
/// the first image when it is missing (or always, with `force`).
pub async fn run_fetch(
    config: &PatchConfig,
    executor: Arc<dyn CommandExecutor>,
    operator: &dyn Operator,
    force: bool,
) -> PatchResult<Outcome> {
    let _lock = lock::acquire(&config.lock_path())?;
    let mut images = discover(config, executor).await?;
    let fetched = fetch_config(config, &mut images, operator, force).await?;
    if fetched {
        operator.notify(&format!(
            "Fetched {}; edit it and run `imgpatch update`.",
            config.local_config().display()
        ));
    } else {
        operator.notify(&format!(
            "{} already exists; use --force to replace it.",
            config.local_config().display()
        ));
    }
    Ok(Outcome::Fetched { fetched })
}

/// The full pipeline: every image ends up with the local configuration document.
pub async fn run_update(
    config: &PatchConfig,
    executor: Arc<dyn CommandExecutor>,
    operator: &dyn Operator,
) -> PatchResult<Outcome> {
    let _lock = lock::acquire(&config.lock_path())?;
    let mut images = discover(config, executor).await?;

    for image in &images {
        image.decompress().await?;
    }

    fetch_config(config, &mut images, operator, false).await?;

    let local = config.local_config();
    let (raw, boot_config) = BootConfig::load(&local).await?;
    let Some(public_key) = boot_config.public_key() else {
        operator.notify(&format!(
            "Please edit {} and rerun imgpatch.",
            local.display()
        ));
        return Ok(Outcome::NeedsConfiguration);
    };

    let mut summary = format!(
        "About to update {} images for pk {public_key}:",
        images.len()
    );
    for image in &images {
        summary.push_str(&format!("\n - {}", image.name()));
    }
    if !operator.confirm(&summary).await? {
        operator.notify("Abandoned; no images were changed.");
        return Ok(Outcome::Abandoned);
    }

    // Every image receives exactly the bytes validated above, even if the
    // working copy is edited while the run is in progress.
    let staged = stage(&config.work_dir, &config.config_name, &raw)?;
    for image in &mut images {
        with_boot_partition(
            image,
            config,
            operator,
            Transfer::Install {
                source: staged.path(),
            },
        )
        .await?;
        info!("updated {}", image.name().decompressed_name());
    }

    operator.notify("Images updated! Flash away!");
    Ok(Outcome::Updated(images.len()))
}

/// Scan the image dir; at least one image is required.
async fn discover(
    config: &PatchConfig,
    executor: Arc<dyn CommandExecutor>,
) -> PatchResult<Vec<Image>> {
    let sources = bootimg::scan(&config.image_dir).await?;
    if sources.is_empty() {
        return Err(PatchError::NoImages(config.image_dir.clone()));
    }
    info!(
        count = sources.len(),
        dir = %config.image_dir.display(),
        "found images"
    );
    Ok(sources
        .into_iter()
        .map(|source| Image::new(source, config.work_dir.clone(), Arc::clone(&executor)))
        .collect())
}

/// Returns whether the document was copied out of an image.
async fn fetch_config(
    config: &PatchConfig,
    images: &mut [Image],
    operator: &dyn Operator,
    force: bool,
) -> PatchResult<bool> {
    let local = config.local_config();
    if !force && tokio::fs::try_exists(&local).await? {
        return Ok(false);
    }

    let image = images
        .first_mut()
        .ok_or_else(|| PatchError::NoImages(config.image_dir.clone()))?;
    image.decompress().await?;
    info!(
        "fetching {} from {}",
        config.config_name,
        image.name().decompressed_name()
    );
    with_boot_partition(image, config, operator, Transfer::Fetch { dest: &local }).await?;
    Ok(true)
}

/// Attach, mount the boot partition, transfer, detach.
///
/// An operator interrupt never cancels a command in flight: it is noted and
/// honoured at the next step boundary, so every loop device and mount that
/// was created is known to the image. On any error or interrupt the image is
/// released before returning.
async fn with_boot_partition(
    image: &mut Image,
    config: &PatchConfig,
    operator: &dyn Operator,
    transfer: Transfer<'_>,
) -> PatchResult<()> {
    let partition = config.boot_partition.as_str();
    let file_name = config.config_name.as_str();
    let stop = AtomicBool::new(false);
    let checkpoint = || {
        if stop.load(Ordering::SeqCst) {
            Err(PatchError::Interrupted)
        } else {
            Ok(())
        }
    };

    let result = {
        let work = async {
            image.attach().await?;
            checkpoint()?;
            image.mount(partition).await?;
            checkpoint()?;
            match transfer {
                Transfer::Fetch { dest } => image.copy_out(partition, file_name, dest).await?,
                Transfer::Install { source } => image.copy_in(partition, source, file_name).await?,
            }
            checkpoint()?;
            image.detach().await?;
            checkpoint()
        };
        tokio::pin!(work);

        tokio::select! {
            result = &mut work => result,
            () = operator.interrupted() => {
                warn!("interrupted; stopping once the current command finishes");
                stop.store(true, Ordering::SeqCst);
                work.await
            }
        }
    };
    if result.is_err() {
        image.release().await;
    }
    result
}

/// Write the validated document to a private file in the work dir.
fn stage(
    work_dir: &Path,
    config_name: &str,
    raw: &[u8],
) -> PatchResult<tempfile::NamedTempFile> {
    let mut staged = tempfile::Builder::new()
        .prefix(&format!(".{config_name}."))
        .tempfile_in(work_dir)?;
    staged.write_all(raw)?;
    staged.flush()?;
    Ok(staged)
}
