use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::MultiGzDecoder;
use tracing::{debug, info, warn};

use crate::command::{CommandError, CommandExecutor, Privilege};
use crate::error::{ImageError, Result};
use crate::registry::{ImageName, ImageSource};

/// Partition holding the boot files.
pub const BOOT_PARTITION: &str = "1";

/// Attempts at listing partitions right after attach; the kernel may publish
/// them slightly after `losetup` returns.
const PARTITION_SCAN_ATTEMPTS: u32 = 10;
const PARTITION_SCAN_DELAY: Duration = Duration::from_millis(200);

/// A loop device bound to an image file.
#[derive(Debug, Clone)]
pub struct LoopDevice {
    pub path: String,
    pub partitions: Vec<String>,
    mounted: BTreeSet<String>,
}

impl LoopDevice {
    /// Block device of a partition: `/dev/loop0` + `1` → `/dev/loop0p1`.
    pub fn partition_path(&self, partition: &str) -> String {
        format!("{}p{partition}", self.path)
    }
}

/// One release image and its attach/mount state.
///
/// `unattached` → `attached` → `mounted[p]`… → `attached` → `unattached`.
/// Callers must end every attach with [`Image::detach`] or
/// [`Image::release`]; dropping an attached image only logs a warning.
pub struct Image {
    name: ImageName,
    source: PathBuf,
    work_dir: PathBuf,
    executor: Arc<dyn CommandExecutor>,
    loop_device: Option<LoopDevice>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("loop_device", &self.loop_device)
            .finish_non_exhaustive()
    }
}

impl Image {
    pub fn new(
        source: ImageSource,
        work_dir: PathBuf,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            name: source.name,
            source: source.path,
            work_dir,
            executor,
            loop_device: None,
        }
    }

    pub fn name(&self) -> &ImageName {
        &self.name
    }

    pub fn source_path(&self) -> &Path {
        &self.source
    }

    /// Where the decompressed image lives: `<work_dir>/<name without .gz>`.
    pub fn decompressed_path(&self) -> PathBuf {
        self.work_dir.join(self.name.decompressed_name())
    }

    pub fn mount_point(&self, partition: &str) -> PathBuf {
        self.work_dir.join(format!("mnt{partition}"))
    }

    pub fn loop_device(&self) -> Option<&LoopDevice> {
        self.loop_device.as_ref()
    }

    pub fn is_attached(&self) -> bool {
        self.loop_device.is_some()
    }

    /// Partitions currently mounted, in ascending order.
    pub fn mounted(&self) -> Vec<&str> {
        self.loop_device
            .iter()
            .flat_map(|d| d.mounted.iter().map(String::as_str))
            .collect()
    }

    /// Decompress the source into [`Image::decompressed_path`].
    ///
    /// Returns `false` without touching anything when the target already
    /// exists. The data is written to a `.tmp` sibling and renamed into place,
    /// so a failed run never leaves a partial file at the final name.
    pub async fn decompress(&self) -> Result<bool> {
        let target = self.decompressed_path();
        if tokio::fs::try_exists(&target).await? {
            debug!(path = %target.display(), "already decompressed");
            return Ok(false);
        }

        let tmp = self
            .work_dir
            .join(format!("{}.tmp", self.name.decompressed_name()));
        info!(
            "decompressing {} -> {}",
            self.source.display(),
            target.display()
        );

        let result = async {
            let source = self.source.clone();
            let dest = tmp.clone();
            tokio::task::spawn_blocking(move || gunzip(&source, &dest))
                .await
                .map_err(|e| ImageError::Decompress {
                    path: self.source.clone(),
                    reason: format!("decompress task: {e}"),
                })??;
            tokio::fs::rename(&tmp, &target)
                .await
                .map_err(|e| ImageError::Decompress {
                    path: self.source.clone(),
                    reason: format!("rename to {}: {e}", target.display()),
                })
        }
        .await;

        if result.is_err()
            && let Err(e) = tokio::fs::remove_file(&tmp).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %tmp.display(), error = %e, "failed to remove partial decompression");
        }
        result.map(|()| true)
    }

    /// Bind the decompressed image to a free loop device with partition scanning.
    pub async fn attach(&mut self) -> Result<()> {
        if let Some(device) = &self.loop_device {
            return Err(ImageError::AlreadyAttached {
                image: self.name.decompressed_name().to_string(),
                device: device.path.clone(),
            });
        }

        let file = self.decompressed_path();
        let file = file.to_string_lossy();
        let path = self
            .executor
            .exec(
                "losetup",
                &["--find", "--show", "--partscan", &file],
                Privilege::Sudo,
            )
            .await?;
        if path.is_empty() {
            return Err(CommandError {
                command: format!("sudo losetup --find --show --partscan {file}"),
                detail: "no loop device reported".to_string(),
            }
            .into());
        }
        info!("attached {} to {path}", self.name.decompressed_name());

        let partitions = match self.discover_partitions(&path).await {
            Ok(partitions) => partitions,
            Err(e) => {
                self.executor
                    .exec_ignore_errors("losetup", &["-d", &path], Privilege::Sudo)
                    .await;
                return Err(e);
            }
        };
        info!(device = %path, ?partitions, "partitions found");

        self.loop_device = Some(LoopDevice {
            path,
            partitions,
            mounted: BTreeSet::new(),
        });
        Ok(())
    }

    async fn discover_partitions(&self, device: &str) -> Result<Vec<String>> {
        let base = device.rsplit('/').next().unwrap_or(device);
        let prefix = format!("{base}p");

        let mut attempt = 1;
        loop {
            let listing = self
                .executor
                .exec("lsblk", &["-lnro", "NAME", device], Privilege::User)
                .await?;
            let partitions: Vec<String> = listing
                .lines()
                .filter_map(|line| line.trim().strip_prefix(&prefix))
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
            if !partitions.is_empty() || attempt >= PARTITION_SCAN_ATTEMPTS {
                return Ok(partitions);
            }
            attempt += 1;
            tokio::time::sleep(PARTITION_SCAN_DELAY).await;
        }
    }

    /// Mount `partition` read-write at `<work_dir>/mnt<partition>`.
    ///
    /// Mounting a partition that is already mounted is rejected without
    /// running any command.
    pub async fn mount(&mut self, partition: &str) -> Result<PathBuf> {
        let mount_point = self.mount_point(partition);
        let device = self
            .loop_device
            .as_mut()
            .ok_or_else(|| ImageError::NotAttached {
                image: self.name.decompressed_name().to_string(),
            })?;
        if device.mounted.contains(partition) {
            return Err(ImageError::AlreadyMounted {
                image: self.name.decompressed_name().to_string(),
                partition: partition.to_string(),
            });
        }
        if !device.partitions.iter().any(|p| p == partition) {
            return Err(ImageError::UnknownPartition {
                device: device.path.clone(),
                partition: partition.to_string(),
                found: device.partitions.join(","),
            });
        }

        tokio::fs::create_dir_all(&mount_point).await?;
        let block = device.partition_path(partition);
        let target = mount_point.to_string_lossy();
        self.executor
            .exec("mount", &["-o", "rw", &block, &target], Privilege::Sudo)
            .await?;
        device.mounted.insert(partition.to_string());
        Ok(mount_point)
    }

    /// Unmount `partition` and remove its mount point.
    pub async fn unmount(&mut self, partition: &str) -> Result<()> {
        let mount_point = self.mount_point(partition);
        let device = self
            .loop_device
            .as_mut()
            .filter(|d| d.mounted.contains(partition))
            .ok_or_else(|| ImageError::NotMounted {
                image: self.name.decompressed_name().to_string(),
                partition: partition.to_string(),
            })?;

        let target = mount_point.to_string_lossy();
        self.executor
            .exec("umount", &[&target], Privilege::Sudo)
            .await?;
        device.mounted.remove(partition);

        match tokio::fs::remove_dir(&mount_point).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Unmount everything, then release the loop device.
    pub async fn detach(&mut self) -> Result<()> {
        let device = self
            .loop_device
            .as_ref()
            .ok_or_else(|| ImageError::NotAttached {
                image: self.name.decompressed_name().to_string(),
            })?;
        let path = device.path.clone();
        let mounted: Vec<String> = device.mounted.iter().cloned().collect();

        for partition in mounted {
            self.unmount(&partition).await?;
        }
        self.executor
            .exec("losetup", &["-d", &path], Privilege::Sudo)
            .await?;
        info!("detached {} from {path}", self.name.decompressed_name());
        self.loop_device = None;
        Ok(())
    }

    /// Best-effort teardown for error and interrupt paths. Never fails;
    /// leaves the image unattached.
    pub async fn release(&mut self) {
        let Some(device) = self.loop_device.take() else {
            return;
        };
        warn!(
            device = %device.path,
            mounted = ?device.mounted,
            "releasing {}",
            self.name.decompressed_name()
        );

        for partition in &device.mounted {
            let mount_point = self.mount_point(partition);
            let target = mount_point.to_string_lossy();
            self.executor
                .exec_ignore_errors("umount", &[&target], Privilege::Sudo)
                .await;
            if let Err(e) = tokio::fs::remove_dir(&mount_point).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %mount_point.display(), error = %e, "failed to remove mount point");
            }
        }
        self.executor
            .exec_ignore_errors("losetup", &["-d", &device.path], Privilege::Sudo)
            .await;
    }

    /// Copy `file_name` from a mounted partition to `dest`.
    pub async fn copy_out(&self, partition: &str, file_name: &str, dest: &Path) -> Result<()> {
        let source = self.mounted_file(partition, file_name)?;
        let source = source.to_string_lossy();
        let dest = dest.to_string_lossy();
        self.executor
            .exec("cp", &[&source, &dest], Privilege::User)
            .await?;
        Ok(())
    }

    /// Overwrite `file_name` on a mounted partition with the contents of `source`.
    pub async fn copy_in(&self, partition: &str, source: &Path, file_name: &str) -> Result<()> {
        let dest = self.mounted_file(partition, file_name)?;
        let dest = dest.to_string_lossy();
        let source = source.to_string_lossy();
        self.executor
            .exec("cp", &[&source, &dest], Privilege::Sudo)
            .await?;
        Ok(())
    }

    fn mounted_file(&self, partition: &str, file_name: &str) -> Result<PathBuf> {
        if !self.mounted().contains(&partition) {
            return Err(ImageError::NotMounted {
                image: self.name.decompressed_name().to_string(),
                partition: partition.to_string(),
            });
        }
        Ok(self.mount_point(partition).join(file_name))
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Some(device) = &self.loop_device {
            warn!(
                device = %device.path,
                mounted = ?device.mounted,
                "{} dropped while still attached",
                self.name.decompressed_name()
            );
        }
    }
}

fn gunzip(source: &Path, dest: &Path) -> Result<()> {
    let decompress_err = |e: std::io::Error| ImageError::Decompress {
        path: source.to_path_buf(),
        reason: e.to_string(),
    };

    let input = File::open(source).map_err(decompress_err)?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(input));
    let mut output = BufWriter::new(File::create(dest).map_err(decompress_err)?);
    std::io::copy(&mut decoder, &mut output).map_err(decompress_err)?;
    output.flush().map_err(decompress_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExecutor;

    const IMAGE_FILE: &str = "fruitos-1.2.3-raspberrypi64.img.gz";

    struct Fixture {
        dir: tempfile::TempDir,
        fake: Arc<FakeExecutor>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                fake: Arc::new(FakeExecutor::new()),
            }
        }

        fn image(&self) -> Image {
            let source = ImageSource {
                name: ImageName::parse(IMAGE_FILE).unwrap(),
                path: self.dir.path().join(IMAGE_FILE),
            };
            Image::new(source, self.dir.path().to_path_buf(), self.fake.clone())
        }

        fn write_gz(&self, contents: &[u8]) {
            let file = File::create(self.dir.path().join(IMAGE_FILE)).unwrap();
            let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
            encoder.write_all(contents).unwrap();
            encoder.finish().unwrap();
        }

        async fn attached(&self) -> Image {
            let mut image = self.image();
            tokio::fs::write(image.decompressed_path(), b"raw")
                .await
                .unwrap();
            image.attach().await.unwrap();
            image
        }
    }

    #[tokio::test]
    async fn decompress_writes_derived_name() {
        let fx = Fixture::new();
        fx.write_gz(b"disk image bytes");
        let image = fx.image();

        assert!(image.decompress().await.unwrap());
        let path = fx.dir.path().join("fruitos-1.2.3-raspberrypi64.img");
        assert_eq!(image.decompressed_path(), path);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"disk image bytes");
        assert!(!fx.dir.path().join("fruitos-1.2.3-raspberrypi64.img.tmp").exists());
    }

    #[tokio::test]
    async fn decompress_is_idempotent() {
        let fx = Fixture::new();
        fx.write_gz(b"fresh");
        let image = fx.image();
        tokio::fs::write(image.decompressed_path(), b"existing")
            .await
            .unwrap();

        assert!(!image.decompress().await.unwrap());
        assert!(!image.decompress().await.unwrap());
        assert_eq!(
            tokio::fs::read(image.decompressed_path()).await.unwrap(),
            b"existing"
        );
    }

    #[tokio::test]
    async fn decompress_failure_leaves_no_file() {
        let fx = Fixture::new();
        tokio::fs::write(fx.dir.path().join(IMAGE_FILE), b"not gzip at all")
            .await
            .unwrap();
        let image = fx.image();

        let err = image.decompress().await.unwrap_err();
        assert!(matches!(err, ImageError::Decompress { .. }));
        assert!(!image.decompressed_path().exists());
        assert!(!fx.dir.path().join("fruitos-1.2.3-raspberrypi64.img.tmp").exists());
    }

    #[tokio::test]
    async fn attach_records_device_and_partitions() {
        let fx = Fixture::new();
        let mut image = fx.attached().await;

        let device = image.loop_device().unwrap();
        assert_eq!(device.path, "/dev/loop0");
        assert_eq!(device.partitions, ["1", "2", "3"]);
        assert!(image.mounted().is_empty());
        image.detach().await.unwrap();
    }

    #[tokio::test]
    async fn attach_twice_fails_and_keeps_binding() {
        let fx = Fixture::new();
        let mut image = fx.attached().await;
        let before = fx.fake.commands().len();

        let err = image.attach().await.unwrap_err();
        assert!(
            matches!(&err, ImageError::AlreadyAttached { device, .. } if device == "/dev/loop0")
        );
        assert_eq!(image.loop_device().unwrap().path, "/dev/loop0");
        assert_eq!(fx.fake.commands().len(), before);
        image.detach().await.unwrap();
    }

    #[tokio::test]
    async fn mount_requires_attach() {
        let fx = Fixture::new();
        let mut image = fx.image();
        let err = image.mount(BOOT_PARTITION).await.unwrap_err();
        assert!(matches!(err, ImageError::NotAttached { .. }));
        assert!(fx.fake.commands().is_empty());
    }

    #[tokio::test]
    async fn mount_unknown_partition_fails() {
        let fx = Fixture::new();
        let mut image = fx.attached().await;
        let err = image.mount("7").await.unwrap_err();
        assert!(matches!(err, ImageError::UnknownPartition { .. }));
        image.detach().await.unwrap();
    }

    #[tokio::test]
    async fn double_mount_is_rejected_without_running_mount() {
        let fx = Fixture::new();
        let mut image = fx.attached().await;
        image.mount(BOOT_PARTITION).await.unwrap();
        let before = fx.fake.commands().len();

        let err = image.mount(BOOT_PARTITION).await.unwrap_err();
        assert!(matches!(err, ImageError::AlreadyMounted { .. }));
        assert_eq!(fx.fake.commands().len(), before);
        image.detach().await.unwrap();
    }

    #[tokio::test]
    async fn unmount_after_mount_then_unmount_again_fails() {
        let fx = Fixture::new();
        let mut image = fx.attached().await;
        let mount_point = image.mount(BOOT_PARTITION).await.unwrap();
        assert_eq!(mount_point, fx.dir.path().join("mnt1"));
        assert!(mount_point.is_dir());
        assert_eq!(image.mounted(), ["1"]);

        image.unmount(BOOT_PARTITION).await.unwrap();
        assert!(image.mounted().is_empty());
        assert!(!mount_point.exists());

        let err = image.unmount(BOOT_PARTITION).await.unwrap_err();
        assert!(matches!(err, ImageError::NotMounted { .. }));
        image.detach().await.unwrap();
    }

    #[tokio::test]
    async fn unmount_tolerates_removed_mount_point() {
        let fx = Fixture::new();
        let mut image = fx.attached().await;
        let mount_point = image.mount("2").await.unwrap();
        tokio::fs::remove_dir(&mount_point).await.unwrap();

        image.unmount("2").await.unwrap();
        assert!(image.mounted().is_empty());
        image.detach().await.unwrap();
    }

    #[tokio::test]
    async fn detach_unmounts_everything() {
        let fx = Fixture::new();
        let mut image = fx.attached().await;
        for partition in ["1", "2", "3"] {
            image.mount(partition).await.unwrap();
        }
        assert_eq!(image.mounted(), ["1", "2", "3"]);

        image.detach().await.unwrap();
        assert!(!image.is_attached());
        assert!(image.mounted().is_empty());
        assert_eq!(fx.fake.attached_count(), 0);
        assert_eq!(fx.fake.mount_count(), 0);
        let umounts = fx
            .fake
            .commands()
            .iter()
            .filter(|c| c.starts_with("sudo umount"))
            .count();
        assert_eq!(umounts, 3);
        assert_eq!(
            fx.fake.commands().last().map(String::as_str),
            Some("sudo losetup -d /dev/loop0")
        );
    }

    #[tokio::test]
    async fn detach_requires_attach() {
        let fx = Fixture::new();
        let mut image = fx.image();
        assert!(matches!(
            image.detach().await.unwrap_err(),
            ImageError::NotAttached { .. }
        ));
    }

    #[tokio::test]
    async fn release_cleans_up_even_when_commands_fail() {
        let fx = Fixture::new();
        let mut image = fx.attached().await;
        image.mount(BOOT_PARTITION).await.unwrap();
        fx.fake.fail_on("umount");

        image.release().await;
        assert!(!image.is_attached());
        assert!(image.mounted().is_empty());
        assert_eq!(fx.fake.attached_count(), 0);
        assert_eq!(
            fx.fake.commands().last().map(String::as_str),
            Some("sudo losetup -d /dev/loop0")
        );

        // Releasing an unattached image is a no-op.
        let before = fx.fake.commands().len();
        image.release().await;
        assert_eq!(fx.fake.commands().len(), before);
    }

    #[tokio::test]
    async fn failed_partition_listing_releases_device() {
        let fx = Fixture::new();
        let mut image = fx.image();
        tokio::fs::write(image.decompressed_path(), b"raw")
            .await
            .unwrap();
        fx.fake.fail_on("lsblk");

        let err = image.attach().await.unwrap_err();
        assert!(matches!(err, ImageError::Command(_)));
        assert!(!image.is_attached());
        assert_eq!(fx.fake.attached_count(), 0);
    }

    #[tokio::test]
    async fn copy_in_and_out_of_mounted_partition() {
        let fx = Fixture::new();
        let mut image = fx.attached().await;
        let store = FakeExecutor::partition_store(&image.decompressed_path(), BOOT_PARTITION);
        std::fs::create_dir_all(&store).unwrap();
        std::fs::write(store.join("fruit.json"), b"{}").unwrap();

        let dest = fx.dir.path().join("copy.json");
        let err = image.copy_out(BOOT_PARTITION, "fruit.json", &dest).await;
        assert!(matches!(err, Err(ImageError::NotMounted { .. })));

        image.mount(BOOT_PARTITION).await.unwrap();
        image
            .copy_out(BOOT_PARTITION, "fruit.json", &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"{}");

        let update = fx.dir.path().join("update.json");
        std::fs::write(&update, b"{\"public-key\":\"k\"}").unwrap();
        image
            .copy_in(BOOT_PARTITION, &update, "fruit.json")
            .await
            .unwrap();
        image.detach().await.unwrap();

        assert_eq!(
            std::fs::read(store.join("fruit.json")).unwrap(),
            b"{\"public-key\":\"k\"}"
        );
    }
}
