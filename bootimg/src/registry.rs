//! Discovery of compressed release images in a directory.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ImageError, Result};

const NAME_PREFIX: &str = "fruitos-";
const BOARD_MARKER: &str = "-raspberrypi";
const IMAGE_SUFFIX: &str = ".img";
const COMPRESSION_SUFFIX: &str = ".gz";

/// Identity of a release image, parsed from its file name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ImageName {
    pub version: String,
    pub variant: String,
    pub file_name: String,
}

impl ImageName {
    /// Parse `fruitos-<version>-raspberrypi<variant>.img.gz`.
    ///
    /// `version` is a non-empty run of digits and dots; `variant` is whatever
    /// sits between the board marker and `.img.gz` and may be empty.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name
            .strip_prefix(NAME_PREFIX)?
            .strip_suffix(COMPRESSION_SUFFIX)?
            .strip_suffix(IMAGE_SUFFIX)?;
        let (version, variant) = stem.split_once(BOARD_MARKER)?;
        if version.is_empty() || !version.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return None;
        }
        Some(Self {
            version: version.to_string(),
            variant: variant.to_string(),
            file_name: file_name.to_string(),
        })
    }

    /// File name with the trailing compression suffix removed.
    pub fn decompressed_name(&self) -> &str {
        self.file_name
            .strip_suffix(COMPRESSION_SUFFIX)
            .unwrap_or(&self.file_name)
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageSource({},{})", self.version, self.variant)
    }
}

/// A matching file found by [`scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    pub name: ImageName,
    pub path: PathBuf,
}

/// Scan `dir` (non-recursively) for release images, ordered by file name.
pub async fn scan(dir: &Path) -> Result<Vec<ImageSource>> {
    let scan_err = |e: std::io::Error| ImageError::Scan {
        dir: dir.to_path_buf(),
        reason: e.to_string(),
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(scan_err)?;
    let mut found = BTreeMap::new();

    while let Some(entry) = entries.next_entry().await.map_err(scan_err)? {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(name) = ImageName::parse(file_name) else {
            debug!(file = file_name, "skipping non-image entry");
            continue;
        };
        if !entry.file_type().await.map_err(scan_err)?.is_file() {
            debug!(file = file_name, "skipping non-file entry");
            continue;
        }
        found.insert(
            name.file_name.clone(),
            ImageSource {
                name,
                path: entry.path(),
            },
        );
    }

    let images: Vec<ImageSource> = found.into_values().collect();
    warn_duplicate_identities(&images);
    Ok(images)
}

fn warn_duplicate_identities(images: &[ImageSource]) {
    let mut seen: BTreeMap<(&str, &str), &str> = BTreeMap::new();
    for image in images {
        let key = (image.name.version.as_str(), image.name.variant.as_str());
        if let Some(previous) = seen.insert(key, &image.name.file_name) {
            warn!(
                first = previous,
                second = %image.name.file_name,
                "two files share version {} variant {:?}",
                image.name.version,
                image.name.variant
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_variant() {
        let name = ImageName::parse("fruitos-1.2.3-raspberrypi.img.gz").unwrap();
        assert_eq!(name.version, "1.2.3");
        assert_eq!(name.variant, "");
    }

    #[test]
    fn parse_64_bit_variant() {
        let name = ImageName::parse("fruitos-1.2.3-raspberrypi64.img.gz").unwrap();
        assert_eq!(name.version, "1.2.3");
        assert_eq!(name.variant, "64");
        assert_eq!(name.to_string(), "ImageSource(1.2.3,64)");
    }

    #[test]
    fn rejects_non_matching_names() {
        for file in [
            "fruitos-1.2.3-raspberrypi.img",
            "fruitos-1.2.3-raspberrypi.img.xz",
            "fruitos--raspberrypi.img.gz",
            "fruitos-1.2a-raspberrypi.img.gz",
            "otheros-1.2.3-raspberrypi.img.gz",
            "fruitos-1.2.3-pine64.img.gz",
            "fruit.json",
        ] {
            assert!(ImageName::parse(file).is_none(), "{file} should not match");
        }
    }

    #[test]
    fn decompressed_name_strips_only_trailing_gz() {
        for file in [
            "fruitos-1.2.3-raspberrypi.img.gz",
            "fruitos-0.9-raspberrypi64.img.gz",
            "fruitos-2.0.0-raspberrypi.gz.img.gz",
        ] {
            let name = ImageName::parse(file).unwrap();
            let expected = file.strip_suffix(".gz").unwrap();
            assert_eq!(name.decompressed_name(), expected);
        }
    }

    #[tokio::test]
    async fn scan_finds_matching_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for file in [
            "fruitos-1.2.3-raspberrypi64.img.gz",
            "fruitos-1.2.3-raspberrypi.img.gz",
            "README.md",
            "fruitos-1.2.3-raspberrypi.img",
        ] {
            tokio::fs::write(dir.path().join(file), b"").await.unwrap();
        }
        tokio::fs::create_dir(dir.path().join("fruitos-9-raspberrypi.img.gz"))
            .await
            .unwrap();

        let images = scan(dir.path()).await.unwrap();
        let names: Vec<&str> = images.iter().map(|i| i.name.file_name.as_str()).collect();
        assert_eq!(
            names,
            [
                "fruitos-1.2.3-raspberrypi.img.gz",
                "fruitos-1.2.3-raspberrypi64.img.gz"
            ]
        );
        assert_eq!(
            images[0].path,
            dir.path().join("fruitos-1.2.3-raspberrypi.img.gz")
        );
    }

    #[tokio::test]
    async fn scan_missing_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = scan(&missing).await.unwrap_err();
        assert!(matches!(err, ImageError::Scan { dir, .. } if dir == missing));
    }
}
