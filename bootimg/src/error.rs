use std::path::PathBuf;

use crate::command::CommandError;

pub type Result<T> = std::result::Result<T, ImageError>;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("already attached {image} to {device}")]
    AlreadyAttached { image: String, device: String },

    #[error("{image} is not attached to a loop device")]
    NotAttached { image: String },

    #[error("partition {partition} of {image} is already mounted")]
    AlreadyMounted { image: String, partition: String },

    #[error("partition {partition} of {image} is not mounted")]
    NotMounted { image: String, partition: String },

    #[error("partition {partition} not found on {device} (found: {found})")]
    UnknownPartition {
        device: String,
        partition: String,
        found: String,
    },

    #[error("decompress {path}: {reason}")]
    Decompress { path: PathBuf, reason: String },

    #[error("scan {dir}: {reason}")]
    Scan { dir: PathBuf, reason: String },

    #[error("config {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("prerequisites not met: {0}")]
    Prerequisites(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
