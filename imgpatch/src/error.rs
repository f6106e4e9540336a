use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error(transparent)]
    Image(#[from] bootimg::ImageError),

    #[error("no images matching fruitos-<version>-raspberrypi<variant>.img.gz in {}", .0.display())]
    NoImages(PathBuf),

    #[error("config error: {0}")]
    Config(String),

    #[error("work dir busy: another run holds {}", .0.display())]
    Busy(PathBuf),

    #[error("interrupted")]
    Interrupted,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PatchResult<T> = Result<T, PatchError>;
