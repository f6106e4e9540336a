mod boot_config;
mod command;
mod error;
mod image;
mod prerequisites;
mod registry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use boot_config::{BootConfig, CONFIG_FILE};
pub use command::{CommandError, CommandExecutor, Privilege, SystemExecutor};
pub use error::{ImageError, Result};
pub use image::{BOOT_PARTITION, Image, LoopDevice};
pub use prerequisites::check_prerequisites;
pub use registry::{ImageName, ImageSource, scan};
