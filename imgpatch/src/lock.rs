use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{PatchError, PatchResult};

/// Take an exclusive flock on the work dir's lock file without waiting.
///
/// The returned guard holds the lock until dropped. A second run against the
/// same work dir fails with `Busy` instead of sharing loop devices and mount
/// points with the first.
pub fn acquire(path: &Path) -> PatchResult<Flock<std::fs::File>> {
    let file = std::fs::File::options()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| PatchError::Internal(format!("open lock {}: {e}", path.display())))?;
    Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_file, e)| {
        if e == Errno::EWOULDBLOCK {
            PatchError::Busy(path.to_path_buf())
        } else {
            PatchError::Internal(format!("flock {}: {e}", path.display()))
        }
    })
}
