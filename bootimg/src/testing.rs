//! In-process stand-in for `losetup`, `lsblk`, `mount`, `umount` and `cp`.
//!
//! Each partition of an image file is backed by a plain directory next to
//! it (`<image>.p<N>`). Mounting copies that directory's files into the mount
//! point and unmounting writes them back, so tests observe the same effects a
//! real boot partition would show.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::command::{CommandError, CommandExecutor, Privilege, format_command_display};

#[derive(Default)]
struct FakeState {
    next_loop: u32,
    /// loop device path → backing image file
    devices: HashMap<String, PathBuf>,
    /// mount point → partition store
    mounts: HashMap<PathBuf, PathBuf>,
    commands: Vec<String>,
    fail_on: Vec<String>,
}

pub struct FakeExecutor {
    partitions: Vec<String>,
    state: Mutex<FakeState>,
}

impl Default for FakeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeExecutor {
    /// Every attached image exposes partitions 1, 2 and 3.
    pub fn new() -> Self {
        Self {
            partitions: ["1", "2", "3"].map(String::from).to_vec(),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Directory backing `partition` of `image`.
    pub fn partition_store(image: &Path, partition: &str) -> PathBuf {
        let mut name = image.as_os_str().to_owned();
        name.push(format!(".p{partition}"));
        PathBuf::from(name)
    }

    /// Make every command whose rendered line contains `pattern` fail.
    pub fn fail_on(&self, pattern: &str) {
        self.lock().fail_on.push(pattern.to_string());
    }

    /// Rendered command lines, in the order they were run.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn attached_count(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn mount_count(&self) -> usize {
        self.lock().mounts.len()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, state: &mut FakeState, program: &str, args: &[&str]) -> Result<String, String> {
        match (program, args) {
            ("losetup", ["--find", "--show", "--partscan", file]) => {
                if !Path::new(file).is_file() {
                    return Err(format!("{file}: No such file or directory"));
                }
                let device = format!("/dev/loop{}", state.next_loop);
                state.next_loop += 1;
                state.devices.insert(device.clone(), PathBuf::from(file));
                Ok(device)
            }
            ("losetup", ["-d", device]) => state
                .devices
                .remove(*device)
                .map(|_| String::new())
                .ok_or_else(|| format!("{device}: No such device or address")),
            ("lsblk", [.., device]) => {
                if !state.devices.contains_key(*device) {
                    return Err(format!("{device}: not a block device"));
                }
                let base = device.rsplit('/').next().unwrap_or(*device);
                let mut lines = vec![base.to_string()];
                lines.extend(self.partitions.iter().map(|p| format!("{base}p{p}")));
                Ok(lines.join("\n"))
            }
            ("mount", [.., block, target]) => {
                let (device, partition) = block
                    .rsplit_once('p')
                    .ok_or_else(|| format!("{block}: bad block device"))?;
                let image = state
                    .devices
                    .get(device)
                    .ok_or_else(|| format!("{block}: special device does not exist"))?;
                if !self.partitions.iter().any(|p| p == partition) {
                    return Err(format!("{block}: special device does not exist"));
                }
                let target = PathBuf::from(target);
                if state.mounts.contains_key(&target) {
                    return Err(format!("{}: already mounted", target.display()));
                }
                let store = Self::partition_store(image, partition);
                std::fs::create_dir_all(&store).map_err(|e| e.to_string())?;
                copy_files(&store, &target)?;
                state.mounts.insert(target, store);
                Ok(String::new())
            }
            ("umount", [target]) => {
                let target = PathBuf::from(target);
                let store = state
                    .mounts
                    .remove(&target)
                    .ok_or_else(|| format!("{}: not mounted", target.display()))?;
                if target.is_dir() {
                    copy_files(&target, &store)?;
                    clear_files(&target)?;
                }
                Ok(String::new())
            }
            ("cp", [source, dest]) => std::fs::copy(source, dest)
                .map(|_| String::new())
                .map_err(|e| format!("cannot copy {source} to {dest}: {e}")),
            _ => Ok(String::new()),
        }
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn exec(
        &self,
        program: &str,
        args: &[&str],
        privilege: Privilege,
    ) -> Result<String, CommandError> {
        let command = format_command_display(program, args, privilege);
        let mut state = self.lock();
        state.commands.push(command.clone());

        if state.fail_on.iter().any(|p| command.contains(p.as_str())) {
            return Err(CommandError {
                command,
                detail: "injected failure".to_string(),
            });
        }
        self.run(&mut state, program, args)
            .map_err(|detail| CommandError { command, detail })
    }
}

fn copy_files(from: &Path, to: &Path) -> Result<(), String> {
    let entries = std::fs::read_dir(from).map_err(|e| format!("{}: {e}", from.display()))?;
    for entry in entries {
        let entry = entry.map_err(|e| e.to_string())?;
        if entry.path().is_file() {
            std::fs::copy(entry.path(), to.join(entry.file_name())).map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

fn clear_files(dir: &Path) -> Result<(), String> {
    let entries = std::fs::read_dir(dir).map_err(|e| format!("{}: {e}", dir.display()))?;
    for entry in entries {
        let entry = entry.map_err(|e| e.to_string())?;
        if entry.path().is_file() {
            std::fs::remove_file(entry.path()).map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}
