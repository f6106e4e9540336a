use crate::command::{CommandExecutor, Privilege};
use crate::error::{ImageError, Result};

/// Commands the image lifecycle shells out to.
const REQUIRED_COMMANDS: [&str; 6] = ["losetup", "lsblk", "mount", "umount", "cp", "sudo"];

/// Verify that the host can attach and mount images before anything is touched.
///
/// Collects all failures and returns them in a single `Prerequisites` error.
pub async fn check_prerequisites(executor: &dyn CommandExecutor) -> Result<()> {
    let mut errors = Vec::new();

    check_required_commands(&mut errors);
    check_sudo(executor, &mut errors).await;

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ImageError::Prerequisites(errors.join("; ")))
    }
}

fn check_required_commands(errors: &mut Vec<String>) {
    for cmd in REQUIRED_COMMANDS {
        if which::which(cmd).is_err() {
            errors.push(format!("required command not found: {cmd}"));
        }
    }
}

async fn check_sudo(executor: &dyn CommandExecutor, errors: &mut Vec<String>) {
    if executor
        .exec("sudo", &["-n", "true"], Privilege::User)
        .await
        .is_err()
    {
        errors.push(
            "sudo access required for loop devices and mounts; \
             configure passwordless sudo or run `sudo -v` first"
                .to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExecutor;

    #[tokio::test]
    async fn sudo_failure_is_reported() {
        let fake = FakeExecutor::new();
        fake.fail_on("sudo -n true");
        let mut errors = Vec::new();
        check_sudo(&fake, &mut errors).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("sudo access required"));
    }

    #[tokio::test]
    async fn sudo_success_adds_nothing() {
        let fake = FakeExecutor::new();
        let mut errors = Vec::new();
        check_sudo(&fake, &mut errors).await;
        assert!(errors.is_empty());
        assert_eq!(fake.commands(), ["sudo -n true"]);
    }
}
