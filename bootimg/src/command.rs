use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// How a command should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Prefix with `sudo`.
    Sudo,
    /// Run as the current user.
    User,
}

/// Format a human-readable display string for a direct command invocation.
pub fn format_command_display(program: &str, args: &[&str], privilege: Privilege) -> String {
    let mut parts = Vec::with_capacity(args.len() + 2);
    if matches!(privilege, Privilege::Sudo) {
        parts.push("sudo");
    }
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

async fn spawn(
    program: &str,
    args: &[&str],
    privilege: Privilege,
) -> std::io::Result<std::process::Output> {
    match privilege {
        Privilege::Sudo => {
            let mut sudo_args = vec![program];
            sudo_args.extend_from_slice(args);
            Command::new("sudo").args(&sudo_args).output().await
        }
        Privilege::User => Command::new(program).args(args).output().await,
    }
}

/// Execute a command.
///
/// Invokes the program binary directly with the given arguments; the command
/// line is echoed to the log before it runs. Returns trimmed stdout on success.
pub async fn exec(
    program: &str,
    args: &[&str],
    privilege: Privilege,
) -> Result<String, CommandError> {
    let cmd_display = format_command_display(program, args, privilege);
    info!("--- {cmd_display}");

    let output = spawn(program, args, privilege)
        .await
        .map_err(|e| CommandError {
            command: cmd_display.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CommandError {
            command: cmd_display,
            detail: stderr,
        })
    }
}

/// Runs external programs on behalf of an image.
///
/// Abstracted as a trait so tests can inject a fake that simulates loop
/// devices and mounts without privileges.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn exec(
        &self,
        program: &str,
        args: &[&str],
        privilege: Privilege,
    ) -> Result<String, CommandError>;

    async fn exec_ignore_errors(&self, program: &str, args: &[&str], privilege: Privilege) {
        if let Err(e) = self.exec(program, args, privilege).await {
            warn!(command = %e.command, detail = %e.detail, "command failed (ignored)");
        }
    }
}

/// Executor that spawns real processes.
pub struct SystemExecutor;

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn exec(
        &self,
        program: &str,
        args: &[&str],
        privilege: Privilege,
    ) -> Result<String, CommandError> {
        exec(program, args, privilege).await
    }
}
