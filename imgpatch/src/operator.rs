use std::future::Future;
use std::io::BufRead;

use async_trait::async_trait;

use crate::error::{PatchError, PatchResult};

/// The person driving the run: receives messages, confirms the update and
/// may interrupt at any time.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Show a message meant for the operator (not a log line).
    fn notify(&self, message: &str);

    /// Show `summary` and wait for the go-ahead. `false` abandons the run.
    async fn confirm(&self, summary: &str) -> PatchResult<bool>;

    /// Resolves when the operator interrupts the run.
    async fn interrupted(&self);
}

/// Operator at the terminal: stdout for messages, one line of stdin to
/// confirm, Ctrl-C to abandon.
pub struct ConsoleOperator {
    assume_yes: bool,
}

impl ConsoleOperator {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

#[async_trait]
impl Operator for ConsoleOperator {
    fn notify(&self, message: &str) {
        println!("{message}");
    }

    async fn confirm(&self, summary: &str) -> PatchResult<bool> {
        println!("{summary}");
        if self.assume_yes {
            return Ok(true);
        }
        println!("Hit ENTER to continue, Ctrl-C to abandon");
        await_answer(read_stdin_line, self.interrupted()).await
    }

    async fn interrupted(&self) {
        ctrl_c().await;
    }
}

/// Drive `future` on a current-thread runtime, then shut the runtime down
/// without waiting for blocking tasks.
///
/// A stdin read abandoned by Ctrl-C at the prompt never finishes on its own;
/// dropping the runtime normally would keep the process alive until the
/// operator presses ENTER.
pub fn block_on<F: Future>(future: F) -> std::io::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(future);
    runtime.shutdown_background();
    Ok(output)
}

fn read_stdin_line() -> std::io::Result<bool> {
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).map(|n| n > 0)
}

/// Wait for `read_line` (run on a blocking task) unless `interrupted`
/// resolves first. An empty read (EOF) declines.
///
/// The blocking read cannot be cancelled; when interrupted it is left behind
/// and [`block_on`] does not wait for it.
async fn await_answer<R, I>(read_line: R, interrupted: I) -> PatchResult<bool>
where
    R: FnOnce() -> std::io::Result<bool> + Send + 'static,
    I: Future<Output = ()>,
{
    let read_line = tokio::task::spawn_blocking(read_line);

    tokio::select! {
        answered = read_line => {
            let answered = answered
                .map_err(|e| PatchError::Internal(format!("stdin task: {e}")))??;
            Ok(answered)
        }
        () = interrupted => Ok(false),
    }
}

/// Wait for Ctrl-C. Never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
