use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use bootimg::{CommandExecutor, SystemExecutor};
use clap::{Parser, Subcommand};
use imgpatch::{ConsoleOperator, Outcome, PatchArgs, PatchConfig, PatchResult};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "imgpatch", version)]
struct Cli {
    #[command(flatten)]
    args: PatchArgs,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List the release images found in the image directory
    List,
    /// Copy the configuration document out of the first image for editing
    FetchConfig {
        /// Replace an existing local copy
        #[arg(long)]
        force: bool,
    },
    /// Push the local configuration document into every image (default)
    Update {
        /// Do not ask for confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if nix::unistd::getuid().is_root() {
        eprintln!("error: imgpatch must not be run as root (it calls sudo internally as needed)");
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();

    let result = match imgpatch::block_on(run(cli)) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("error: cannot start the async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(outcome) => ExitCode::from(outcome.exit_status()),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(imgpatch::error_exit_status(&e))
        }
    }
}

async fn run(cli: Cli) -> PatchResult<Outcome> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let cwd = std::env::current_dir()?;
    let config = PatchConfig::resolve(cli.args, home.as_deref(), &cwd)?;
    let executor: Arc<dyn CommandExecutor> = Arc::new(SystemExecutor);

    let command = cli.command.unwrap_or(Command::Update { yes: false });
    if config.check_prerequisites && !matches!(command, Command::List) {
        bootimg::check_prerequisites(executor.as_ref()).await?;
    }

    match command {
        Command::List => {
            imgpatch::run_list(&config, executor, &ConsoleOperator::new(true)).await
        }
        Command::FetchConfig { force } => {
            imgpatch::run_fetch(&config, executor, &ConsoleOperator::new(true), force).await
        }
        Command::Update { yes } => {
            imgpatch::run_update(&config, executor, &ConsoleOperator::new(yes)).await
        }
    }
}
