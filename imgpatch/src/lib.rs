mod config;
mod driver;
mod error;
mod lock;
mod operator;

pub use config::{PatchArgs, PatchConfig};
pub use driver::{Outcome, error_exit_status, run_fetch, run_list, run_update};
pub use error::{PatchError, PatchResult};
pub use operator::{ConsoleOperator, Operator, block_on};
