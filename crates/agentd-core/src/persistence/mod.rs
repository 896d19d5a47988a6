pub mod fs_store;

pub use fs_store::{StoredResult, TaskStore};

use crate::models::CoreError;

pub type PersistenceResult<T> = Result<T, CoreError>;

pub const ARGS_FILE: &str = "args";
pub const ACCOUNT_FILE: &str = "account";
pub const TIMEOUT_FILE: &str = "timeout";
pub const WRITE_MARKER_FILE: &str = ".write";
pub const STDOUT_FILE: &str = "stdout";
pub const STDERR_FILE: &str = "stderr";

#[cfg(unix)]
pub const SCRIPT_FILE: &str = "script";
#[cfg(windows)]
pub const SCRIPT_FILE: &str = "script.bat";
