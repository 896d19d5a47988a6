//! On-disk task records.
//!
//! One directory per task id under the store root:
//!
//! ```text
//! <root>/<id>/script      script body (script.bat on windows)
//! <root>/<id>/args
//! <root>/<id>/account
//! <root>/<id>/timeout
//! <root>/<id>/.write      zero-byte marker, metadata is cached
//! <root>/<id>/stdout
//! <root>/<id>/stderr
//! <root>/<id>/<clock>.done  terminal status of that clock
//! ```
//!
//! Every write replaces the whole file through a synced temporary file and a
//! rename, so readers never see a partially written file. Reads are
//! best-effort: failures are logged and yield empty content.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::models::{Clock, CoreError, CoreErrorKind, TaskId, TaskMeta};
use crate::persistence::{
    ACCOUNT_FILE, ARGS_FILE, PersistenceResult, SCRIPT_FILE, STDERR_FILE, STDOUT_FILE,
    TIMEOUT_FILE, WRITE_MARKER_FILE,
};

/// Result of a finished clock as read back from disk.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StoredResult {
    pub status: String,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn task_dir(&self, id: TaskId) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn script_path(&self, id: TaskId) -> PathBuf {
        self.task_dir(id).join(SCRIPT_FILE)
    }

    pub fn done_path(&self, id: TaskId, clock: Clock) -> PathBuf {
        self.task_dir(id).join(format!("{clock}.done"))
    }

    pub fn ensure_dir(&self, id: TaskId) -> PersistenceResult<PathBuf> {
        let dir = self.task_dir(id);
        fs::create_dir_all(&dir).map_err(|error| {
            tracing::error!(task_id = id.0, path = %dir.display(), %error, "failed to create task directory");
            storage_failure(id, format!("failed to create {}: {error}", dir.display()))
        })?;
        Ok(dir)
    }

    pub fn metadata_cached(&self, id: TaskId) -> bool {
        self.task_dir(id).join(WRITE_MARKER_FILE).exists()
    }

    /// Persists script, args, account and timeout, then the write marker. The
    /// marker goes last so a crash part way through leaves the metadata
    /// uncached.
    pub fn save_meta(&self, id: TaskId, meta: &TaskMeta) -> PersistenceResult<()> {
        let dir = self.ensure_dir(id)?;

        write_task_file(id, &dir.join(SCRIPT_FILE), meta.script.as_bytes())?;
        #[cfg(unix)]
        make_executable(id, &dir.join(SCRIPT_FILE))?;
        write_task_file(id, &dir.join(ARGS_FILE), meta.args.as_bytes())?;
        write_task_file(id, &dir.join(ACCOUNT_FILE), meta.account.as_bytes())?;
        write_task_file(
            id,
            &dir.join(TIMEOUT_FILE),
            meta.timeout_secs.to_string().as_bytes(),
        )?;
        write_task_file(id, &dir.join(WRITE_MARKER_FILE), b"")?;

        Ok(())
    }

    /// Reads the cached metadata. A missing or unreadable timeout reads as 0.
    pub fn load_meta(&self, id: TaskId) -> TaskMeta {
        let dir = self.task_dir(id);
        let timeout_text = read_trimmed(id, &dir.join(TIMEOUT_FILE));
        let timeout_secs = timeout_text.parse::<u64>().unwrap_or_else(|_| {
            tracing::warn!(task_id = id.0, value = %timeout_text, "unusable cached timeout");
            0
        });

        TaskMeta {
            script: read_text(id, &dir.join(SCRIPT_FILE)),
            args: read_trimmed(id, &dir.join(ARGS_FILE)),
            account: read_trimmed(id, &dir.join(ACCOUNT_FILE)),
            timeout_secs,
        }
    }

    pub fn done_before(&self, id: TaskId, clock: Clock) -> bool {
        self.done_path(id, clock).exists()
    }

    /// Writes both streams and then the clock marker carrying the status.
    /// Returns once all three files are durable.
    pub fn save_result(
        &self,
        id: TaskId,
        clock: Clock,
        status: &str,
        stdout: &[u8],
        stderr: &[u8],
    ) -> PersistenceResult<()> {
        let dir = self.ensure_dir(id)?;

        write_task_file(id, &dir.join(STDOUT_FILE), stdout)?;
        write_task_file(id, &dir.join(STDERR_FILE), stderr)?;
        write_task_file(id, &self.done_path(id, clock), status.as_bytes())?;

        Ok(())
    }

    pub fn load_result(&self, id: TaskId, clock: Clock) -> StoredResult {
        let dir = self.task_dir(id);
        StoredResult {
            status: read_trimmed(id, &self.done_path(id, clock)),
            stdout: read_bytes(id, &dir.join(STDOUT_FILE)),
            stderr: read_bytes(id, &dir.join(STDERR_FILE)),
        }
    }
}

fn write_task_file(id: TaskId, path: &Path, contents: &[u8]) -> PersistenceResult<()> {
    write_atomic(path, contents).map_err(|error| {
        tracing::error!(task_id = id.0, path = %path.display(), %error, "failed to write task file");
        storage_failure(id, format!("failed to write {}: {error}", path.display()))
    })
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let temp_path = dir.join(format!(".{}.tmp", file_name.to_string_lossy()));

    let mut temp = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)?;
    temp.write_all(contents)?;
    temp.sync_all()?;
    drop(temp);

    fs::rename(&temp_path, path)?;

    #[cfg(unix)]
    fs::File::open(dir)?.sync_all()?;

    Ok(())
}

#[cfg(unix)]
fn make_executable(id: TaskId, path: &Path) -> PersistenceResult<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|error| {
        tracing::error!(task_id = id.0, path = %path.display(), %error, "failed to mark script executable");
        storage_failure(id, format!("failed to chmod {}: {error}", path.display()))
    })
}

fn read_bytes(id: TaskId, path: &Path) -> Vec<u8> {
    match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::warn!(task_id = id.0, path = %path.display(), %error, "failed to read task file");
            Vec::new()
        }
    }
}

fn read_text(id: TaskId, path: &Path) -> String {
    String::from_utf8_lossy(&read_bytes(id, path)).into_owned()
}

fn read_trimmed(id: TaskId, path: &Path) -> String {
    read_text(id, path).trim().to_string()
}

fn storage_failure(id: TaskId, message: String) -> CoreError {
    CoreError::for_task(id, CoreErrorKind::StorageFailure, message)
}
