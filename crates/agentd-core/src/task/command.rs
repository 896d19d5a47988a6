use std::path::PathBuf;

use crate::execution::LaunchRequest;
use crate::models::{CoreError, CoreErrorKind, CoreResult, TaskId, TaskMeta};
use crate::task_context::TaskContext;

/// Compatibility rewrite of the coordinator's argument string.
///
/// The whole string is wrapped in single quotes and every `,,` becomes
/// `' '`, so `a,,b c` turns into the two shell words `'a' 'b c'`. Nothing
/// else is escaped; an embedded single quote still breaks the quoting, exactly
/// as coordinators have always expected.
pub fn legacy_quote_args(args: &str) -> String {
    if args.is_empty() {
        return String::new();
    }
    format!("'{}'", args.replace(",,", "' '"))
}

pub(crate) fn launch_request(
    id: TaskId,
    context: &TaskContext,
    meta: &TaskMeta,
) -> CoreResult<LaunchRequest> {
    let script = std::path::absolute(context.store.script_path(id)).map_err(|error| {
        CoreError::for_task(
            id,
            CoreErrorKind::InvalidInput,
            format!("cannot resolve script path: {error}"),
        )
    })?;

    let quoted = legacy_quote_args(&meta.args);
    let line = if quoted.is_empty() {
        script.display().to_string()
    } else {
        format!("{} {}", script.display(), quoted)
    };

    Ok(shell_request(id, line, &meta.account).working_dir(work_dir(id, context)))
}

#[cfg(unix)]
fn shell_request(id: TaskId, line: String, account: &str) -> LaunchRequest {
    if needs_account_switch(account) {
        LaunchRequest::new(id, "su").args(["-c", line.as_str(), "-", account])
    } else {
        LaunchRequest::new(id, "sh").arg("-c").arg(line)
    }
}

#[cfg(windows)]
fn shell_request(id: TaskId, line: String, _account: &str) -> LaunchRequest {
    LaunchRequest::new(id, "cmd").arg("/C").arg(line)
}

/// Only a privileged agent can switch accounts; otherwise scripts run as the
/// agent's own user.
#[cfg(unix)]
fn needs_account_switch(account: &str) -> bool {
    !account.is_empty() && account != "root" && unsafe { libc::geteuid() } == 0
}

fn work_dir(id: TaskId, context: &TaskContext) -> PathBuf {
    if let Some(dir) = &context.settings.work_dir {
        return dir.clone();
    }

    #[cfg(unix)]
    let home = std::env::var_os("HOME");
    #[cfg(windows)]
    let home = std::env::var_os("USERPROFILE");

    home.map(PathBuf::from)
        .filter(|dir| dir.is_dir())
        .unwrap_or_else(|| context.store.task_dir(id))
}

#[cfg(test)]
mod tests {
    use super::legacy_quote_args;

    #[test]
    fn empty_args_stay_empty() {
        assert_eq!(legacy_quote_args(""), "");
    }

    #[test]
    fn single_value_is_quoted_as_one_word() {
        assert_eq!(legacy_quote_args("--name web 01"), "'--name web 01'");
    }

    #[test]
    fn double_comma_splits_into_separate_words() {
        assert_eq!(legacy_quote_args("a,,b c,,d"), "'a' 'b c' 'd'");
    }

    #[test]
    fn single_comma_is_left_alone() {
        assert_eq!(legacy_quote_args("x,y"), "'x,y'");
    }

    #[test]
    fn triple_comma_rewrites_first_pair_only() {
        assert_eq!(legacy_quote_args("a,,,b"), "'a' ',b'");
    }
}
