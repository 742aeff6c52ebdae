//! The single subprocess primitive every VCS adapter operation is built on:
//! build an argument vector, run it in a working directory with a bounded
//! timeout, and capture its output. See design note "Subprocess
//! orchestration" — every adapter operation composes "build argv", "exec in
//! directory with env", "parse output" on top of [`run`].

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::error::{subprocess_failure, CoreError};

/// Local, filesystem-only operations never cross the network and are given
/// generous headroom rather than being left unbounded, so a wedged `git`
/// process can't hang a request forever.
pub const LOCAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Network operations (fetch, pull, push, ls-remote, hosting CLI calls).
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(60);
/// Rebase/merge can both touch the network (for the parent fetch) and run
/// arbitrarily long merge drivers.
pub const REBASE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct CapturedOutput {
    pub status_success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `program` with `args` in `dir`, waiting at most `timeout`.
///
/// Arguments are passed positionally via [`Command::args`] — never shell-
/// interpolated — so a branch name containing shell metacharacters can never
/// escape into a second command.
pub fn run(
    program: &str,
    args: &[&str],
    dir: &Path,
    timeout: Duration,
) -> Result<CapturedOutput, CoreError> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            CoreError::internal(format!("failed to spawn `{program} {}`: {e}", args.join(" ")))
        })?;

    let status = match child
        .wait_timeout(timeout)
        .map_err(|e| CoreError::internal(format!("failed waiting on `{program}`: {e}")))?
    {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(subprocess_failure(
                &format!("{program} {}", args.join(" ")),
                &format!("timed out after {:?}", timeout),
            ));
        }
    };

    let output = child
        .wait_with_output()
        .map_err(|e| CoreError::internal(format!("failed reading `{program}` output: {e}")))?;

    Ok(CapturedOutput {
        status_success: status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Runs a git subcommand and returns its stdout, treating a non-zero exit as
/// a recoverable [`CoreError`] rather than panicking — §4.1's failure
/// semantics.
pub fn run_git(dir: &Path, args: &[&str], timeout: Duration) -> Result<String, CoreError> {
    let out = run("git", args, dir, timeout)?;
    if !out.status_success {
        return Err(subprocess_failure(&format!("git {}", args.join(" ")), &out.stderr));
    }
    Ok(out.stdout)
}

/// Like [`run_git`] but returns the captured output regardless of exit code,
/// for callers that need to branch on failure text themselves (e.g. "pull"
/// distinguishing a clean fast-forward from diverged history).
pub fn run_git_lenient(dir: &Path, args: &[&str], timeout: Duration) -> Result<CapturedOutput, CoreError> {
    run("git", args, dir, timeout)
}

pub fn run_gh(dir: &Path, args: &[&str], timeout: Duration) -> Result<String, CoreError> {
    let out = run("gh", args, dir, timeout)?;
    if !out.status_success {
        return Err(subprocess_failure(&format!("gh {}", args.join(" ")), &out.stderr));
    }
    Ok(out.stdout)
}
