//! The `--cgroup-exec` re-exec shim
//!
//! The supervisor never forks the entry process directly. Instead it
//! re-execs itself as `/proc/self/exe --cgroup-exec <cgroup-path> <program>
//! [args...]`, so that cgroup attachment and the final `execve` happen from
//! the child's own point of view: there is no window during which the
//! entry process runs outside its cgroup.
use std::ffi::CString;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use anyhow::Context;

pub const FLAG: &str = "--cgroup-exec";

/// Re-execs this binary with `--cgroup-exec`, handing off `program` to run
/// once attached to `cgroup_path`
///
/// `stderr` is duplicated onto both the child's stdout and stderr: nothing
/// a deployable writes to its own stdout is otherwise observable, matching
/// the reference implementation.
pub fn spawn(
    program: &str,
    args: &[String],
    env: &[(String, String)],
    dir: &Path,
    cgroup_path: &Path,
    stderr: std::fs::File,
) -> anyhow::Result<Child> {
    let exe = std::env::current_exe().context("resolving our own executable path")?;

    let mut cmd = Command::new(exe);
    cmd.arg(FLAG)
        .arg(cgroup_path)
        .arg(program)
        .args(args)
        .current_dir(dir)
        .env_clear()
        .envs(env.iter().cloned())
        .stdin(Stdio::null())
        .stdout(stderr.try_clone().context("duplicating stderr for stdout")?)
        .stderr(stderr);

    cmd.spawn().with_context(|| format!("spawning the cgroup-exec shim for {program}"))
}

/// Entry point taken when this binary is re-invoked as `--cgroup-exec
/// <cgroup-path> <program> [args...]`
///
/// Attaches the current process to `cgroup_path` and then `execve`s into
/// `program`, replacing this process image entirely. Only returns on error,
/// in which case the caller should exit nonzero.
pub fn exec_into_cgroup(cgroup_path: &Path, program: &str, args: &[String]) -> anyhow::Error {
    if let Err(e) = attach(cgroup_path) {
        return e.context(format!("failed to attach to cgroup {}", cgroup_path.display()));
    }

    let path = match CString::new(program) {
        Ok(p) => p,
        Err(e) => return anyhow::anyhow!("program path contains a NUL byte: {e}"),
    };
    let mut argv = vec![path.clone()];
    for a in args {
        match CString::new(a.as_str()) {
            Ok(c) => argv.push(c),
            Err(e) => return anyhow::anyhow!("argument contains a NUL byte: {e}"),
        }
    }

    let err = nix::unistd::execv(&path, &argv).unwrap_err();
    anyhow::anyhow!("failed to exec {program}: {err}")
}

fn attach(cgroup_path: &Path) -> anyhow::Result<()> {
    std::fs::write(cgroup_path.join("cgroup.procs"), "0\n")?;
    Ok(())
}

/// Resolves a bare command name against `$PATH`, mirroring Go's
/// `exec.LookPath`: a name containing a `/` is used as-is (after an
/// executable-bit check), otherwise each `$PATH` entry is tried in order.
pub fn lookup_path(cmd: &str) -> anyhow::Result<std::path::PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let is_executable = |p: &Path| {
        std::fs::metadata(p)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    };

    if cmd.contains('/') {
        let p = Path::new(cmd);
        return if is_executable(p) {
            Ok(p.to_path_buf())
        } else {
            anyhow::bail!("{cmd} is not an executable file")
        };
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(cmd);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }

    anyhow::bail!("{cmd}: not found in PATH")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_path_finds_a_well_known_binary() {
        let resolved = lookup_path("sh").expect("sh should be on PATH in any test environment");
        assert!(resolved.ends_with("sh"));
    }

    #[test]
    fn lookup_path_rejects_unknown_names() {
        assert!(lookup_path("envdeploy-definitely-not-a-real-binary").is_err());
    }
}
