//! Tera template loading, with the `sh` and `link` helper functions the
//! reference implementation's deployable-authored templates rely on
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::RwLock;

use anyhow::Context;
use tera::{Tera, Value};

/// Owns the live `Tera` instance, optionally reloading it from disk on
/// every render (debug mode), matching `tmpl()` in the reference
/// implementation
pub struct Templates {
    dir: PathBuf,
    base_path: String,
    debug: bool,
    inner: RwLock<Tera>,
}

impl Templates {
    pub fn load(dir: PathBuf, base_path: String, debug: bool) -> anyhow::Result<Self> {
        let tera = build(&dir, &base_path)?;
        Ok(Self {
            dir,
            base_path,
            debug,
            inner: RwLock::new(tera),
        })
    }

    /// Renders `name` with `ctx`, reloading the template set from disk
    /// first if running in debug mode
    pub fn render(&self, name: &str, ctx: &tera::Context) -> anyhow::Result<String> {
        if self.debug {
            match build(&self.dir, &self.base_path) {
                Ok(fresh) => *self.inner.write().unwrap() = fresh,
                Err(e) => log::warn!("error reading templates: {e}"),
            }
        }

        let tera = self.inner.read().unwrap();
        tera.render(name, ctx)
            .with_context(|| format!("executing template {name}"))
    }
}

fn build(dir: &std::path::Path, base_path: &str) -> anyhow::Result<Tera> {
    let glob = format!("{}/*", dir.display());
    let mut tera = Tera::new(&glob).with_context(|| format!("parsing templates under {}", dir.display()))?;

    let base_path = base_path.to_string();
    tera.register_function("link", move |args: &HashMap<String, Value>| {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| tera::Error::msg("link() requires a `path` argument"))?;
        Ok(Value::String(format!("{base_path}{path}")))
    });

    tera.register_function("sh", |args: &HashMap<String, Value>| {
        let cmd = args
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or_else(|| tera::Error::msg("sh() requires a `cmd` argument"))?;
        Ok(Value::String(run_shell(cmd)))
    });

    Ok(tera)
}

/// Runs `cmd` through `/bin/sh -c` and returns its stdout, or a short
/// human-readable error string in its place -- templates have no other way
/// to surface a failure, so one is rendered inline rather than aborting the
/// whole page
fn run_shell(cmd: &str) -> String {
    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .output();

    match output {
        Ok(out) => String::from_utf8_lossy(&out.stdout).into_owned(),
        Err(e) => format!("running '{cmd}' failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_shell_captures_stdout() {
        assert_eq!(run_shell("printf hi"), "hi");
    }

    #[test]
    fn run_shell_reports_spawn_failures_inline() {
        let out = run_shell("exit 1");
        assert_eq!(out, "");
    }
}
