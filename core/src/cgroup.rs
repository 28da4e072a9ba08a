//! Implementation of the Linux *cgroup v2* facility used to track jobs.
//!
//! A [`CGroup`] wraps the path of an existing cgroup directory. Interfacing
//! applications either create or import a cgroup, which is then used as the
//! root of a sub-tree of further cgroups (one per job). The tree is not
//! represented by a traditional tree data structure; it is "calculated" by
//! the path alone.
use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail};
use itertools::Itertools;
use nix::sys::statfs;
use nix::unistd::Pid;
use walkdir::WalkDir;

/// A single cgroup inside our tree of managed cgroups
#[derive(Debug, Clone)]
pub struct CGroup {
    path: PathBuf,
}

impl CGroup {
    /// Creates a new cgroup as the root of a sub-tree
    ///
    /// `path` must be the path of an already existing cgroup. Idempotent:
    /// if the directory already exists, it is imported rather than
    /// rejected.
    pub fn new_root<P: AsRef<Path>>(path: P, name: &str) -> anyhow::Result<Self> {
        trace!("create cgroup \"{name}\"");
        if !is_cgroup(path.as_ref())? {
            bail!("{} is not a valid cgroup", path.as_ref().display());
        }

        let path = PathBuf::from(path.as_ref()).join(name);
        if !path.exists() {
            fs::create_dir(&path)?;
        }

        Self::import_root(&path)
    }

    /// Imports an already existing cgroup as the root of a sub-tree
    pub fn import_root<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        trace!("import cgroup {}", path.as_ref().display());
        let path = PathBuf::from(path.as_ref());

        if !is_cgroup(&path)? {
            bail!("{} is not a valid cgroup", path.display());
        }

        Ok(CGroup { path })
    }

    /// Creates a sub-cgroup inside this one
    pub fn new(&self, name: &str) -> anyhow::Result<Self> {
        Self::new_root(&self.path, name)
    }

    /// Moves a process into this cgroup
    pub fn mv(&self, pid: Pid) -> anyhow::Result<()> {
        trace!("move {pid:?} to {}", self.get_path().display());
        fs::write(self.path.join("cgroup.procs"), format!("{pid}\n"))?;
        Ok(())
    }

    /// Returns all PIDs directly associated with this cgroup
    pub fn get_pids(&self) -> anyhow::Result<Vec<Pid>> {
        pids_in(&self.path.join("cgroup.procs"))
    }

    /// Returns all PIDs associated with this cgroup or any of its
    /// descendants, numerically sorted
    ///
    /// Used by the signal-delivery heuristic: the entry process is assumed
    /// to hold the smallest pid, but that is not guaranteed.
    pub fn get_pids_recursive(&self) -> anyhow::Result<Vec<Pid>> {
        let mut pids = Vec::new();
        for entry in WalkDir::new(&self.path)
            .into_iter()
            .flatten()
            .filter(|e| e.file_name() == "cgroup.procs")
        {
            pids.extend(pids_in(entry.path())?);
        }
        pids.sort();
        Ok(pids)
    }

    /// Checks whether this cgroup (or a descendant) is populated
    pub fn populated(&self) -> bool {
        is_populated(&self.path)
    }

    /// Returns the path of this cgroup
    pub fn get_path(&self) -> PathBuf {
        self.path.clone()
    }

    /// Returns the path of the `cgroup.events` pseudo-file, which may be
    /// watched for the `populated` transition
    pub fn get_events_path(&self) -> PathBuf {
        self.path.join("cgroup.events")
    }

    /// Removes this cgroup directory
    ///
    /// Best-effort: the caller is responsible for making sure the cgroup is
    /// unpopulated first, mirroring the supervisor's teardown order (the
    /// population watch fires before removal is attempted).
    pub fn rm(&self) -> anyhow::Result<()> {
        trace!("remove {}", self.get_path().display());

        // Delete from deepest to shallowest: a non-empty directory may not
        // be removed.
        for d in WalkDir::new(&self.path)
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_dir())
            .sorted_by(|a, b| a.depth().cmp(&b.depth()).reverse())
        {
            fs::remove_dir(d.path())?;
        }

        Ok(())
    }
}

fn pids_in(procs_file: &Path) -> anyhow::Result<Vec<Pid>> {
    let contents = match fs::read_to_string(procs_file) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    contents
        .lines()
        .map(|l| Ok(Pid::from_raw(l.trim().parse()?)))
        .collect()
}

/// Parses `cgroup.events` for the `populated` key
///
/// Returns `false` if the file has disappeared, since a vanished cgroup
/// cannot be populated.
pub fn is_populated<P: AsRef<Path>>(dir: P) -> bool {
    let events_fn = dir.as_ref().join("cgroup.events");
    let f = match fs::File::open(&events_fn) {
        Ok(f) => f,
        Err(_) => return false,
    };

    let reader = std::io::BufReader::new(f);
    for line in reader.lines().map_while(Result::ok) {
        if let Some(val) = line.strip_prefix("populated ") {
            return val.trim() != "0";
        }
    }
    false
}

/// A one-shot signal that fires once a cgroup's `populated` key transitions
/// to 0 (or the cgroup vanishes)
///
/// Edge-triggered on file modification, with a level re-check on every wake
/// -- including once before the first wait -- so that a transition which
/// happened between directory creation and watch registration is not
/// missed.
pub fn watch_until_unpopulated<P: AsRef<Path>>(
    dir: P,
) -> anyhow::Result<std::sync::mpsc::Receiver<()>> {
    use notify::{Event, RecursiveMode, Watcher};

    let dir = dir.as_ref().to_path_buf();
    let events_path = dir.join("cgroup.events");

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let (raw_tx, raw_rx) = std::sync::mpsc::channel::<notify::Result<Event>>();

    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = raw_tx.send(res);
    })?;
    // The file may already be gone by the time we get here; that is not an
    // error, it just means the cgroup is already unpopulated.
    let _ = watcher.watch(&events_path, RecursiveMode::NonRecursive);

    std::thread::Builder::new()
        .name("cgroup-watch".into())
        .spawn(move || {
            let _watcher = watcher; // keep alive for the lifetime of the thread
            loop {
                if !is_populated(&dir) {
                    let _ = done_tx.send(());
                    return;
                }
                match raw_rx.recv_timeout(Duration::from_secs(5)) {
                    Ok(Ok(_)) => continue,
                    Ok(Err(e)) => {
                        log::warn!("cgroup.events watch error for {}: {e}", dir.display());
                        continue;
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                        let _ = done_tx.send(());
                        return;
                    }
                }
            }
        })?;

    Ok(done_rx)
}

/// Returns the first cgroup2 mount point found on the host system
pub fn mount_point() -> anyhow::Result<PathBuf> {
    procfs::process::Process::myself()?
        .mountinfo()?
        .iter()
        .find(|m| m.fs_type.eq("cgroup2"))
        .ok_or_else(|| anyhow!("no cgroup2 mount found"))
        .map(|m| m.mount_point.clone())
}

/// Returns the path, relative to the cgroup2 mount, of the cgroup this
/// process currently belongs to, by parsing the unified-hierarchy (`0:`)
/// line of `/proc/self/cgroup`
pub fn current_cgroup() -> anyhow::Result<PathBuf> {
    let f = fs::File::open("/proc/self/cgroup")?;
    let reader = std::io::BufReader::new(f);

    for line in reader.lines() {
        let line = line?;
        if let Some(rest) = line.strip_prefix("0:") {
            let path = rest.splitn(2, ':').nth(1).ok_or_else(|| anyhow!("malformed /proc/self/cgroup entry"))?;
            return Ok(PathBuf::from(path.trim_start_matches('/')));
        }
    }

    bail!("no unified-hierarchy entry found in /proc/self/cgroup")
}

/// Checks whether `path` sits on a cgroup v2 mount by comparing the
/// filesystem magic returned by `statfs(2)`
pub fn is_cgroup(path: &Path) -> anyhow::Result<bool> {
    let st = statfs::statfs(path)?;
    Ok(st.filesystem_type() == statfs::CGROUP2_SUPER_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_populated_missing_file_is_false() {
        assert!(!is_populated("/nonexistent/path/for/envdeploy/tests"));
    }

    #[test]
    fn is_populated_parses_events_file() {
        let dir = tempfile_dir();
        fs::write(dir.join("cgroup.events"), "populated 1\nfrozen 0\n").unwrap();
        assert!(is_populated(&dir));

        fs::write(dir.join("cgroup.events"), "populated 0\nfrozen 0\n").unwrap();
        assert!(!is_populated(&dir));
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("envdeploy-cgroup-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }
}
