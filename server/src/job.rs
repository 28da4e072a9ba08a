//! Per-job state and the concurrent job registry
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use envdeploy_core::cgroup::CGroup;
use envdeploy_core::error::{ResultExt, SystemError, TypedResult};
use envdeploy_core::users::User;
use thiserror::Error;

use crate::dialer::{self, Dialer, DialerWorker};

/// Lifecycle flags and timestamps, guarded together by one lock
///
/// Readers (the job-list view) take this in read mode; only the supervisor
/// ever takes it in write mode.
#[derive(Debug, Default)]
pub struct JobState {
    pub started: bool,
    pub started_at: Option<SystemTime>,
    pub finished: bool,
    pub finished_at: Option<SystemTime>,
}

/// One live instance of a deployable, with its isolation envelope
pub struct Job {
    pub id: String,
    pub owner: User,
    pub cgroup: CGroup,
    pub stderr_path: PathBuf,
    stderr_file: Mutex<Option<File>>,
    pub dialer: Dialer,
    /// Fixed inner target the gateway proxies to, e.g. `127.0.0.1:8000`
    pub proxy_target: String,
    pub state: RwLock<JobState>,
}

impl Job {
    /// Allocates the per-job cgroup, stderr log file and pinned dialer
    ///
    /// Returns the constructed `Job` together with the `DialerWorker` that
    /// must be handed off to the envelope-building thread -- the worker is
    /// not `Send`-stored anywhere else because it must run on exactly one
    /// pinned OS thread for its entire life.
    fn new(
        id: &str,
        owner: User,
        jobs_cgroup: &CGroup,
        log_dir: &Path,
        proxy_target: String,
    ) -> TypedResult<(Self, DialerWorker)> {
        let cgroup = jobs_cgroup.new(id).typ(SystemError::Cgroup)?;

        fs::create_dir_all(log_dir).typ(SystemError::Cgroup)?;
        let stderr_path = log_dir.join(log_file_name(id));
        let stderr_file = File::create(&stderr_path).typ(SystemError::Cgroup)?;

        let (dialer, worker) = dialer::create();

        Ok((
            Self {
                id: id.to_string(),
                owner,
                cgroup,
                stderr_path,
                stderr_file: Mutex::new(Some(stderr_file)),
                dialer,
                proxy_target,
                state: RwLock::new(JobState::default()),
            },
            worker,
        ))
    }

    /// Returns a clone of the stderr file handle, for writing envelope
    /// errors or forwarding as the child's stdout/stderr
    pub fn stderr_handle(&self) -> Option<File> {
        self.stderr_file
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|f| f.try_clone().ok())
    }

    /// Closes the owning stderr file handle
    ///
    /// The file itself is left on disk and remains readable; only our
    /// write handle (invariant 5 in the spec) is released.
    pub fn close_stderr(&self) {
        *self.stderr_file.lock().unwrap() = None;
    }

    pub fn is_started(&self) -> bool {
        self.state.read().unwrap().started
    }

    pub fn is_finished(&self) -> bool {
        self.state.read().unwrap().finished
    }
}

fn log_file_name(id: &str) -> String {
    // YYMMDD-HHMMSS, sub-second precision intentionally not required (see
    // DESIGN.md, "log filename timestamp").
    let now = humantime_like_stamp();
    format!("{now}_{id}")
}

/// Formats the current wall-clock time as `YYMMDD-HHMMSS` without pulling
/// in a date/time crate, since this is the only place one would be needed
fn humantime_like_stamp() -> String {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    civil_from_unix(secs as i64)
}

/// Converts a unix timestamp into a `YYMMDD-HHMMSS` civil-calendar string
/// (UTC), using Howard Hinnant's `civil_from_days` algorithm
fn civil_from_unix(timestamp: i64) -> String {
    let days = timestamp.div_euclid(86_400);
    let secs_of_day = timestamp.rem_euclid(86_400);
    let (h, m, s) = (secs_of_day / 3600, (secs_of_day / 60) % 60, secs_of_day % 60);

    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m_ = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m_ <= 2 { y + 1 } else { y };

    format!(
        "{:02}{:02}{:02}-{:02}{:02}{:02}",
        y.rem_euclid(100),
        m_,
        d,
        h,
        m,
        s
    )
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job with the ID already exists")]
    AlreadyExists,
    #[error("job ID not found")]
    NotFound,
    #[error("job not finished")]
    NotFinished,
}

/// Concurrent mapping from job id to job, with reader-preferring access
pub struct Registry {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `id` and constructs its `Job`
    ///
    /// The id is held for the entire construction, matching the behavior
    /// of the reference implementation: a second concurrent `create` with
    /// the same id cannot observe a half-built job. If construction fails
    /// the id is released and the registry is left unmodified.
    pub fn create(
        &self,
        id: &str,
        owner: User,
        jobs_cgroup: &CGroup,
        log_dir: &Path,
        proxy_target: String,
    ) -> Result<(Arc<Job>, DialerWorker), CreateError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(id) {
            return Err(CreateError::AlreadyExists);
        }

        let (job, worker) =
            Job::new(id, owner, jobs_cgroup, log_dir, proxy_target).map_err(CreateError::Build)?;
        let job = Arc::new(job);
        jobs.insert(id.to_string(), job.clone());
        Ok((job, worker))
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.read().unwrap().get(id).cloned()
    }

    /// Removes a finished job
    ///
    /// The finished-check and the map mutation happen under the same write
    /// lock, so a concurrent `create` of the same id never races with a
    /// `remove` that is still deciding whether the job qualifies.
    pub fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get(id).ok_or(RegistryError::NotFound)?;
        if !job.is_finished() {
            return Err(RegistryError::NotFinished);
        }
        jobs.remove(id);
        Ok(())
    }

    /// Returns a snapshot of all jobs currently in the registry, for the
    /// list view
    pub fn snapshot(&self) -> Vec<Arc<Job>> {
        self.jobs.read().unwrap().values().cloned().collect()
    }
}

#[derive(Debug, Error)]
pub enum CreateError {
    #[error("job with the ID already exists")]
    AlreadyExists,
    #[error(transparent)]
    Build(#[from] envdeploy_core::error::TypedError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_timestamp_round_trips_a_known_instant() {
        // 2024-01-02 03:04:05 UTC
        assert_eq!(civil_from_unix(1_704_164_645), "240102-030405");
    }
}
