//! Orchestrates job creation, launch and teardown: the glue between the
//! registry, the envelope builder and the cgroup-population watch.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use envdeploy_core::cgroup::{self, CGroup};
use envdeploy_core::config::Deployable;
use envdeploy_core::users::User;
use thiserror::Error;

use crate::job::{CreateError, Job, Registry, RegistryError};
use crate::netns::{self, EntrySpec};

/// Fixed inner address every job's reverse-proxy target resolves to: the
/// loopback address is private to the job's own network namespace, so the
/// same address/port is reused by every job without colliding.
const ENTRY_ADDRESS: &str = "127.0.0.1:8000";

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("job ID '{0}' does not look like a valid identifier")]
    InvalidId(String),
    #[error("job with the ID already exists")]
    AlreadyExists,
    #[error(transparent)]
    Build(#[from] envdeploy_core::error::TypedError),
    #[error("job ID template error: {0}")]
    Template(anyhow::Error),
}

struct SupervisorInner {
    registry: Arc<Registry>,
    jobs_cgroup: CGroup,
    log_dir: PathBuf,
    base_path: String,
}

/// Owns the job registry and drives jobs through their lifecycle
///
/// Cheaply `Clone`: every clone shares the same underlying registry, so a
/// clone can be moved wholesale into `spawn_blocking` for the duration of
/// one `deploy()` call.
#[derive(Clone)]
pub struct Supervisor(Arc<SupervisorInner>);

impl Supervisor {
    pub fn new(jobs_cgroup: CGroup, log_dir: PathBuf, base_path: String) -> Self {
        Self(Arc::new(SupervisorInner {
            registry: Arc::new(Registry::new()),
            jobs_cgroup,
            log_dir,
            base_path,
        }))
    }

    pub fn registry(&self) -> &Registry {
        &self.0.registry
    }

    /// Creates a job for `deployable` owned by `owner`, launches its entry
    /// process, and blocks until that launch script has exited
    ///
    /// This is intentionally synchronous, mirroring the reference
    /// implementation: a deployable's launch script is expected to detach
    /// its actual workload (e.g. via `setsid`/`nohup`) and return quickly.
    /// Callers on an async runtime must run this inside `spawn_blocking`.
    pub fn deploy(&self, deployable: &Deployable, owner: User) -> Result<Arc<Job>, DeployError> {
        let id = envdeploy_core::config::render_job_id(&deployable.job_id_format, owner.as_str())
            .map_err(DeployError::Template)?;

        if !valid_job_id(&id) {
            return Err(DeployError::InvalidId(id));
        }

        let (job, worker) = self
            .0
            .registry
            .create(
                &id,
                owner,
                &self.0.jobs_cgroup,
                &self.0.log_dir,
                ENTRY_ADDRESS.to_string(),
            )
            .map_err(|e| match e {
                CreateError::AlreadyExists => DeployError::AlreadyExists,
                CreateError::Build(e) => DeployError::Build(e),
            })?;

        self.start(job.clone(), deployable, worker);
        Ok(job)
    }

    fn start(&self, job: Arc<Job>, deployable: &Deployable, worker: crate::dialer::DialerWorker) {
        {
            let mut state = job.state.write().unwrap();
            if state.started {
                log::warn!("attempt to start already-started job {}", job.id);
                return;
            }
            state.started = true;
            state.started_at = Some(SystemTime::now());
        }

        let parsed = shell_words::split(&deployable.launch_script).unwrap_or_else(|e| {
            log::warn!(
                "job {}: launch script is not valid shell-quoted text ({e}), using it verbatim",
                job.id
            );
            vec![deployable.launch_script.clone()]
        });
        let Some((program, args)) = parsed.split_first() else {
            log::warn!("job {}: empty launch script, nothing to run", job.id);
            return;
        };

        let env = vec![
            (
                "WEB_BASE_PATH".to_string(),
                format!("{}/enter/{}", self.0.base_path, job.id),
            ),
            ("JOB_OWNER".to_string(), job.owner.as_str().to_string()),
        ];

        let entry = EntrySpec {
            program: program.clone(),
            args: args.to_vec(),
            env,
            dir: PathBuf::from("/"),
        };

        let (_handle, done_rx) = netns::spawn(job.clone(), entry, worker);
        let _ = done_rx.recv();

        self.watch_for_finish(job);
    }

    fn watch_for_finish(&self, job: Arc<Job>) {
        let cgroup_path = job.cgroup.get_path();
        let rx = match cgroup::watch_until_unpopulated(&cgroup_path) {
            Ok(rx) => rx,
            Err(e) => {
                log::warn!("job {}: could not watch cgroup for completion: {e}", job.id);
                return;
            }
        };

        std::thread::Builder::new()
            .name(format!("job-{}-watch", job.id))
            .spawn(move || {
                let _ = rx.recv();

                {
                    let mut state = job.state.write().unwrap();
                    state.finished = true;
                    state.finished_at = Some(SystemTime::now());
                }

                job.dialer.quit();

                if let Err(e) = job.cgroup.rm() {
                    log::warn!("job {}: could not remove cgroup directory: {e}", job.id);
                }
            })
            .expect("failed to spawn cgroup watch thread");
    }

    /// Sends `signal` to the job's entry process
    ///
    /// Identifies the target by the lowest pid currently attached to the
    /// job's cgroup (recursively): a heuristic, not a guarantee, since
    /// nothing prevents a descendant from acquiring a lower pid after the
    /// entry process re-execs some of its own children. See
    /// DESIGN.md, "signal-delivery heuristic".
    pub fn send_signal(&self, job: &Job, signal: nix::sys::signal::Signal) -> anyhow::Result<()> {
        let pids = job.cgroup.get_pids_recursive()?;
        let target = *pids
            .first()
            .ok_or_else(|| anyhow::anyhow!("no processes currently running in job's cgroup"))?;
        nix::sys::signal::kill(target, signal)?;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<(), RegistryError> {
        self.0.registry.remove(id)
    }
}

/// The job id appears verbatim in proxy and static-file paths, so it is
/// restricted to the same character class the reference implementation's
/// routing regex requires.
fn valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_job_id_accepts_lowercase_alnum_and_dash() {
        assert!(valid_job_id("alice-ab12"));
        assert!(!valid_job_id(""));
        assert!(!valid_job_id("Alice"));
        assert!(!valid_job_id("has space"));
    }
}
