//! Builds a job's network-namespace envelope on a dedicated OS thread, runs
//! the entry process inside it, and then keeps that same thread pinned to
//! host the job's [`dialer::DialerWorker`] for the rest of the job's life.
//!
//! On Linux a thread spawned from an already-`unshare`d thread inherits
//! *that* thread's namespace, not the namespace the process started in. The
//! veth pair's host-side end and the route pointing at it must instead be
//! created from a thread that has never touched netns. [`BackgroundNetns`]
//! is spawned before this thread unshares, for exactly that purpose, and is
//! kept alive for the job's whole life since the final teardown needs the
//! same guarantee.
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use envdeploy_core::net as core_net;
use nix::sched::{unshare, CloneFlags};
use nix::unistd::gettid;

use crate::dialer::DialerWorker;
use crate::job::Job;
use crate::shim;

/// Everything needed to launch a job's entry process, already resolved by
/// the caller (deployable lookup, job-id templating, launch-script parsing)
pub struct EntrySpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub dir: PathBuf,
}

/// Spawns the pinned thread for `job`
///
/// Returns immediately. The second half of the tuple fires exactly once,
/// as soon as the entry process has exited (or the envelope failed to
/// build) -- that is the signal `Start` waits on, matching the reference
/// implementation's `donech`. It fires well before the returned
/// `JoinHandle` completes: the pinned thread goes on to serve the job's
/// dialer and only exits once the supervisor calls `Dialer::quit`.
pub fn spawn(
    job: Arc<Job>,
    entry: EntrySpec,
    worker: DialerWorker,
) -> (JoinHandle<()>, mpsc::Receiver<()>) {
    let (done_tx, done_rx) = mpsc::sync_channel(1);
    let handle = std::thread::Builder::new()
        .name(format!("job-{}", job.id))
        .spawn(move || run(job, entry, worker, done_tx))
        .expect("failed to spawn job thread");
    (handle, done_rx)
}

fn run(job: Arc<Job>, entry: EntrySpec, worker: DialerWorker, done_tx: mpsc::SyncSender<()>) {
    let Some(mut stderr) = job.stderr_handle() else {
        let _ = done_tx.send(());
        return;
    };

    let bg = BackgroundNetns::spawn();

    let host_if = match build_and_launch(&job, &entry, &mut stderr, &bg) {
        Ok((mut child, host_if)) => {
            match child.wait() {
                Ok(status) => {
                    let _ = writeln!(stderr, "envdeploy: entry process exited: {status}");
                }
                Err(e) => {
                    let _ = writeln!(stderr, "envdeploy: wait on entry process: {e}");
                }
            }
            let _ = done_tx.send(());
            Some(host_if)
        }
        Err(e) => {
            let _ = writeln!(stderr, "envdeploy: {e}");
            let _ = done_tx.send(());
            None
        }
    };

    job.close_stderr();

    trace!("job {}: entering pinned dialer serve loop", job.id);
    worker.serve();

    // Reclaim the host-side interface only once the dialer has been told
    // to quit, matching the reference implementation's teardown order.
    if let Some(host_if) = host_if {
        bg.run(move || core_net::delete_link(&host_if));
    }
    bg.shutdown();
}

fn build_and_launch(
    job: &Job,
    entry: &EntrySpec,
    stderr: &mut std::fs::File,
    bg: &BackgroundNetns,
) -> anyhow::Result<(std::process::Child, String)> {
    unshare(CloneFlags::CLONE_NEWNET).context("unshare(CLONE_NEWNET)")?;

    let tid = gettid();
    let (host_if, host_addr, guest_addr) = core_net::alloc_host_endpoint();

    // Best-effort: reclaim a stale interface left behind by a previous run
    // before creating ours under the same name (see DESIGN.md, "startup
    // veth leak").
    bg.run({
        let host_if = host_if.clone();
        move || core_net::delete_link(&host_if)
    });

    bg.run({
        let host_if = host_if.clone();
        move || core_net::VethPair::create(&host_if, "eth1", tid).map(|_| ())
    })
    .context("failed to create veth interface pair")?;

    bg.run({
        let host_if = host_if.clone();
        move || -> anyhow::Result<()> {
            core_net::link_up(&host_if)?;
            core_net::addr_add(&host_if, host_addr)?;
            Ok(())
        }
    })
    .context("could not set up host veth interface")?;

    // From here on we run inside the job's own namespace: `eth1` arrived
    // named for the parent's view of the interface and must be renamed
    // before anything inside the namespace can refer to it as `eth0`.
    core_net::rename_link("eth1", "eth0").context("renaming guest veth end")?;
    core_net::link_up("lo").context("bringing up lo")?;
    core_net::link_up("eth0").context("bringing up eth0")?;
    core_net::addr_add("eth0", guest_addr).context("assigning guest address")?;
    core_net::route_add_dev(host_addr, "eth0").context("adding host-scoped route")?;
    core_net::route_add_default(host_addr).context("adding default route")?;

    let resolved = shim::lookup_path(&entry.program)
        .with_context(|| format!("resolving {}", entry.program))?;

    let child = shim::spawn(
        resolved.to_str().context("program path is not valid UTF-8")?,
        &entry.args,
        &entry.env,
        &entry.dir,
        &job.cgroup.get_path(),
        stderr.try_clone().context("duplicating stderr handle")?,
    )
    .context("starting process failed")?;

    Ok((child, host_if))
}

/// A long-lived worker thread that has never called `unshare(CLONE_NEWNET)`,
/// used to perform netlink operations that must be seen from the host
/// namespace even while the job thread that asked for them has already
/// moved itself into the job's namespace.
struct BackgroundNetns {
    tx: mpsc::Sender<Box<dyn FnOnce() + Send>>,
    handle: JoinHandle<()>,
}

impl BackgroundNetns {
    /// Spawns the helper. Must be called from a thread that has not yet
    /// unshared its network namespace -- the helper inherits whatever
    /// namespace its creator is in at the moment of spawning.
    fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
        let handle = std::thread::Builder::new()
            .name("envdeploy-bgns".into())
            .spawn(move || {
                for task in rx {
                    task();
                }
            })
            .expect("failed to spawn background-namespace helper thread");
        Self { tx, handle }
    }

    /// Runs `f` on the helper thread and blocks until it completes
    fn run<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::sync_channel(1);
        let task: Box<dyn FnOnce() + Send> = Box::new(move || {
            let _ = result_tx.send(f());
        });
        self.tx
            .send(task)
            .expect("background-namespace helper exited unexpectedly");
        result_rx
            .recv()
            .expect("background-namespace helper dropped its result")
    }

    fn shutdown(self) {
        drop(self.tx);
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn background_helper_runs_closures_and_returns_their_value() {
        let bg = BackgroundNetns::spawn();
        assert_eq!(bg.run(|| 2 + 2), 4);
        bg.shutdown();
    }

    #[test]
    fn background_helper_shutdown_joins_cleanly() {
        let ran = Arc::new(AtomicBool::new(false));
        let bg = BackgroundNetns::spawn();
        let ran2 = ran.clone();
        bg.run(move || ran2.store(true, Ordering::SeqCst));
        bg.shutdown();
        assert!(ran.load(Ordering::SeqCst));
    }
}
