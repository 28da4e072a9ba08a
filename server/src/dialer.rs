//! The pinned dialer: a worker bound for its whole life to a single OS
//! thread (and therefore to a single network namespace), through which all
//! outbound connections into a job are made.
//!
//! The thread is not spun up by this module -- it is the very same thread
//! that built the job's network-namespace envelope and launched the entry
//! process (see `envelope::build_and_run`), so that the namespace binding
//! established by `unshare(2)` is never handed to a second thread.
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("the persistent connection closed")]
    Closed,
    #[error("dial failed: {0}")]
    Io(#[from] io::Error),
}

struct DialRequest {
    address: String,
    resch: mpsc::SyncSender<Result<TcpStream, DialError>>,
}

enum Msg {
    Dial(DialRequest),
    Quit,
}

struct Shared {
    closed: AtomicBool,
    ready: Mutex<bool>,
    ready_cv: Condvar,
}

/// Handle used by any caller (typically the gateway's HTTP transport) to
/// reach into a job's network namespace
#[derive(Clone)]
pub struct Dialer {
    reqch: mpsc::SyncSender<Msg>,
    shared: Arc<Shared>,
}

/// Owned by the pinned thread; drives the serving loop and eventually
/// tears the dialer down
pub struct DialerWorker {
    reqch: mpsc::Receiver<Msg>,
    shared: Arc<Shared>,
}

/// Creates a pinned dialer pair: the `Dialer` handle is cloned freely and
/// handed to any caller, while the `DialerWorker` must stay on the pinned
/// thread and is consumed by `DialerWorker::serve`.
///
/// The request channel is a bounded rendezvous channel of capacity 0: a
/// caller's `dial` blocks until the pinned worker has accepted the request,
/// matching the unbuffered channel used for the same purpose in the
/// original implementation.
pub fn create() -> (Dialer, DialerWorker) {
    let (reqch_tx, reqch_rx) = mpsc::sync_channel(0);
    let shared = Arc::new(Shared {
        closed: AtomicBool::new(false),
        ready: Mutex::new(false),
        ready_cv: Condvar::new(),
    });
    (
        Dialer {
            reqch: reqch_tx,
            shared: shared.clone(),
        },
        DialerWorker {
            reqch: reqch_rx,
            shared,
        },
    )
}

impl Dialer {
    /// Dials `address` from inside the job's network namespace
    ///
    /// Blocks the calling thread until the pinned worker has completed the
    /// connect call (or the dialer has quit). Callers on an async runtime
    /// must wrap this in `spawn_blocking`.
    pub fn dial(&self, address: &str) -> Result<TcpStream, DialError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(DialError::Closed);
        }

        let (resp_tx, resp_rx) = mpsc::sync_channel(1);
        let req = DialRequest {
            address: address.to_string(),
            resch: resp_tx,
        };

        if self.reqch.send(Msg::Dial(req)).is_err() {
            return Err(DialError::Closed);
        }

        resp_rx.recv().unwrap_or(Err(DialError::Closed))
    }

    /// Signals the pinned worker to stop serving
    ///
    /// Requests already accepted by the worker (i.e. already past the
    /// rendezvous) complete normally; every `dial` call made after this
    /// returns fails deterministically and without blocking.
    pub fn quit(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        // Best-effort: the worker may already be gone, or blocked waiting
        // for a request -- either way, a failed send here is harmless.
        let _ = self.reqch.send(Msg::Quit);
    }

    /// Blocks until the pinned worker has entered its serving loop (or has
    /// already quit)
    pub fn wait_ready(&self) {
        let mut ready = self.shared.ready.lock().unwrap();
        while !*ready && !self.shared.closed.load(Ordering::SeqCst) {
            ready = self.shared.ready_cv.wait(ready).unwrap();
        }
    }
}

impl DialerWorker {
    /// Runs the serving loop on the calling (pinned) thread until `Quit` is
    /// received
    pub fn serve(self) {
        {
            let mut ready = self.shared.ready.lock().unwrap();
            *ready = true;
            self.shared.ready_cv.notify_all();
        }

        trace!("pinned dialer entering serve loop");
        for msg in self.reqch.iter() {
            match msg {
                Msg::Dial(req) => {
                    let result = TcpStream::connect(&req.address).map_err(DialError::from);
                    let _ = req.resch.send(result);
                }
                Msg::Quit => break,
            }
        }
        trace!("pinned dialer loop exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn dial_after_quit_returns_closed_without_worker() {
        let (dialer, worker) = create();
        thread::spawn(move || worker.serve());
        dialer.wait_ready();
        dialer.quit();
        // Give the worker a moment to process the Quit message.
        thread::sleep(std::time::Duration::from_millis(50));
        match dialer.dial("127.0.0.1:1") {
            Err(DialError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn wait_ready_returns_once_worker_enters_loop() {
        let (dialer, worker) = create();
        let handle = thread::spawn(move || worker.serve());
        dialer.wait_ready();
        dialer.quit();
        handle.join().unwrap();
    }
}
