use crossbeam_channel::{unbounded, Receiver, Sender};
use ion::logging::{self as logging, Logger};
use std::sync::Arc;
use std::thread;

/// Unit of work drained by the crypto pool. Each gateway implements this
/// once and resubmits its own handle when more items are queued; the
/// single-flight flag guarantees a given task is never in the pool twice.
pub trait PoolTask: Send + Sync {
    fn run_once(self: Arc<Self>);
}

/// Handle to the worker pool shared by every port's crypto stages. Cloning
/// is cheap; the workers exit once every handle is gone.
#[derive(Clone)]
pub struct CryptoPool {
    submit: Sender<Arc<dyn PoolTask>>,
}

impl CryptoPool {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(threads: usize, log: L) -> CryptoPool {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => Logger::root(logging::Discard, logging::o!()),
        };

        let threads = threads.max(1);
        let (submit, tasks): (Sender<Arc<dyn PoolTask>>, Receiver<Arc<dyn PoolTask>>) = unbounded();

        for index in 0..threads {
            let tasks = tasks.clone();
            let builder = thread::Builder::new().name(format!("crypto-{}", index));
            let worker = builder
                .spawn(move || {
                    for task in tasks {
                        task.run_once();
                    }
                })
                .expect("Failed to spawn crypto pool worker");

            // Workers are detached; they exit once every pool handle is gone
            drop(worker);
        }

        logging::debug!(log, "crypto pool started"; "threads" => threads);

        CryptoPool { submit }
    }

    /// Pool sized to the host.
    #[inline]
    pub fn with_default_size<'a, L: Into<Option<&'a Logger>>>(log: L) -> CryptoPool {
        Self::new(num_cpus::get(), log)
    }

    /// Schedules one task. Submissions after the workers have shut down are
    /// dropped; the owning port is being torn down in that case and the
    /// results would be discarded anyway.
    #[inline]
    pub fn submit(&self, task: Arc<dyn PoolTask>) {
        drop(self.submit.send(task));
    }
}
