use crossbeam_channel::{unbounded, Receiver, Sender};
use ion::shared::NetworkResult;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// Single-flight FIFO feeding one pipeline stage. Producers publish items
/// under the mutex and claim the flag on its 0 -> 1 transition; the worker
/// re-checks the FIFO under the same mutex before releasing the flag, so a
/// wakeup can never be lost and at most one worker advances the stage at
/// any instant.
pub struct Lane<T> {
    fifo: Mutex<VecDeque<T>>,
    active: AtomicBool,
}

impl<T> Lane<T> {
    #[inline]
    pub fn new() -> Lane<T> {
        Lane {
            fifo: Mutex::new(VecDeque::new()),
            active: AtomicBool::new(false),
        }
    }

    /// Appends an item. Returns true exactly when the caller claimed the
    /// single-flight flag and must schedule the stage's worker.
    #[inline]
    pub fn offer(&self, item: T) -> bool {
        let mut fifo = self.fifo.lock();
        fifo.push_back(item);
        !self.active.swap(true, Ordering::AcqRel)
    }

    /// Pops the head item, if any.
    #[inline]
    pub fn take(&self) -> Option<T> {
        self.fifo.lock().pop_front()
    }

    /// Puts a partially consumed item back at the head.
    #[inline]
    pub fn restore(&self, item: T) {
        self.fifo.lock().push_front(item)
    }

    /// Worker epilogue: keeps the flag claimed and returns true when more
    /// work is queued, otherwise releases the flag.
    #[inline]
    pub fn settle(&self) -> bool {
        let fifo = self.fifo.lock();
        if fifo.is_empty() {
            self.active.store(false, Ordering::Release);
            false
        } else {
            true
        }
    }

    /// Releases the flag with items retained. Used when the head cannot
    /// make progress (zero-byte socket write); `kick` re-claims the flag
    /// once the port is serviced again.
    #[inline]
    pub fn park(&self) {
        let _fifo = self.fifo.lock();
        self.active.store(false, Ordering::Release);
    }

    /// Claims the flag when work is queued. Returns true when the caller
    /// must schedule the worker.
    #[inline]
    pub fn kick(&self) -> bool {
        let fifo = self.fifo.lock();
        if fifo.is_empty() {
            false
        } else {
            !self.active.swap(true, Ordering::AcqRel)
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fifo.lock().is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fifo.lock().len()
    }

    /// Drains every queued item through `f`. Teardown path.
    pub fn drain_with<F: FnMut(T)>(&self, mut f: F) {
        let items: Vec<T> = self.fifo.lock().drain(..).collect();
        for item in items {
            f(item);
        }
    }
}

/// Per-gateway completion queue. Workers push one result per drained item;
/// the I/O thread polls it on each service pass, consuming errors and
/// leaving the success values to whoever is counting.
pub struct Completions<T> {
    tx: Sender<NetworkResult<T>>,
    rx: Receiver<NetworkResult<T>>,
}

impl<T> Completions<T> {
    #[inline]
    pub fn new() -> Completions<T> {
        let (tx, rx) = unbounded();
        Completions { tx, rx }
    }

    #[inline]
    pub fn push(&self, result: NetworkResult<T>) {
        drop(self.tx.send(result));
    }

    #[inline]
    pub fn poll(&self) -> Option<NetworkResult<T>> {
        self.rx.try_recv().ok()
    }
}
