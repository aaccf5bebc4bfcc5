use hashbrown::HashMap;
use parking_lot::Mutex;
use slice_deque::SliceDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type ByteDeque = SliceDeque<u8>;

/// Ring byte queue backing the per-port socket read stream. Data is
/// appended at the tail by the socket and consumed from the head by the
/// framer.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Advance the head, consuming data.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    /// Slice containing data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[inline]
    pub fn clear(&mut self) {
        unsafe { self.data.move_head(self.len() as isize) };
    }

    /// Read up to `max` bytes from the supplied reader into the buffer.
    /// Stops when the reader would block, the cap is reached or the buffer
    /// is full. A closed peer surfaces as `UnexpectedEof` once no data is
    /// left to deliver.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R, max: usize) -> io::Result<usize> {
        let mut received = 0;

        while received < max {
            let space = self.free_capacity().min(max - received);
            if space == 0 {
                break;
            }

            unsafe {
                let target = &mut self.data.tail_head_slice()[..space];
                match reader.read(target) {
                    Ok(0) => {
                        if received == 0 {
                            return Err(io::ErrorKind::UnexpectedEof.into());
                        }
                        break;
                    }
                    Ok(count) => {
                        self.data.move_tail(count as isize);
                        received += count;
                    }
                    Err(err) => {
                        if err.kind() == io::ErrorKind::WouldBlock {
                            break;
                        }
                        return Err(err);
                    }
                }
            }
        }

        Ok(received)
    }
}

/// Cursor-tracked byte container. Data sits between the head and the tail;
/// the region past the tail is writable. Containers acquired from a pool
/// return their storage to it when dropped, so every code path (including
/// unwinding) releases exactly once. `discard` makes the release explicit
/// at call sites that hand ownership back.
#[derive(Debug)]
pub struct BufCont {
    data: Option<Vec<u8>>,
    head: usize,
    tail: usize,
    pool: Option<Arc<PoolCore>>,
}

impl BufCont {
    #[inline]
    fn pooled(data: Vec<u8>, pool: Arc<PoolCore>) -> BufCont {
        BufCont {
            data: Some(data),
            head: 0,
            tail: 0,
            pool: Some(pool),
        }
    }

    /// Wraps an existing byte vector as a standalone, fully readable
    /// container.
    #[inline]
    pub fn wrap(data: Vec<u8>) -> BufCont {
        let tail = data.len();
        BufCont {
            data: Some(data),
            head: 0,
            tail,
            pool: None,
        }
    }

    #[inline]
    fn storage(&self) -> &Vec<u8> {
        self.data.as_ref().expect("Container storage already released")
    }

    #[inline]
    fn storage_mut(&mut self) -> &mut Vec<u8> {
        self.data.as_mut().expect("Container storage already released")
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage().len()
    }

    /// Readable byte count.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.tail - self.head
    }

    /// Writable byte count past the tail.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.capacity() - self.tail
    }

    /// Slice containing data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.storage()[self.head..self.tail]
    }

    /// Slice containing free capacity to be written.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        let tail = self.tail;
        &mut self.storage_mut()[tail..]
    }

    /// Advance the head, consuming data.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        let head = self.head + count;
        if head > self.tail {
            panic!("Head moved past the tail: {} > {}", head, self.tail);
        }
        self.head = head;
    }

    /// Advance the tail, publishing written data.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        let tail = self.tail + count;
        if tail > self.capacity() {
            panic!("Tail moved past capacity: {} > {}", tail, self.capacity());
        }
        self.tail = tail;
    }

    /// Reset the cursor to the full, empty capacity.
    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Releases the container. Equivalent to dropping it; spelled out at
    /// sites where the release is the point.
    #[inline]
    pub fn discard(self) {}
}

impl Drop for BufCont {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            if let Some(pool) = self.pool.take() {
                pool.release(data);
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct PoolCore {
    shelves: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    default_size: usize,
    outstanding: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl PoolCore {
    fn take(&self, capacity: usize) -> Vec<u8> {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.acquired.fetch_add(1, Ordering::AcqRel);

        let recycled = {
            let mut shelves = self.shelves.lock();
            shelves.get_mut(&capacity).and_then(|shelf| shelf.pop())
        };

        match recycled {
            Some(mut data) => {
                for byte in data.iter_mut() {
                    *byte = 0;
                }
                data
            }
            None => vec![0u8; capacity],
        }
    }

    fn release(&self, data: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.released.fetch_add(1, Ordering::AcqRel);

        let mut shelves = self.shelves.lock();
        shelves.entry(data.len()).or_insert_with(Vec::new).push(data);
    }
}

/// Shared pool of fixed-capacity byte containers, shelved by capacity
/// class. Handles are cheap to clone. The acquisition counters exist so
/// tests can assert that the pipeline leaks nothing.
#[derive(Clone)]
pub struct BufferPool {
    core: Arc<PoolCore>,
}

impl BufferPool {
    #[inline]
    pub fn new(default_size: usize) -> BufferPool {
        BufferPool {
            core: Arc::new(PoolCore {
                shelves: Mutex::new(HashMap::new()),
                default_size,
                outstanding: AtomicUsize::new(0),
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
            }),
        }
    }

    /// Acquires a cleared container of the pool's default capacity.
    #[inline]
    pub fn acquire(&self) -> BufCont {
        self.allocate_exact(self.core.default_size)
    }

    /// Acquires a cleared container of exactly the requested capacity.
    #[inline]
    pub fn allocate_exact(&self, capacity: usize) -> BufCont {
        BufCont::pooled(self.core.take(capacity), self.core.clone())
    }

    #[inline]
    pub fn default_size(&self) -> usize {
        self.core.default_size
    }

    /// Containers currently out of the pool.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.core.outstanding.load(Ordering::Acquire)
    }

    #[inline]
    pub fn acquired_total(&self) -> usize {
        self.core.acquired.load(Ordering::Acquire)
    }

    #[inline]
    pub fn released_total(&self) -> usize {
        self.core.released.load(Ordering::Acquire)
    }
}
