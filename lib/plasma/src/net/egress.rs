use crate::net::buffer::{BufCont, BufferPool};
use crate::net::codec::{Encrypter, MAX_FRAGMENT};
use crate::net::gateway::{Completions, Lane};
use crate::net::pool::{CryptoPool, PoolTask};
use crate::net::port::{Network, PortId, SocketIo, WriteStream};
use ion::logging::{self as logging, Logger};
use ion::shared::{NetworkError, NetworkResult};
use parking_lot::Mutex;
use std::io;
use std::mem;
use std::sync::{Arc, Weak};

/// A deferred-serializable outbound message. Producers queue these without
/// rendering them; the serializer renders on the I/O thread once the port
/// is serviced.
pub trait Outbound: Send {
    /// Serialized size in bytes, or `None` for the empty-message sentinel
    /// which the serializer skips.
    fn size(&self) -> Option<usize>;

    /// Writes exactly `size()` bytes into `dst`.
    fn serialize(&self, dst: &mut [u8]) -> NetworkResult<()>;
}

/// Producer-facing queue of pending outbound messages. The serializer
/// claims the whole backlog in one swap, so producers never contend with
/// the render loop item by item.
pub struct OutboundQueue {
    pending: Mutex<Vec<Box<dyn Outbound>>>,
}

impl OutboundQueue {
    #[inline]
    pub fn new() -> Arc<OutboundQueue> {
        Arc::new(OutboundQueue {
            pending: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    pub fn offer(&self, message: Box<dyn Outbound>) {
        self.pending.lock().push(message);
    }

    #[inline]
    pub fn swap(&self) -> Vec<Box<dyn Outbound>> {
        mem::replace(&mut *self.pending.lock(), Vec::new())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// A plaintext region bound for one `wrap` call. Small messages share a
/// pooled container; large messages are rendered once to the heap and
/// emitted as capped sub-slices of the same allocation.
pub enum Fragment {
    Pooled(BufCont),
    Shared {
        data: Arc<Vec<u8>>,
        start: usize,
        end: usize,
    },
}

impl Fragment {
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        match self {
            Fragment::Pooled(cont) => cont.read_slice(),
            Fragment::Shared { data, start, end } => &data[*start..*end],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes().len()
    }
}

/// Renders the outbound backlog into encryption work on the I/O thread.
pub struct Serializer {
    queue: Arc<OutboundQueue>,
    app_buffer_size: usize,
    log: Logger,
}

impl Serializer {
    pub fn new(queue: Arc<OutboundQueue>, app_buffer_size: usize, log: &Logger) -> Serializer {
        Serializer {
            queue,
            app_buffer_size: app_buffer_size.min(MAX_FRAGMENT),
            log: log.new(logging::o!("stage" => "serialize")),
        }
    }

    /// Builds encryption work from the pending backlog. Returns true when
    /// any fragment was handed to the encryption gateway.
    pub fn drain(
        &self,
        pool: &BufferPool,
        encrypt: &Arc<EncryptionGateway>,
    ) -> NetworkResult<bool> {
        let batch = self.queue.swap();
        if batch.is_empty() {
            return Ok(false);
        }

        let mut produced = false;
        let mut shared: Option<BufCont> = None;

        for message in batch {
            let size = match message.size() {
                Some(size) => size,
                None => continue,
            };

            // Small messages pack into one shared pooled container, bounded
            // so a flushed container never exceeds the wrap cap
            if let Some(cont) = shared.as_mut() {
                if size <= cont.free_capacity()
                    && cont.remaining() + size <= self.app_buffer_size
                {
                    message.serialize(&mut cont.write_slice()[..size])?;
                    cont.move_tail(size);
                    continue;
                }
            } else if size <= pool.default_size().min(self.app_buffer_size) {
                let mut cont = pool.acquire();
                message.serialize(&mut cont.write_slice()[..size])?;
                cont.move_tail(size);
                shared = Some(cont);
                continue;
            }

            // No room: flush the shared container, render this message to
            // the heap and emit capped slices
            if let Some(cont) = shared.take() {
                if cont.remaining() > 0 {
                    encrypt.enqueue(Fragment::Pooled(cont));
                    produced = true;
                }
            }

            let mut heap = vec![0u8; size];
            message.serialize(&mut heap)?;
            let data = Arc::new(heap);

            let mut start = 0;
            while start < size {
                let end = (start + self.app_buffer_size).min(size);
                encrypt.enqueue(Fragment::Shared {
                    data: data.clone(),
                    start,
                    end,
                });
                produced = true;
                start = end;
            }
        }

        if let Some(cont) = shared.take() {
            if cont.remaining() > 0 {
                encrypt.enqueue(Fragment::Pooled(cont));
                produced = true;
            }
        }

        if produced {
            logging::trace!(self.log, "outbound backlog rendered");
        }

        Ok(produced)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Third off-thread stage: encrypts plaintext fragments in serialization
/// order and accounts the ciphertext as in flight.
pub struct EncryptionGateway {
    lane: Lane<Fragment>,
    completions: Completions<usize>,
    codec: Mutex<Box<dyn Encrypter>>,
    next: Arc<WriteGateway>,
    write_stream: Arc<WriteStream>,
    buffers: BufferPool,
    pool: CryptoPool,
    myself: Weak<EncryptionGateway>,
    log: Logger,
}

impl EncryptionGateway {
    pub fn new(
        codec: Box<dyn Encrypter>,
        next: Arc<WriteGateway>,
        write_stream: Arc<WriteStream>,
        buffers: BufferPool,
        pool: CryptoPool,
        log: &Logger,
    ) -> Arc<EncryptionGateway> {
        Arc::new_cyclic(|myself| EncryptionGateway {
            lane: Lane::new(),
            completions: Completions::new(),
            codec: Mutex::new(codec),
            next,
            write_stream,
            buffers,
            pool,
            myself: myself.clone(),
            log: log.new(logging::o!("stage" => "encrypt")),
        })
    }

    pub fn enqueue(&self, fragment: Fragment) {
        if self.lane.offer(fragment) {
            if let Some(task) = self.myself.upgrade() {
                self.pool.submit(task);
            }
        }
    }

    #[inline]
    pub fn poll_result(&self) -> Option<NetworkResult<usize>> {
        self.completions.poll()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lane.is_empty()
    }

    pub fn release_resources(&self) {
        self.lane.drain_with(drop);
    }

    fn encrypt_one(&self, fragment: Fragment) -> NetworkResult<usize> {
        let record = self.codec.lock().wrap(fragment.bytes(), &self.buffers)?;
        let queued = record.remaining();

        // Account the ciphertext before it can leave the write gateway
        self.write_stream.add_queued(queued);
        self.next.enqueue(record, queued);

        logging::trace!(self.log, "fragment encrypted"; "ciphertext" => queued);
        Ok(queued)
        // The plaintext fragment is released here
    }
}

impl PoolTask for EncryptionGateway {
    fn run_once(self: Arc<Self>) {
        if let Some(fragment) = self.lane.take() {
            let result = self.encrypt_one(fragment);
            self.completions.push(result);
        }

        if self.lane.settle() {
            self.pool.submit(self.clone());
        }
    }
}

struct PendingWrite {
    record: BufCont,
    queued: usize,
    written: usize,
}

/// Final stage: writes ciphertext to the non-blocking socket. Unlike the
/// other gateways the head item survives partial writes, so ciphertext
/// leaves the port exactly in encryption order.
pub struct WriteGateway {
    lane: Lane<PendingWrite>,
    completions: Completions<(usize, usize)>,
    sock: Arc<dyn SocketIo>,
    write_stream: Arc<WriteStream>,
    network: Arc<dyn Network>,
    port: PortId,
    pool: CryptoPool,
    myself: Weak<WriteGateway>,
    log: Logger,
}

impl WriteGateway {
    pub fn new(
        sock: Arc<dyn SocketIo>,
        write_stream: Arc<WriteStream>,
        network: Arc<dyn Network>,
        port: PortId,
        pool: CryptoPool,
        log: &Logger,
    ) -> Arc<WriteGateway> {
        Arc::new_cyclic(|myself| WriteGateway {
            lane: Lane::new(),
            completions: Completions::new(),
            sock,
            write_stream,
            network,
            port,
            pool,
            myself: myself.clone(),
            log: log.new(logging::o!("stage" => "write")),
        })
    }

    pub fn enqueue(&self, record: BufCont, queued: usize) {
        let pending = PendingWrite {
            record,
            queued,
            written: 0,
        };

        if self.lane.offer(pending) {
            self.schedule();
        }
    }

    /// Re-schedules the drain when ciphertext is waiting and no worker is
    /// claimed. Called on every service pass so a parked head resumes once
    /// the kernel buffer drains.
    pub fn kick(&self) {
        if self.lane.kick() {
            self.schedule();
        }
    }

    fn schedule(&self) {
        if let Some(task) = self.myself.upgrade() {
            self.pool.submit(task);
        }
    }

    #[inline]
    pub fn poll_result(&self) -> Option<NetworkResult<(usize, usize)>> {
        self.completions.poll()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lane.is_empty()
    }

    pub fn release_resources(&self) {
        self.lane.drain_with(drop);
    }
}

impl PoolTask for WriteGateway {
    fn run_once(self: Arc<Self>) {
        let mut parked = false;

        if let Some(mut head) = self.lane.take() {
            let wanted = head.record.remaining();

            match self.sock.write_bytes(head.record.read_slice()) {
                Ok(count) => {
                    head.record.move_head(count);
                    head.written += count;
                    self.write_stream.sub_queued(count);

                    if count < wanted {
                        self.write_stream.backpressure_started();
                    }

                    if head.record.remaining() == 0 {
                        logging::trace!(self.log, "record written";
                                        "queued" => head.queued,
                                        "written" => head.written);
                        self.completions.push(Ok((head.queued, head.written)));
                        // The ciphertext container is released here
                    } else {
                        // Short write: the head stays put and is retried
                        if count == 0 {
                            parked = true;
                        }
                        self.lane.restore(head);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.write_stream.backpressure_started();
                    self.lane.restore(head);
                    parked = true;
                }
                Err(err) => {
                    logging::warn!(self.log, "socket write failed"; "error" => %err);
                    self.completions.push(Err(NetworkError::from(err)));
                    // The ciphertext container is released with the head
                }
            }
        }

        if parked {
            // Kernel buffer is full; wait for the reactor to re-arm
            // writability instead of spinning on the pool
            self.lane.park();
            return;
        }

        if self.lane.settle() {
            self.pool.submit(self.clone());
        } else if self.lane.is_empty() {
            // Fully drained: stop write selection and let the reactor
            // observe pipeline emptiness
            self.network.set_write_interest(self.port, false);
            self.network.nudge_channel(self.port);
        }
    }
}
