use crate::net::buffer::{BufCont, Buffer, BufferPool};
use crate::net::codec::{record_payload_len, Decrypter, MAX_RECORD_PAYLOAD, RECORD_HEADER_SIZE};
use crate::net::gateway::{Completions, Lane};
use crate::net::parser::MessageParser;
use crate::net::pool::{CryptoPool, PoolTask};
use crate::net::port::{MessageHandler, Network, PortId};
use ion::logging::{self as logging, Logger};
use ion::shared::{ErrorType, NetworkError, NetworkResult};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Reframes the socket read stream into complete TLS records. Runs inline
/// on the I/O thread whenever the reactor services the port.
pub struct Framer {
    header: [u8; RECORD_HEADER_SIZE],
    header_filled: usize,
    frame: Option<BufCont>,
    next_frame_length: usize,
    log: Logger,
}

impl Framer {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Framer {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => Logger::root(logging::Discard, logging::o!()),
        };

        Framer {
            header: [0; RECORD_HEADER_SIZE],
            header_filled: 0,
            frame: None,
            next_frame_length: 0,
            log,
        }
    }

    /// Drains `stream` into complete records, handing each to the
    /// decryption gateway. Returns the number of records produced.
    pub fn drain(
        &mut self,
        stream: &mut Buffer,
        pool: &BufferPool,
        decrypt: &Arc<DecryptionGateway>,
    ) -> NetworkResult<usize> {
        let mut produced = 0;

        loop {
            if self.next_frame_length == 0 {
                // Accumulate the 5-byte record header
                let take = (RECORD_HEADER_SIZE - self.header_filled).min(stream.len());
                if take > 0 {
                    self.header[self.header_filled..self.header_filled + take]
                        .copy_from_slice(&stream.read_slice()[..take]);
                    stream.move_head(take);
                    self.header_filled += take;
                }

                if self.header_filled < RECORD_HEADER_SIZE {
                    break;
                }

                let payload = record_payload_len(&self.header);
                if payload > MAX_RECORD_PAYLOAD {
                    logging::warn!(self.log, "record length out of bounds"; "length" => payload);
                    return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
                }

                let mut frame = pool.allocate_exact(RECORD_HEADER_SIZE + payload);
                frame.write_slice()[..RECORD_HEADER_SIZE].copy_from_slice(&self.header);
                frame.move_tail(RECORD_HEADER_SIZE);

                self.frame = Some(frame);
                self.next_frame_length = RECORD_HEADER_SIZE + payload;
                self.header_filled = 0;
            }

            let mut frame = match self.frame.take() {
                Some(frame) => frame,
                None => break,
            };

            let take = frame.free_capacity().min(stream.len());
            if take > 0 {
                frame.write_slice()[..take].copy_from_slice(&stream.read_slice()[..take]);
                frame.move_tail(take);
                stream.move_head(take);
            }

            if frame.free_capacity() > 0 {
                self.frame = Some(frame);
                break;
            }

            logging::trace!(self.log, "record framed"; "size" => self.next_frame_length);

            self.next_frame_length = 0;
            decrypt.enqueue(frame);
            produced += 1;
        }

        Ok(produced)
    }

    /// True when no partial header or record is held.
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.next_frame_length == 0 && self.header_filled == 0
    }

    /// Drops any partial record, releasing the held container.
    #[inline]
    pub fn reset(&mut self) {
        self.frame = None;
        self.next_frame_length = 0;
        self.header_filled = 0;
    }
}

/// First off-thread stage: decrypts records in arrival order and extracts
/// the application messages they complete.
pub struct DecryptionGateway {
    lane: Lane<BufCont>,
    completions: Completions<usize>,
    codec: Mutex<Box<dyn Decrypter>>,
    parser: Mutex<MessageParser>,
    dst: Mutex<Option<BufCont>>,
    next: Arc<ReadGateway>,
    pool: CryptoPool,
    buffers: BufferPool,
    myself: Weak<DecryptionGateway>,
    log: Logger,
}

impl DecryptionGateway {
    pub fn new(
        codec: Box<dyn Decrypter>,
        parser: MessageParser,
        dst: BufCont,
        next: Arc<ReadGateway>,
        pool: CryptoPool,
        buffers: BufferPool,
        log: &Logger,
    ) -> Arc<DecryptionGateway> {
        Arc::new_cyclic(|myself| DecryptionGateway {
            lane: Lane::new(),
            completions: Completions::new(),
            codec: Mutex::new(codec),
            parser: Mutex::new(parser),
            dst: Mutex::new(Some(dst)),
            next,
            pool,
            buffers,
            myself: myself.clone(),
            log: log.new(logging::o!("stage" => "decrypt")),
        })
    }

    /// Queues one complete record for decryption. Records with an empty
    /// payload are dropped silently.
    pub fn enqueue(&self, frame: BufCont) {
        if frame.remaining() <= RECORD_HEADER_SIZE {
            logging::trace!(self.log, "empty record dropped");
            return;
        }

        if self.lane.offer(frame) {
            self.schedule();
        }
    }

    fn schedule(&self) {
        if let Some(task) = self.myself.upgrade() {
            self.pool.submit(task);
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

    /// Teardown: releases queued records, the destination container and any
    /// parser carryover. In-flight workers finish against a gone
    /// destination and drop their records.
    pub fn release_resources(&self) {
        self.lane.drain_with(drop);
        *self.dst.lock() = None;
        self.parser.lock().reset();
    }

    fn decrypt_one(&self, frame: BufCont, dst: &mut BufCont) -> NetworkResult<usize> {
        dst.clear();
        self.codec.lock().unwrap(frame.read_slice(), dst)?;

        let mut messages = Vec::new();
        self.parser
            .lock()
            .extract(dst.read_slice(), &self.buffers, &mut messages)?;
        dst.clear();

        let extracted = messages.len();
        logging::trace!(self.log, "record decrypted"; "messages" => extracted);

        self.next.enqueue(messages);
        Ok(extracted)
    }
}

impl PoolTask for DecryptionGateway {
    fn run_once(self: Arc<Self>) {
        if let Some(frame) = self.lane.take() {
            let mut dst = self.dst.lock();
            match dst.as_mut() {
                Some(dst) => {
                    let result = self.decrypt_one(frame, dst);
                    self.completions.push(result);
                }
                // Port already unregistered; the record is dropped and the
                // result with it.
                None => drop(frame),
            }
        }

        if self.lane.settle() {
            self.pool.submit(self.clone());
        }
    }
}

/// Second off-thread stage: hands completed messages to the application
/// handler in frame order.
pub struct ReadGateway {
    lane: Lane<Vec<BufCont>>,
    completions: Completions<usize>,
    handler: Arc<dyn MessageHandler>,
    network: Arc<dyn Network>,
    port: PortId,
    pool: CryptoPool,
    myself: Weak<ReadGateway>,
    log: Logger,
}

impl ReadGateway {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        network: Arc<dyn Network>,
        port: PortId,
        pool: CryptoPool,
        log: &Logger,
    ) -> Arc<ReadGateway> {
        Arc::new_cyclic(|myself| ReadGateway {
            lane: Lane::new(),
            completions: Completions::new(),
            handler,
            network,
            port,
            pool,
            myself: myself.clone(),
            log: log.new(logging::o!("stage" => "read")),
        })
    }

    pub fn enqueue(&self, messages: Vec<BufCont>) {
        if self.lane.offer(messages) {
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

    fn deliver(&self, messages: Vec<BufCont>) -> NetworkResult<usize> {
        let mut delivered = 0;

        for message in messages {
            self.handler.handle_message(message.read_slice(), self.port)?;
            delivered += 1;
        }

        logging::trace!(self.log, "messages delivered"; "count" => delivered);
        Ok(delivered)
    }
}

impl PoolTask for ReadGateway {
    fn run_once(self: Arc<Self>) {
        if let Some(batch) = self.lane.take() {
            let result = self.deliver(batch);
            self.completions.push(result);
        }

        // An emptied gateway nudges the port so the reactor drains results
        // and observes end-of-stream conditions.
        if self.lane.is_empty() {
            self.network.nudge_channel(self.port);
        }

        if self.lane.settle() {
            self.pool.submit(self.clone());
        }
    }
}
