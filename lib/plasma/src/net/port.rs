use crate::net::buffer::{Buffer, BufferPool};
use crate::net::codec::{Decrypter, Encrypter, MAX_FRAGMENT, RECORD_HEADER_SIZE};
use crate::net::egress::{EncryptionGateway, OutboundQueue, Serializer, WriteGateway};
use crate::net::ingress::{DecryptionGateway, Framer, ReadGateway};
use crate::net::parser::MessageParser;
use crate::net::pool::CryptoPool;
use ion::logging::{self as logging, Logger};
use ion::shared::NetworkResult;
use serde_derive::Deserialize;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::Arc;

pub type PortId = usize;

/// Reactor-facing contract. The port never blocks on the reactor; it asks
/// to be re-serviced or to have its write selection toggled and returns.
pub trait Network: Send + Sync {
    /// Re-schedules the port for a service pass even without socket
    /// readiness.
    fn nudge_channel(&self, port: PortId);

    /// Toggles write-readiness selection for the port.
    fn set_write_interest(&self, port: PortId, enabled: bool);
}

/// Application-facing contract. Handlers run on crypto pool threads and
/// must not block on their own connection's write path.
pub trait MessageHandler: Send + Sync {
    /// Consumes one complete application message. A failure terminates the
    /// connection.
    fn handle_message(&self, message: &[u8], port: PortId) -> NetworkResult<()>;

    /// Upper bound on bytes pulled off the socket in one service pass.
    fn max_read(&self) -> usize {
        65536
    }
}

/// Shared-reference socket access. Non-blocking TCP streams implement
/// `Read` and `Write` on `&self`, which lets the I/O thread read while a
/// pool worker writes.
pub trait SocketIo: Send + Sync {
    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_bytes(&self, buf: &[u8]) -> io::Result<usize>;
}

impl<T> SocketIo for T
where
    T: Send + Sync,
    for<'a> &'a T: io::Read + io::Write,
{
    #[inline]
    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self;
        io::Read::read(&mut stream, buf)
    }

    #[inline]
    fn write_bytes(&self, buf: &[u8]) -> io::Result<usize> {
        let mut stream = self;
        io::Write::write(&mut stream, buf)
    }
}

struct SockReader<'a>(&'a dyn SocketIo);

impl<'a> io::Read for SockReader<'a> {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read_bytes(buf)
    }
}

/// Producer-visible state of the outbound side: ciphertext bytes in flight
/// between the encryption gateway and the socket, plus the backpressure
/// flag raised on short writes and lowered once the pipeline drains.
pub struct WriteStream {
    queued: AtomicIsize,
    backpressure: AtomicBool,
}

impl WriteStream {
    #[inline]
    pub fn new() -> Arc<WriteStream> {
        Arc::new(WriteStream {
            queued: AtomicIsize::new(0),
            backpressure: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn add_queued(&self, count: usize) {
        self.queued.fetch_add(count as isize, Ordering::AcqRel);
    }

    #[inline]
    pub fn sub_queued(&self, count: usize) {
        self.queued.fetch_sub(count as isize, Ordering::AcqRel);
    }

    #[inline]
    pub fn queued_bytes(&self) -> isize {
        self.queued.load(Ordering::Acquire)
    }

    #[inline]
    pub fn backpressure_started(&self) {
        self.backpressure.store(true, Ordering::Release);
    }

    #[inline]
    pub fn clear_backpressure(&self) {
        self.backpressure.store(false, Ordering::Release);
    }

    #[inline]
    pub fn has_backpressure(&self) -> bool {
        self.backpressure.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Socket read stream ring capacity.
    pub read_buffer_size: usize,
    /// Decrypt destination capacity; one TLS packet.
    pub packet_buffer_size: usize,
    /// Largest fragment handed to the encrypter in one call.
    pub app_buffer_size: usize,
    /// Default buffer pool container capacity.
    pub pool_default_size: usize,
    /// Largest accepted application message.
    pub max_message_size: usize,
}

impl Default for PortConfig {
    fn default() -> PortConfig {
        PortConfig {
            read_buffer_size: 65536,
            packet_buffer_size: 16384 + 2048 + RECORD_HEADER_SIZE,
            app_buffer_size: MAX_FRAGMENT,
            pool_default_size: 16384,
            max_message_size: 64 * 1024 * 1024,
        }
    }
}

impl PortConfig {
    pub fn from_toml(config: &str) -> Result<PortConfig, serdeconv::Error> {
        serdeconv::from_toml_str(config)
    }

    /// Fragments never exceed what a record can carry, whatever the
    /// configuration says.
    #[inline]
    pub fn effective_app_buffer(&self) -> usize {
        self.app_buffer_size.min(MAX_FRAGMENT)
    }
}

/// A TLS connection in steady state: the handshake is done and both record
/// codecs are keyed. The reactor calls `run` whenever the socket is
/// readable or the port was nudged; everything expensive happens on the
/// crypto pool while per-connection order stays total.
pub struct TlsPort {
    id: PortId,
    sock: Arc<dyn SocketIo>,
    read_stream: Buffer,
    framer: Framer,
    serializer: Serializer,
    outbound: Arc<OutboundQueue>,
    decrypt: Arc<DecryptionGateway>,
    read: Arc<ReadGateway>,
    encrypt: Arc<EncryptionGateway>,
    write: Arc<WriteGateway>,
    write_stream: Arc<WriteStream>,
    buffers: BufferPool,
    network: Arc<dyn Network>,
    max_read: usize,
    log: Logger,
}

impl TlsPort {
    #[allow(clippy::too_many_arguments)]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        id: PortId,
        sock: Arc<dyn SocketIo>,
        handler: Arc<dyn MessageHandler>,
        network: Arc<dyn Network>,
        encrypter: Box<dyn Encrypter>,
        decrypter: Box<dyn Decrypter>,
        pool: CryptoPool,
        buffers: BufferPool,
        config: &PortConfig,
        log: L,
    ) -> TlsPort {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("port_id" => id)),
            _ => Logger::root(logging::Discard, logging::o!()),
        };

        let max_read = handler.max_read();
        let write_stream = WriteStream::new();

        let write = WriteGateway::new(
            sock.clone(),
            write_stream.clone(),
            network.clone(),
            id,
            pool.clone(),
            &log,
        );
        let encrypt = EncryptionGateway::new(
            encrypter,
            write.clone(),
            write_stream.clone(),
            buffers.clone(),
            pool.clone(),
            &log,
        );
        let read = ReadGateway::new(handler, network.clone(), id, pool.clone(), &log);
        let decrypt = DecryptionGateway::new(
            decrypter,
            MessageParser::new(config.max_message_size),
            buffers.allocate_exact(config.packet_buffer_size),
            read.clone(),
            pool,
            buffers.clone(),
            &log,
        );

        let outbound = OutboundQueue::new();
        let serializer = Serializer::new(outbound.clone(), config.effective_app_buffer(), &log);

        logging::debug!(log, "port entering steady state");

        TlsPort {
            id,
            sock,
            read_stream: Buffer::new(config.read_buffer_size),
            framer: Framer::new(&log),
            serializer,
            outbound,
            decrypt,
            read,
            encrypt,
            write,
            write_stream,
            buffers,
            network,
            max_read,
            log,
        }
    }

    #[inline]
    pub fn id(&self) -> PortId {
        self.id
    }

    /// Producer side of the outbound pipeline.
    #[inline]
    pub fn outbound_queue(&self) -> Arc<OutboundQueue> {
        self.outbound.clone()
    }

    #[inline]
    pub fn write_stream(&self) -> Arc<WriteStream> {
        self.write_stream.clone()
    }

    /// One reactor service pass. Reads a bounded amount off the socket,
    /// reframes, renders the outbound backlog, surfaces the first stage
    /// error and maintains backpressure. Never blocks on crypto.
    pub fn run(&mut self) -> NetworkResult<()> {
        let received = self
            .read_stream
            .ingress(SockReader(&*self.sock), self.max_read)?;

        if received > 0 {
            logging::trace!(self.log, "socket drained"; "received" => received);
        }

        let mut produced = self
            .framer
            .drain(&mut self.read_stream, &self.buffers, &self.decrypt)?;

        if self.serializer.drain(&self.buffers, &self.encrypt)? {
            produced += 1;
        }

        if produced > 0 {
            self.network.nudge_channel(self.id);
        }

        self.write.kick();
        self.drain_completions()?;

        if self.outbound_empty() {
            self.write_stream.clear_backpressure();
        }

        Ok(())
    }

    fn drain_completions(&self) -> NetworkResult<()> {
        while let Some(result) = self.decrypt.poll_result() {
            if let Err(error) = result {
                return Err(error);
            }
        }
        while let Some(result) = self.read.poll_result() {
            if let Err(error) = result {
                return Err(error);
            }
        }
        while let Some(result) = self.encrypt.poll_result() {
            if let Err(error) = result {
                return Err(error);
            }
        }
        while let Some(result) = self.write.poll_result() {
            if let Err(error) = result {
                return Err(error);
            }
        }
        Ok(())
    }

    /// True when no ciphertext or backlog remains on the outbound side.
    #[inline]
    pub fn outbound_empty(&self) -> bool {
        self.serializer.is_empty()
            && self.encrypt.is_empty()
            && self.write.is_empty()
            && self.write_stream.queued_bytes() == 0
    }

    /// True when all four gateways report empty.
    #[inline]
    pub fn pipeline_empty(&self) -> bool {
        self.decrypt.is_empty() && self.read.is_empty() && self.outbound_empty()
    }

    /// Reactor unregister hook: releases the decrypt destination, every
    /// queued container and any partial framing state. In-flight pool
    /// workers finish against a quiesced port and their results are
    /// dropped.
    pub fn unregistered(&mut self) {
        logging::debug!(self.log, "port unregistered");

        self.decrypt.release_resources();
        self.read.release_resources();
        self.encrypt.release_resources();
        self.write.release_resources();
        self.framer.reset();
        self.read_stream.clear();
    }
}
