//! End-to-end exercises of the TLS port pipeline: a scripted non-blocking
//! socket on one side, a collecting handler on the other, real record
//! crypto in between.

use byteorder::{BigEndian, ByteOrder};
use ion::crypto;
use ion::logging::{o, Discard, Logger};
use ion::shared::{ErrorType, ErrorUtils, NetworkError, NetworkResult};
use parking_lot::Mutex;
use plasma::net::buffer::{BufCont, BufferPool};
use plasma::net::codec::{
    record_payload_len, Decrypter, Encrypter, RecordDecrypter, RecordEncrypter,
    RECORD_HEADER_SIZE,
};
use plasma::net::egress::Outbound;
use plasma::net::ingress::{DecryptionGateway, ReadGateway};
use plasma::net::parser::MessageParser;
use plasma::net::pool::CryptoPool;
use plasma::net::port::{MessageHandler, Network, PortConfig, PortId, TlsPort};
use rand::RngCore;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct ScriptedSocket {
    state: Mutex<SocketState>,
}

struct SocketState {
    input: Vec<u8>,
    cursor: usize,
    chunk: usize,
    budget: usize,
    written: Vec<u8>,
}

impl ScriptedSocket {
    fn new(input: Vec<u8>, chunk: usize) -> ScriptedSocket {
        ScriptedSocket {
            state: Mutex::new(SocketState {
                input,
                cursor: 0,
                chunk,
                budget: usize::max_value(),
                written: Vec::new(),
            }),
        }
    }

    fn empty() -> ScriptedSocket {
        Self::new(Vec::new(), 1024)
    }

    fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }
}

impl<'a> io::Read for &'a ScriptedSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.cursor == state.input.len() {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let take = state.chunk.min(buf.len()).min(state.input.len() - state.cursor);
        let cursor = state.cursor;
        buf[..take].copy_from_slice(&state.input[cursor..cursor + take]);
        state.cursor += take;
        Ok(take)
    }
}

impl<'a> io::Write for &'a ScriptedSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.budget == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let take = state.budget.min(buf.len());
        state.written.extend_from_slice(&buf[..take]);
        state.budget = state.budget.saturating_sub(take);
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Reactor;

impl Network for Reactor {
    fn nudge_channel(&self, _port: PortId) {}
    fn set_write_interest(&self, _port: PortId, _enabled: bool) {}
}

struct Collector {
    messages: Mutex<Vec<Vec<u8>>>,
}

impl Collector {
    fn new() -> Collector {
        Collector {
            messages: Mutex::new(Vec::new()),
        }
    }

    fn count(&self) -> usize {
        self.messages.lock().len()
    }

    fn take(&self) -> Vec<Vec<u8>> {
        self.messages.lock().drain(..).collect()
    }
}

impl MessageHandler for Collector {
    fn handle_message(&self, message: &[u8], _port: PortId) -> NetworkResult<()> {
        self.messages.lock().push(message.to_vec());
        Ok(())
    }
}

struct Payload(Vec<u8>);

impl Outbound for Payload {
    fn size(&self) -> Option<usize> {
        Some(self.0.len())
    }

    fn serialize(&self, dst: &mut [u8]) -> NetworkResult<()> {
        dst.copy_from_slice(&self.0);
        Ok(())
    }
}

fn settle<F: FnMut() -> bool>(mut cond: F) {
    for _ in 0..5000 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("Pipeline did not settle");
}

fn app_message(body: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; 4];
    BigEndian::write_u32(&mut data, body.len() as u32);
    data.extend_from_slice(body);
    data
}

/// Encrypts a plain byte stream into records of at most 16 KiB cleartext
/// each, the way a peer would put them on the wire.
fn to_wire(plain: &[u8], encrypter: &mut RecordEncrypter, buffers: &BufferPool) -> Vec<u8> {
    let mut wire = Vec::new();
    let mut start = 0;

    while start < plain.len() {
        let end = (start + 16384).min(plain.len());
        let record = encrypter
            .wrap(&plain[start..end], buffers)
            .expect("Test record must wrap");
        wire.extend_from_slice(record.read_slice());
        record.discard();
        start = end;
    }

    wire
}

/// Decodes a written wire stream back into application messages.
fn from_wire(wire: &[u8], key: [u8; crypto::KEY_SIZE], buffers: &BufferPool) -> Vec<Vec<u8>> {
    let mut decrypter = RecordDecrypter::new(key);
    let mut parser = MessageParser::new(64 * 1024 * 1024);
    let mut dst = buffers.allocate_exact(16384 + 2048 + RECORD_HEADER_SIZE);
    let mut messages = Vec::new();
    let mut cursor = 0;

    while cursor < wire.len() {
        let payload = record_payload_len(&wire[cursor..cursor + RECORD_HEADER_SIZE]);
        let record = &wire[cursor..cursor + RECORD_HEADER_SIZE + payload];
        cursor += record.len();

        dst.clear();
        decrypter.unwrap(record, &mut dst).expect("Record must open");

        let mut out = Vec::new();
        parser
            .extract(dst.read_slice(), buffers, &mut out)
            .expect("Messages must parse");
        for message in out {
            messages.push(message.read_slice().to_vec());
        }
    }

    assert!(parser.is_clean());
    messages
}

fn steady_port(
    sock: Arc<ScriptedSocket>,
    key: [u8; crypto::KEY_SIZE],
    buffers: &BufferPool,
    workers: usize,
) -> (TlsPort, Arc<Collector>) {
    let handler = Arc::new(Collector::new());
    let port = TlsPort::new(
        1,
        sock,
        handler.clone(),
        Arc::new(Reactor),
        Box::new(RecordEncrypter::new(key)),
        Box::new(RecordDecrypter::new(key)),
        CryptoPool::new(workers, None),
        buffers.clone(),
        &PortConfig::default(),
        None,
    );
    (port, handler)
}

#[test]
fn one_message_in_one_record() {
    let buffers = BufferPool::new(16384);
    let key = crypto::random_key();

    let mut peer = RecordEncrypter::new(key);
    let wire = to_wire(&app_message(&[42u8; 100]), &mut peer, &buffers);
    let sock = Arc::new(ScriptedSocket::new(wire, 1400));

    let (mut port, handler) = steady_port(sock, key, &buffers, 1);

    port.run().unwrap();
    settle(|| handler.count() == 1);
    settle(|| {
        port.run().unwrap();
        port.pipeline_empty()
    });

    assert_eq!(handler.take(), vec![vec![42u8; 100]]);

    port.unregistered();
    assert_eq!(buffers.outstanding(), 0);
}

#[test]
fn large_message_spans_records() {
    let buffers = BufferPool::new(16384);
    let key = crypto::random_key();

    let mut body = vec![0u8; 40960];
    rand::thread_rng().fill_bytes(&mut body);

    let mut peer = RecordEncrypter::new(key);
    let wire = to_wire(&app_message(&body), &mut peer, &buffers);
    let sock = Arc::new(ScriptedSocket::new(wire, 1400));

    let (mut port, handler) = steady_port(sock, key, &buffers, 1);

    settle(|| {
        port.run().unwrap();
        handler.count() == 1
    });
    settle(|| {
        port.run().unwrap();
        port.pipeline_empty()
    });

    assert_eq!(handler.take(), vec![body]);

    port.unregistered();
    assert_eq!(buffers.outstanding(), 0);
}

#[test]
fn two_messages_packed_in_one_record_complete_once() {
    let buffers = BufferPool::new(16384);
    let key = crypto::random_key();
    let pool = CryptoPool::new(1, None);
    let log = Logger::root(Discard, o!());

    let handler = Arc::new(Collector::new());
    let read = ReadGateway::new(handler.clone(), Arc::new(Reactor), 1, pool.clone(), &log);
    let decrypt = DecryptionGateway::new(
        Box::new(RecordDecrypter::new(key)),
        MessageParser::new(1024 * 1024),
        buffers.allocate_exact(16384 + 2048 + RECORD_HEADER_SIZE),
        read.clone(),
        pool,
        buffers.clone(),
        &log,
    );

    let mut plain = app_message(&[1u8; 60]);
    plain.extend(app_message(&[2u8; 140]));

    let mut peer = RecordEncrypter::new(key);
    let record = peer.wrap(&plain, &buffers).unwrap();
    let mut frame = buffers.allocate_exact(record.remaining());
    frame.write_slice().copy_from_slice(record.read_slice());
    frame.move_tail(record.remaining());
    record.discard();

    decrypt.enqueue(frame);

    settle(|| handler.count() == 2);

    let messages = handler.take();
    assert_eq!(messages[0], vec![1u8; 60]);
    assert_eq!(messages[1], vec![2u8; 140]);

    // The read gateway completes the pair with a single count of two
    let mut delivered = None;
    settle(|| {
        if let Some(result) = read.poll_result() {
            delivered = Some(result);
            true
        } else {
            false
        }
    });
    assert_eq!(delivered, Some(Ok(2)));
    assert_eq!(read.poll_result(), None);
}

#[test]
fn outbound_stream_preserves_serialization_order() {
    let buffers = BufferPool::new(16384);
    let key = crypto::random_key();
    let sock = Arc::new(ScriptedSocket::empty());

    let (mut port, _handler) = steady_port(sock.clone(), key, &buffers, 2);

    let mut rng = rand::thread_rng();
    let mut expected = Vec::new();
    for index in 0..40 {
        // Mix of packable messages and multi-fragment monsters
        let size = if index % 7 == 0 { 40000 } else { 100 + index * 37 };
        let mut body = vec![0u8; size];
        rng.fill_bytes(&mut body);
        expected.push(app_message(&body).to_vec());
        port.outbound_queue()
            .offer(Box::new(Payload(app_message(&body))));
    }

    settle(|| {
        port.run().unwrap();
        port.outbound_empty()
    });

    // Decrypting the wire stream in order must reproduce the messages in
    // serialization order
    let bodies: Vec<Vec<u8>> = expected
        .iter()
        .map(|framed| framed[4..].to_vec())
        .collect();
    assert_eq!(from_wire(&sock.written(), key, &buffers), bodies);

    port.unregistered();
    assert_eq!(buffers.outstanding(), 0);
}

#[test]
fn decrypt_workers_never_overlap() {
    struct Gauged {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Decrypter for Gauged {
        fn unwrap(&mut self, record: &[u8], dst: &mut BufCont) -> NetworkResult<usize> {
            let now = self.current.fetch_add(1, Ordering::AcqRel) + 1;
            self.peak.fetch_max(now, Ordering::AcqRel);
            thread::sleep(Duration::from_micros(200));

            let body = &record[RECORD_HEADER_SIZE..];
            dst.write_slice()[..body.len()].copy_from_slice(body);
            dst.move_tail(body.len());

            self.current.fetch_sub(1, Ordering::AcqRel);
            Ok(body.len())
        }
    }

    let buffers = BufferPool::new(16384);
    let pool = CryptoPool::new(4, None);
    let log = Logger::root(Discard, o!());

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handler = Arc::new(Collector::new());
    let read = ReadGateway::new(handler.clone(), Arc::new(Reactor), 1, pool.clone(), &log);
    let decrypt = DecryptionGateway::new(
        Box::new(Gauged {
            current: current.clone(),
            peak: peak.clone(),
        }),
        MessageParser::new(1024 * 1024),
        buffers.allocate_exact(16384),
        read,
        pool,
        buffers.clone(),
        &log,
    );

    let total = 50;
    for index in 0..total {
        let plain = app_message(&[index as u8; 32]);
        let mut record = vec![0u8; RECORD_HEADER_SIZE];
        record.extend_from_slice(&plain);
        BigEndian::write_u16(&mut record[3..5], plain.len() as u16);

        let mut frame = buffers.allocate_exact(record.len());
        frame.write_slice().copy_from_slice(&record);
        frame.move_tail(record.len());
        decrypt.enqueue(frame);
    }

    settle(|| handler.count() == total);

    assert_eq!(peak.load(Ordering::Acquire), 1);
}

#[test]
fn unwrap_failure_mid_stream_tears_down_cleanly() {
    let buffers = BufferPool::new(16384);
    let key = crypto::random_key();

    let mut peer = RecordEncrypter::new(key);
    let mut wire = to_wire(&app_message(b"good record"), &mut peer, &buffers);
    let tamper_at = wire.len() + RECORD_HEADER_SIZE + 2;
    wire.extend(to_wire(&app_message(b"bad record"), &mut peer, &buffers));
    wire[tamper_at] ^= 0xff;

    let sock = Arc::new(ScriptedSocket::new(wire, 1400));
    let (mut port, handler) = steady_port(sock, key, &buffers, 1);

    let mut failure = None;
    settle(|| match port.run() {
        Ok(()) => false,
        Err(error) => {
            failure = Some(error);
            true
        }
    });

    assert_eq!(failure, Some(NetworkError::Fatal(ErrorType::Crypto)));
    assert!(Err::<(), _>(failure.unwrap()).has_failed());

    // The record before the corruption was delivered
    assert_eq!(handler.take(), vec![b"good record".to_vec()]);

    port.unregistered();
    assert_eq!(buffers.outstanding(), 0);
}
