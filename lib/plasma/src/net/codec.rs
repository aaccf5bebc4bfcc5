use crate::net::buffer::{BufCont, BufferPool};
use byteorder::{BigEndian, ByteOrder};
use ion::crypto;
use ion::shared::{ErrorType, NetworkError, NetworkResult};

/// TLS record header: content type, two version bytes, big-endian payload
/// length.
pub const RECORD_HEADER_SIZE: usize = 5;

/// Upper bound on an accepted record payload: 2^14 plaintext bytes plus an
/// allowance for cipher overhead. Anything larger fails the connection
/// before a container is allocated for it.
pub const MAX_RECORD_PAYLOAD: usize = 16384 + 256;

/// Largest plaintext fragment handed to `wrap` in one call. Records carry
/// at most 2^14 plaintext bytes, so feeding larger fragments would only
/// force the codec to fragment internally.
pub const MAX_FRAGMENT: usize = 16384;

const APPLICATION_DATA: u8 = 23;
const VERSION_MAJOR: u8 = 3;
const VERSION_MINOR: u8 = 3;

/// Payload length encoded in a record header.
#[inline]
pub fn record_payload_len(header: &[u8]) -> usize {
    BigEndian::read_u16(&header[3..5]) as usize
}

#[inline]
pub(crate) fn write_record_header(header: &mut [u8], payload_len: usize) {
    header[0] = APPLICATION_DATA;
    header[1] = VERSION_MAJOR;
    header[2] = VERSION_MINOR;
    BigEndian::write_u16(&mut header[3..5], payload_len as u16);
}

/// Record-level decrypt primitive. Engines are not thread safe; the
/// single-flight discipline of the owning gateway serializes access.
pub trait Decrypter: Send {
    /// Consumes one complete record and appends the cleartext at the tail
    /// of `dst`. Returns the number of cleartext bytes produced.
    fn unwrap(&mut self, record: &[u8], dst: &mut BufCont) -> NetworkResult<usize>;
}

/// Record-level encrypt primitive.
pub trait Encrypter: Send {
    /// Encrypts one plaintext fragment of at most `MAX_FRAGMENT` bytes into
    /// a pooled ciphertext record.
    fn wrap(&mut self, fragment: &[u8], pool: &BufferPool) -> NetworkResult<BufCont>;
}

/// Sequence-numbered AEAD record encrypter producing TLS-shaped records:
/// a 5-byte header followed by the sealed payload. Used once the handshake
/// has been terminated elsewhere and both sides hold the record keys.
pub struct RecordEncrypter {
    key: [u8; crypto::KEY_SIZE],
    sequence: u64,
}

impl RecordEncrypter {
    #[inline]
    pub fn new(key: [u8; crypto::KEY_SIZE]) -> RecordEncrypter {
        RecordEncrypter { key, sequence: 0 }
    }
}

impl Encrypter for RecordEncrypter {
    fn wrap(&mut self, fragment: &[u8], pool: &BufferPool) -> NetworkResult<BufCont> {
        if fragment.len() > MAX_FRAGMENT {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        let payload = fragment.len() + crypto::MAC_SIZE;
        let mut record = pool.allocate_exact(RECORD_HEADER_SIZE + payload);

        {
            let (header, body) = record.write_slice().split_at_mut(RECORD_HEADER_SIZE);
            write_record_header(header, payload);

            if !crypto::seal(body, fragment, header, self.sequence, &self.key) {
                return Err(NetworkError::Fatal(ErrorType::Crypto));
            }
        }

        record.move_tail(RECORD_HEADER_SIZE + payload);
        self.sequence += 1;

        Ok(record)
    }
}

/// Counterpart of `RecordEncrypter`.
pub struct RecordDecrypter {
    key: [u8; crypto::KEY_SIZE],
    sequence: u64,
}

impl RecordDecrypter {
    #[inline]
    pub fn new(key: [u8; crypto::KEY_SIZE]) -> RecordDecrypter {
        RecordDecrypter { key, sequence: 0 }
    }
}

impl Decrypter for RecordDecrypter {
    fn unwrap(&mut self, record: &[u8], dst: &mut BufCont) -> NetworkResult<usize> {
        if record.len() < RECORD_HEADER_SIZE {
            return Err(NetworkError::Fatal(ErrorType::Crypto));
        }

        let (header, body) = record.split_at(RECORD_HEADER_SIZE);
        let payload = record_payload_len(header);

        if payload != body.len() || payload < crypto::MAC_SIZE {
            return Err(NetworkError::Fatal(ErrorType::Crypto));
        }

        let cleartext = payload - crypto::MAC_SIZE;
        if cleartext > dst.free_capacity() {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        if !crypto::open(&mut dst.write_slice()[..cleartext], body, header, self.sequence, &self.key) {
            return Err(NetworkError::Fatal(ErrorType::Crypto));
        }

        dst.move_tail(cleartext);
        self.sequence += 1;

        Ok(cleartext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let pool = BufferPool::new(1024);
        let key = crypto::random_key();
        let mut encrypter = RecordEncrypter::new(key);
        let mut decrypter = RecordDecrypter::new(key);

        let record = encrypter.wrap(b"hello over the wire", &pool).unwrap();
        assert_eq!(
            record.remaining(),
            RECORD_HEADER_SIZE + b"hello over the wire".len() + crypto::MAC_SIZE
        );

        let mut dst = pool.allocate_exact(256);
        let produced = decrypter.unwrap(record.read_slice(), &mut dst).unwrap();

        assert_eq!(produced, b"hello over the wire".len());
        assert_eq!(dst.read_slice(), b"hello over the wire");

        record.discard();
        drop(dst);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_wrap_rejects_oversize_fragment() {
        let pool = BufferPool::new(1024);
        let mut encrypter = RecordEncrypter::new(crypto::random_key());

        let fragment = vec![0u8; MAX_FRAGMENT + 1];
        let result = encrypter.wrap(&fragment, &pool);

        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::PayloadTooLarge));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_unwrap_rejects_tampered_record() {
        let pool = BufferPool::new(1024);
        let key = crypto::random_key();
        let mut encrypter = RecordEncrypter::new(key);
        let mut decrypter = RecordDecrypter::new(key);

        let record = encrypter.wrap(b"payload", &pool).unwrap();
        let mut bytes = record.read_slice().to_vec();
        record.discard();
        bytes[RECORD_HEADER_SIZE] ^= 1;

        let mut dst = pool.allocate_exact(256);
        let result = decrypter.unwrap(&bytes, &mut dst);

        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::Crypto));
        assert_eq!(dst.remaining(), 0);
    }

    #[test]
    fn test_unwrap_rejects_sequence_skew() {
        let pool = BufferPool::new(1024);
        let key = crypto::random_key();
        let mut encrypter = RecordEncrypter::new(key);
        let mut decrypter = RecordDecrypter::new(key);

        // Two records arriving out of order must not authenticate.
        let first = encrypter.wrap(b"first", &pool).unwrap();
        let second = encrypter.wrap(b"second", &pool).unwrap();
        first.discard();

        let mut dst = pool.allocate_exact(256);
        let result = decrypter.unwrap(second.read_slice(), &mut dst);

        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::Crypto));
    }

    #[test]
    fn test_header_length_roundtrip() {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        write_record_header(&mut header, 12345);

        assert_eq!(header[0], APPLICATION_DATA);
        assert_eq!(record_payload_len(&header), 12345);
    }
}
