use byteorder::{BigEndian, WriteBytesExt};
use ctor::ctor;
use libsodium_sys;

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

const NONCE_OFFSET: usize = NONCE_SIZE - 8;

/// Initialize the sodium infrastructure
#[ctor]
fn init_sodium() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Derives the per-record nonce from the 64-bit record sequence. Sequences
/// never repeat under a given key, so neither do nonces.
#[inline]
fn sequence_nonce(sequence: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    (&mut nonce[NONCE_OFFSET..])
        .write_u64::<BigEndian>(sequence)
        .expect("Error deriving nonce");
    nonce
}

/// Seals one record. The cipher destination must be exactly the plain
/// length plus `MAC_SIZE`; the associated data and sequence must match on
/// the opening side. Returns false on any mismatch or sodium failure.
#[inline]
pub fn seal(
    cipher: &mut [u8],
    plain: &[u8],
    additional_data: &[u8],
    sequence: u64,
    key: &[u8; KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + MAC_SIZE {
        return false;
    }

    let nonce = sequence_nonce(sequence);

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
            cipher.as_mut_ptr(),
            ::std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Opens one record sealed by `seal`. The plain destination must be exactly
/// the cipher length minus `MAC_SIZE`. Returns false when authentication
/// fails or the sizes do not line up.
#[inline]
pub fn open(
    plain: &mut [u8],
    cipher: &[u8],
    additional_data: &[u8],
    sequence: u64,
    key: &[u8; KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + MAC_SIZE {
        return false;
    }

    let nonce = sequence_nonce(sequence);

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
            plain.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Fills the provided buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Generates a fresh random key.
#[inline]
pub fn random_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    random_bytes(&mut key);
    key
}
