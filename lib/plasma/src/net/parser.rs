use crate::net::buffer::{BufCont, BufferPool};
use byteorder::{BigEndian, ByteOrder};
use ion::shared::{ErrorType, NetworkError, NetworkResult};

/// Application messages are length-prefixed with a big-endian u32.
pub const MESSAGE_PREFIX_SIZE: usize = 4;

/// Reassembles length-prefixed application messages from the cleartext
/// stream. A record may carry any number of complete or partial messages
/// and a message may span records; partial prefixes and partially filled
/// message containers survive between calls.
pub struct MessageParser {
    prefix: [u8; MESSAGE_PREFIX_SIZE],
    prefix_filled: usize,
    pending: Option<BufCont>,
    max_message: usize,
}

impl MessageParser {
    #[inline]
    pub fn new(max_message: usize) -> MessageParser {
        MessageParser {
            prefix: [0; MESSAGE_PREFIX_SIZE],
            prefix_filled: 0,
            pending: None,
            max_message,
        }
    }

    /// Consumes `src` entirely, appending every completed message to `out`.
    /// Message containers are allocated at the exact serialized size.
    pub fn extract(
        &mut self,
        mut src: &[u8],
        pool: &BufferPool,
        out: &mut Vec<BufCont>,
    ) -> NetworkResult<()> {
        while !src.is_empty() {
            // Fill the message being accumulated first
            if let Some(mut pending) = self.pending.take() {
                let take = pending.free_capacity().min(src.len());
                pending.write_slice()[..take].copy_from_slice(&src[..take]);
                pending.move_tail(take);
                src = &src[take..];

                if pending.free_capacity() == 0 {
                    out.push(pending);
                } else {
                    self.pending = Some(pending);
                }
                continue;
            }

            // Accumulate the length prefix, possibly across records
            let take = (MESSAGE_PREFIX_SIZE - self.prefix_filled).min(src.len());
            self.prefix[self.prefix_filled..self.prefix_filled + take]
                .copy_from_slice(&src[..take]);
            self.prefix_filled += take;
            src = &src[take..];

            if self.prefix_filled < MESSAGE_PREFIX_SIZE {
                break;
            }

            let length = BigEndian::read_u32(&self.prefix) as usize;
            self.prefix_filled = 0;

            if length == 0 {
                return Err(NetworkError::Fatal(ErrorType::EmptyPayload));
            }
            if length > self.max_message {
                return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
            }

            self.pending = Some(pool.allocate_exact(length));
        }

        Ok(())
    }

    /// True when no partial message or prefix is held.
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.pending.is_none() && self.prefix_filled == 0
    }

    /// Drops any partial state, releasing the held container.
    #[inline]
    pub fn reset(&mut self) {
        self.pending = None;
        self.prefix_filled = 0;
    }
}
