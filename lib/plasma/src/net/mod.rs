//! Per-connection TLS pipeline. Inbound traffic is reframed on the I/O
//! thread, decrypted and delivered off-thread; outbound messages are
//! serialized on the I/O thread, encrypted and written off-thread. Each
//! stage is a single-flight FIFO, so per-connection order is total while
//! the shared crypto pool stays free to interleave connections.

pub mod buffer;
pub mod codec;
pub mod egress;
pub mod gateway;
pub mod ingress;
pub mod parser;
pub mod pool;
pub mod port;
