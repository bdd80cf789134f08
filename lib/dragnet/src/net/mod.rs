//! I/O primitives shared by the event loops: error plumbing, byte buffers,
//! netstring framing, framed message streams with fd passing, and outbound
//! TCP connection setup.

pub mod buffer;
pub mod fdpass;
pub mod netstring;
pub mod support;
pub mod tcp;
pub mod wire;

pub use buffer::Buffer;
pub use support::{Cause, FdIo, NetError, NetResult};
pub use wire::Wire;
