//! The event-driven core of the workspace: non-blocking buffers and framing,
//! fd passing over unix sockets, the preforked service host (`svc`), the DNS
//! resolver thread pool (`resolve`) and the bounded outbound scanner
//! (`scan`).
//!
//! All event loops here follow the same discipline: one thread per loop,
//! callbacks drive a per-connection state machine, every file descriptor has
//! exactly one owner at any moment, and teardown is deferred to well-defined
//! sweep points instead of happening mid-dispatch.

pub mod net;
pub mod proto;
pub mod resolve;
pub mod scan;
pub mod svc;
