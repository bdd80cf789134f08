//! Client slots and the dispatch context handlers program against.

use crate::net::fdpass;
use crate::net::support::{Cause, FdIo, NetError, NetResult};
use crate::net::{Buffer, Wire};
use crate::svc::{Action, Module, Transition};
use plinth::logging::Logger;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Instant;

// write queues hold at most one maximum frame plus envelope slack
const WQ_SLACK: usize = 64;

/// A slot's descriptor. Foreign descriptors are attached but not owned:
/// their lifetime is managed elsewhere (a client still holding its copy, a
/// capture socket owned by the module) and slot teardown must not close
/// them.
pub(crate) enum SlotFd {
    Owned(OwnedFd),
    Foreign(RawFd),
    /// Pooled slot awaiting reuse.
    Empty,
}

impl SlotFd {
    pub(crate) fn raw(&self) -> Option<RawFd> {
        match self {
            SlotFd::Owned(fd) => Some(fd.as_raw_fd()),
            SlotFd::Foreign(raw) => Some(*raw),
            SlotFd::Empty => None,
        }
    }

    pub(crate) fn borrowed(&self) -> Option<BorrowedFd<'_>> {
        match self {
            SlotFd::Owned(fd) => Some(fd.as_fd()),
            // lifetime is vouched for by whoever attached the fd
            SlotFd::Foreign(raw) => Some(unsafe { BorrowedFd::borrow_raw(*raw) }),
            SlotFd::Empty => None,
        }
    }
}

/// Per-client record inside a worker. Slots are pooled: releasing a client
/// keeps the slot's buffers allocated for the next accept.
pub struct Slot<M: Module> {
    pub(crate) fd: SlotFd,
    pub(crate) conn: M::Conn,
    pub(crate) wire: Wire,
    pub(crate) read_action: Option<Action<M>>,
    pub(crate) write_action: Option<Action<M>>,
    pub(crate) deferred: bool,
    pub(crate) deferred_write: bool,
    pub(crate) finished: bool,
    pub(crate) done_fired: bool,
    pub(crate) wq: Buffer,
    pub(crate) after_drain: Option<Transition<M>>,
    pub(crate) created: Instant,
    pub(crate) log: Logger,
}

impl<M: Module> Slot<M> {
    pub(crate) fn new(max_frame: usize, log: Logger) -> Slot<M> {
        Slot {
            fd: SlotFd::Empty,
            conn: M::Conn::default(),
            wire: Wire::with_limit(max_frame),
            read_action: None,
            write_action: None,
            deferred: false,
            deferred_write: false,
            finished: false,
            done_fired: false,
            wq: Buffer::new(max_frame + WQ_SLACK),
            after_drain: None,
            created: Instant::now(),
            log,
        }
    }

    /// Arm a pooled slot for a new client. Buffers keep their allocations;
    /// everything else starts fresh.
    pub(crate) fn open(
        &mut self,
        fd: SlotFd,
        read: Option<Action<M>>,
        write: Option<Action<M>>,
        conn: M::Conn,
        log: Logger,
    ) {
        debug_assert!(matches!(self.fd, SlotFd::Empty), "slot already open");
        self.fd = fd;
        self.conn = conn;
        self.wire.reset();
        self.read_action = read;
        self.write_action = write;
        self.deferred = false;
        self.deferred_write = false;
        self.finished = false;
        self.done_fired = false;
        self.wq.clear();
        self.after_drain = None;
        self.created = Instant::now();
        self.log = log;
    }

    /// Disarm and return the slot to the pool. Owned fds close here.
    pub(crate) fn close(&mut self) {
        self.fd = SlotFd::Empty;
        self.conn = M::Conn::default();
        self.read_action = None;
        self.write_action = None;
        self.after_drain = None;
        self.deferred = false;
        self.deferred_write = false;
        self.wq.clear();
        self.wire.reset();
    }

    #[inline]
    pub(crate) fn is_open(&self) -> bool {
        !matches!(self.fd, SlotFd::Empty)
    }

    /// Ready for teardown: explicitly finished, or out of actions with
    /// nothing left to flush.
    pub(crate) fn drained_out(&self) -> bool {
        let idle = self.read_action.is_none()
            && self.write_action.is_none()
            && self.after_drain.is_none();
        (self.finished || idle) && self.wq.is_empty()
    }
}

/// A side-channel attachment request: an arbitrary fd the module wants
/// dispatched through the worker loop alongside accepted clients.
pub struct SideChannel<M: Module> {
    pub(crate) fd: SlotFd,
    pub(crate) read: Option<Action<M>>,
    pub(crate) write: Option<Action<M>>,
    pub(crate) conn: M::Conn,
}

impl<M: Module> SideChannel<M> {
    /// The worker owns and eventually closes the fd.
    pub fn owned(fd: OwnedFd, read: Option<Action<M>>, conn: M::Conn) -> SideChannel<M> {
        SideChannel {
            fd: SlotFd::Owned(fd),
            read,
            write: None,
            conn,
        }
    }

    /// The fd stays owned by the caller; the worker only watches it.
    pub fn foreign(fd: RawFd, read: Option<Action<M>>, conn: M::Conn) -> SideChannel<M> {
        SideChannel {
            fd: SlotFd::Foreign(fd),
            read,
            write: None,
            conn,
        }
    }
}

/// What an action sees while it runs: its slot, a logger scoped to the
/// client, and a way to request side-channel attachments.
pub struct ClientCtx<'a, M: Module> {
    pub(crate) slot: &'a mut Slot<M>,
    pub(crate) attach_q: &'a mut Vec<SideChannel<M>>,
    pub log: Logger,
}

impl<M: Module> ClientCtx<'_, M> {
    /// Per-client handler state.
    #[inline]
    pub fn conn(&mut self) -> &mut M::Conn {
        &mut self.slot.conn
    }

    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.slot.fd.raw().unwrap_or(-1)
    }

    /// Age of this client connection.
    pub fn age(&self) -> std::time::Duration {
        self.slot.created.elapsed()
    }

    /// Receive one framed message. `Again` until a full frame is buffered;
    /// pipelined frames are consumed one call at a time.
    pub fn recv_msg(&mut self) -> NetResult<Vec<u8>> {
        let fd = self
            .slot
            .fd
            .borrowed()
            .ok_or(NetError::Fatal(Cause::Closed))?;
        let eof = self.slot.wire.pump(FdIo(fd))?;
        match self.slot.wire.take_frame()? {
            Some(body) => Ok(body),
            None if eof => Err(NetError::Fatal(Cause::Closed)),
            None => Err(NetError::Again),
        }
    }

    /// Receive a passed file descriptor.
    pub fn recv_fd(&mut self) -> NetResult<OwnedFd> {
        let fd = self
            .slot
            .fd
            .borrowed()
            .ok_or(NetError::Fatal(Cause::Closed))?;
        fdpass::recv_fd(fd)
    }

    /// Pass a file descriptor to the client, optionally with an error code
    /// the client must honor by closing it.
    pub fn send_fd(&mut self, fd: BorrowedFd<'_>, err: i32) -> NetResult<()> {
        let sock = self
            .slot
            .fd
            .borrowed()
            .ok_or(NetError::Fatal(Cause::Closed))?;
        fdpass::send_fd(sock, fd, err)
    }

    /// Direct access to the framed-message state, e.g. to reset it between
    /// pipelined requests.
    #[inline]
    pub fn wire(&mut self) -> &mut Wire {
        &mut self.slot.wire
    }

    /// Replace the readable action. With `defer` set the new action runs on
    /// the next loop pass without waiting for readability.
    pub fn set_readable(&mut self, action: Option<Action<M>>, defer: bool) {
        self.slot.read_action = action;
        if defer && action.is_some() {
            self.slot.deferred = true;
        }
    }

    /// Replace the writable action. With `defer` set the new action runs
    /// on the next loop pass; an edge-triggered multiplexer reports no
    /// writable edge for a socket that was writable all along.
    pub fn set_writable(&mut self, action: Option<Action<M>>, defer: bool) {
        self.slot.write_action = action;
        if defer && action.is_some() {
            self.slot.deferred_write = true;
        }
    }

    /// Queue bytes for the client and apply `after` once they drain. The
    /// worker flushes opportunistically; the slot closes after drain when
    /// the transition clears both actions.
    pub fn enqueue(&mut self, bytes: &[u8], after: Transition<M>) -> NetResult<()> {
        self.slot.wq.append(bytes)?;
        self.slot.after_drain = Some(after);
        // queued data supersedes whatever the actions were doing
        self.slot.read_action = None;
        self.slot.write_action = None;
        Ok(())
    }

    /// Schedule teardown. `on_done` fires once any queued send has drained.
    pub fn finish(&mut self) {
        self.slot.finished = true;
        self.slot.read_action = None;
        self.slot.write_action = None;
    }

    /// Mark the slot's fd as foreign: teardown will not close it.
    pub fn mark_external(&mut self) {
        if matches!(self.slot.fd, SlotFd::Owned(_)) {
            let SlotFd::Owned(fd) = std::mem::replace(&mut self.slot.fd, SlotFd::Empty)
            else {
                unreachable!()
            };
            self.slot.fd = SlotFd::Foreign(fd.into_raw_fd());
        }
    }

    /// Attach another fd to this worker with its own actions and state.
    /// Processed after the current dispatch completes.
    pub fn add_side_channel(&mut self, channel: SideChannel<M>) {
        self.attach_q.push(channel);
    }
}
