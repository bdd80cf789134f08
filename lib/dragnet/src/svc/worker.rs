//! The per-process worker loop: accept, poll, dispatch, tick, reap.

use crate::net::support::{FdIo, NetError};
use crate::svc::slot::{SideChannel, Slot, SlotFd};
use crate::svc::{ClientCtx, Hooks, Module, ServiceDef};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use plinth::logging::{debug, error, info, o, trace, warn, Logger};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LISTEN_TOKEN: Token = Token(usize::MAX);
const SIGNAL_TOKEN: Token = Token(usize::MAX - 1);

/// Upper bound on poll blocking, so stop requests and ticks are observed
/// even on idle workers.
const DEFAULT_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy)]
enum Which {
    Read,
    Write,
}

/// Block the signals the worker's signalfd consumes. Must run before any
/// thread the module might spawn, so the whole process keeps them blocked
/// and delivery can only happen through the signalfd.
pub(crate) fn block_service_signals() -> io::Result<SigSet> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGINT);
    mask.thread_block().map_err(io::Error::from)?;
    Ok(mask)
}

pub struct Worker<M: Module> {
    hooks: Hooks<M>,
    module: M,
    listener: RawFd,
    poll: Poll,
    events: Events,
    sigfd: SignalFd,
    slots: Vec<Option<Box<Slot<M>>>>,
    free: Vec<usize>,
    live: indexmap::IndexSet<usize>,
    attach_q: Vec<SideChannel<M>>,
    last_tick: Instant,
    stop: Arc<AtomicBool>,
    log: Logger,
}

impl<M: Module> Worker<M> {
    /// Build a worker around an already-listening socket. The listener fd is
    /// borrowed, not owned: with preforking, every worker of a service
    /// shares the one inherited descriptor.
    pub fn new(
        def: &ServiceDef<M>,
        module: M,
        listener: RawFd,
        stop: Arc<AtomicBool>,
        log: Logger,
    ) -> io::Result<Worker<M>> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut SourceFd(&listener), LISTEN_TOKEN, Interest::READABLE)?;

        // termination and child exits arrive as loop events
        let mask = block_service_signals()?;
        let sigfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(io::Error::from)?;
        let sigraw = sigfd.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&sigraw), SIGNAL_TOKEN, Interest::READABLE)?;

        Ok(Worker {
            hooks: Hooks::from_def(def),
            module,
            listener,
            poll,
            events: Events::with_capacity(256),
            sigfd,
            slots: Vec::new(),
            free: Vec::new(),
            live: indexmap::IndexSet::new(),
            attach_q: Vec::new(),
            last_tick: Instant::now(),
            stop,
            log,
        })
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn live_clients(&self) -> usize {
        self.live.len()
    }

    /// Serve until a stop is requested, then tear down every slot.
    pub fn run(&mut self) -> io::Result<()> {
        info!(self.log, "worker serving"; "svc" => self.hooks.name);
        while !self.stop.load(Ordering::SeqCst) {
            self.step()?;
        }
        info!(self.log, "worker stopping"; "svc" => self.hooks.name);
        self.teardown();
        Ok(())
    }

    /// One loop pass: deferred dispatch, poll, event dispatch, attachments,
    /// tick. Public so embedding code and tests can drive the worker
    /// deterministically.
    pub fn step(&mut self) -> io::Result<()> {
        // deferred actions run before the next poll syscall
        self.dispatch_deferred();
        self.process_attachments();

        let timeout = self.poll_timeout();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        let batch: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|ev| (ev.token(), ev.is_readable() || ev.is_read_closed(), ev.is_writable()))
            .collect();

        for (token, readable, writable) in batch {
            match token {
                LISTEN_TOKEN => self.accept_clients(),
                SIGNAL_TOKEN => self.drain_signals(),
                Token(idx) => {
                    if readable {
                        self.run_action(idx, Which::Read);
                    }
                    if writable {
                        self.handle_writable(idx);
                    }
                }
            }
        }

        self.process_attachments();
        self.maybe_tick();
        Ok(())
    }

    fn poll_timeout(&self) -> Duration {
        match self.hooks.tick {
            Some(period) => {
                let since = self.last_tick.elapsed();
                period.saturating_sub(since).min(DEFAULT_POLL)
            }
            None => DEFAULT_POLL,
        }
    }

    fn maybe_tick(&mut self) {
        if let Some(period) = self.hooks.tick {
            if self.last_tick.elapsed() >= period {
                // signal delivery can race threads that were started before
                // the mask was blocked; the tick doubles as a reap fallback
                self.reap_children();
                self.module.on_tick(&self.log);
                self.last_tick = Instant::now();
            }
        }
    }

    fn dispatch_deferred(&mut self) {
        loop {
            let pending: Vec<(usize, bool, bool)> = self
                .live
                .iter()
                .copied()
                .filter_map(|idx| {
                    self.slots[idx].as_ref().and_then(|slot| {
                        if slot.deferred || slot.deferred_write {
                            Some((idx, slot.deferred, slot.deferred_write))
                        } else {
                            None
                        }
                    })
                })
                .collect();
            if pending.is_empty() {
                return;
            }

            for (idx, read, write) in pending {
                if let Some(slot) = self.slots[idx].as_mut() {
                    slot.deferred = false;
                    slot.deferred_write = false;
                } else {
                    continue;
                }
                if read {
                    self.run_action(idx, Which::Read);
                }
                if write {
                    self.run_action(idx, Which::Write);
                }
            }
        }
    }

    fn accept_clients(&mut self) {
        loop {
            let raw = unsafe {
                libc::accept4(
                    self.listener,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if raw < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        error!(self.log, "accept failed"; "svc" => self.hooks.name, "error" => %err);
                        break;
                    }
                }
            }

            let fd = unsafe { OwnedFd::from_raw_fd(raw) };
            self.attach(
                SlotFd::Owned(fd),
                Some(self.hooks.on_start),
                None,
                M::Conn::default(),
            );
        }
    }

    /// Bind an fd to a slot and start watching it. Full service: the fd is
    /// closed (when owned) and the connection silently dropped.
    fn attach(
        &mut self,
        fd: SlotFd,
        read: Option<crate::svc::Action<M>>,
        write: Option<crate::svc::Action<M>>,
        conn: M::Conn,
    ) {
        if self.live.len() >= self.hooks.max_clients {
            warn!(self.log, "client limit reached, rejecting";
                  "svc" => self.hooks.name, "limit" => self.hooks.max_clients);
            return; // dropping an owned fd closes it
        }

        let Some(raw) = fd.raw() else { return };

        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Some(Box::new(Slot::new(
                    self.hooks.max_frame,
                    self.log.clone(),
                ))));
                self.slots.len() - 1
            }
        };

        let slot_log = self.log.new(o!("client" => idx));
        self.slots[idx]
            .as_mut()
            .expect("pooled slot present")
            .open(fd, read, write, conn, slot_log);

        match self.poll.registry().register(
            &mut SourceFd(&raw),
            Token(idx),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            Ok(()) => {
                self.live.insert(idx);
                trace!(self.log, "client attached"; "client" => idx);
            }
            Err(err) => {
                error!(self.log, "client registration failed"; "client" => idx, "error" => %err);
                if let Some(slot) = self.slots[idx].as_mut() {
                    slot.close();
                }
                self.free.push(idx);
            }
        }
    }

    fn process_attachments(&mut self) {
        for channel in std::mem::take(&mut self.attach_q) {
            self.attach(channel.fd, channel.read, channel.write, channel.conn);
        }
    }

    fn run_action(&mut self, idx: usize, which: Which) {
        let Some(mut slot) = self.slots[idx].take() else {
            return;
        };
        if !slot.is_open() {
            self.slots[idx] = Some(slot);
            return;
        }

        let action = match which {
            Which::Read => slot.read_action,
            Which::Write => slot.write_action,
        };

        if let Some(action) = action {
            let log = slot.log.clone();
            let mut ctx = ClientCtx {
                slot: &mut slot,
                attach_q: &mut self.attach_q,
                log,
            };
            action(&mut self.module, &mut ctx);
        }

        self.slots[idx] = Some(slot);
        self.settle(idx);
    }

    fn handle_writable(&mut self, idx: usize) {
        let has_queue = match self.slots[idx].as_ref() {
            Some(slot) if slot.is_open() => !slot.wq.is_empty(),
            _ => return,
        };

        if has_queue {
            self.settle(idx);
        } else {
            self.run_action(idx, Which::Write);
        }
    }

    /// Post-dispatch bookkeeping for one slot: flush the write queue, apply
    /// the post-drain transition, schedule deferred redispatch for buffered
    /// frames, and release the slot once it has drained out.
    fn settle(&mut self, idx: usize) {
        {
            let Some(slot) = self.slots[idx].as_mut() else {
                return;
            };
            if !slot.is_open() {
                return;
            }

            if !slot.wq.is_empty() {
                let fd = slot.fd.borrowed().expect("open slot has an fd");
                match slot.wq.drain_to(FdIo(fd)) {
                    Ok(_) => {
                        if let Some(next) = slot.after_drain.take() {
                            slot.read_action = next.read;
                            slot.write_action = next.write;
                            if next.defer && slot.read_action.is_some() {
                                slot.deferred = true;
                            }
                            if slot.read_action.is_none() && slot.write_action.is_none() {
                                slot.finished = true;
                            }
                        }
                    }
                    Err(NetError::Again) => {}
                    Err(err) => {
                        debug!(slot.log, "send to client failed"; "error" => %err);
                        slot.wq.clear();
                        slot.after_drain = None;
                        slot.finished = true;
                    }
                }
            }

            // a complete buffered frame will produce no further readiness
            // event; hand it to the readable action on the next pass
            if slot.read_action.is_some() && slot.wire.has_frame() {
                slot.deferred = true;
            }
        }

        let release = self.slots[idx]
            .as_ref()
            .map_or(false, |slot| slot.is_open() && slot.drained_out());
        if release {
            self.release(idx);
        }
    }

    /// Tear down one client: deregister, fire its done hook exactly once,
    /// return the slot to the pool (closing the fd if owned).
    fn release(&mut self, idx: usize) {
        let (raw, fire_done) = match self.slots[idx].as_mut() {
            Some(slot) if slot.is_open() => {
                let fire = !slot.done_fired;
                slot.done_fired = true;
                (slot.fd.raw(), fire)
            }
            _ => return,
        };

        if let Some(raw) = raw {
            let _ = self.poll.registry().deregister(&mut SourceFd(&raw));
        }

        if fire_done {
            if let (Some(hook), Some(slot)) =
                (self.hooks.on_client_done, self.slots[idx].as_mut())
            {
                let log = slot.log.clone();
                hook(&mut self.module, &mut slot.conn, &log);
            }
        }

        if let Some(slot) = self.slots[idx].as_mut() {
            trace!(slot.log, "client released");
            slot.close();
        }
        self.live.swap_remove(&idx);
        self.free.push(idx);
    }

    fn drain_signals(&mut self) {
        loop {
            match self.sigfd.read_signal() {
                Ok(Some(si)) => {
                    let signo = si.ssi_signo as i32;
                    if signo == Signal::SIGCHLD as i32 {
                        self.reap_children();
                    } else if signo == Signal::SIGTERM as i32 || signo == Signal::SIGINT as i32
                    {
                        info!(self.log, "termination signal"; "svc" => self.hooks.name, "signo" => signo);
                        self.stop.store(true, Ordering::SeqCst);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!(self.log, "signalfd read failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn reap_children(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    let Some(pid) = status.pid() else { break };
                    debug!(self.log, "reaped child"; "pid" => pid.as_raw());
                    self.module.on_child_reaped(pid, status, &self.log);
                }
                Err(Errno::ECHILD) => break,
                Err(err) => {
                    error!(self.log, "waitpid failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    /// Worker exit: release live clients (their done hooks fire), then run
    /// the finalize hook once per allocated slot, then detach the module.
    fn teardown(&mut self) {
        let live: Vec<usize> = self.live.iter().copied().collect();
        for idx in live {
            self.release(idx);
        }

        if let Some(hook) = self.hooks.on_finalize {
            for idx in 0..self.slots.len() {
                let Some(slot) = self.slots[idx].as_mut() else {
                    continue;
                };
                let log = slot.log.clone();
                hook(&mut self.module, &mut slot.conn, &log);
            }
        }

        self.module.detach(&self.log);
    }
}
