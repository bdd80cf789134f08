//! Event-driven service host.
//!
//! A *service* is a named unix listening socket plus a set of callbacks; the
//! supervisor forks `nprocs` worker processes per service and every worker
//! races accept on the inherited socket. Inside a worker, each accepted
//! client occupies a *slot* whose behavior is a pair of replaceable
//! readable/writable actions: handlers express their protocol as a state
//! machine by swapping those actions as the conversation advances.
//!
//! Workers are strictly single-threaded; no two callbacks of one worker ever
//! run concurrently, and a callback always runs to completion. Signals
//! (child exits, termination) enter the loop through a signalfd and become
//! ordinary events.

mod slot;
mod supervisor;
mod worker;

pub use slot::{ClientCtx, SideChannel, Slot};
pub use supervisor::{serve, serve_single, Service};
pub use worker::Worker;

use plinth::logging::Logger;
use std::io;
use std::time::Duration;

/// Per-client callback. Receives the module (service-level state) and the
/// dispatch context for the client slot the event belongs to.
pub type Action<M> = fn(&mut M, &mut ClientCtx<'_, M>);

/// Hook invoked outside of dispatch: client teardown and slot finalization.
pub type ConnHook<M: Module> = fn(&mut M, &mut <M as Module>::Conn, &Logger);

/// Service-level state living in each worker process. One value is built
/// per worker, after the fork, and every callback of that worker sees it.
pub trait Module: Sized + 'static {
    /// Per-client handler state, reset for each accepted connection.
    type Conn: Default + 'static;

    /// Torn down when the worker exits.
    fn detach(&mut self, _log: &Logger) {}

    /// Periodic tick, driven by the service's `tick` period.
    fn on_tick(&mut self, _log: &Logger) {}

    /// A child process of this worker was reaped.
    fn on_child_reaped(
        &mut self,
        _pid: nix::unistd::Pid,
        _status: nix::sys::wait::WaitStatus,
        _log: &Logger,
    ) {
    }
}

/// Callback pair applied after a queued send drains. Both actions `None`
/// closes the slot once the last byte is out.
pub struct Transition<M: Module> {
    pub read: Option<Action<M>>,
    pub write: Option<Action<M>>,
    /// Dispatch the new readable action on the next loop pass without
    /// waiting for readiness.
    pub defer: bool,
}

impl<M: Module> Transition<M> {
    /// Close the slot after the send drains.
    pub fn close() -> Transition<M> {
        Transition {
            read: None,
            write: None,
            defer: false,
        }
    }

    pub fn then_read(action: Action<M>) -> Transition<M> {
        Transition {
            read: Some(action),
            write: None,
            defer: false,
        }
    }

    /// Re-enter `action` immediately after the drain, without waiting for
    /// readability. Used when buffered input may already hold the next
    /// request.
    pub fn then_read_deferred(action: Action<M>) -> Transition<M> {
        Transition {
            read: Some(action),
            write: None,
            defer: true,
        }
    }
}

/// Immutable description of one service.
pub struct ServiceDef<M: Module> {
    pub name: &'static str,
    /// Socket file name, relative to the daemon basepath.
    pub sock: &'static str,
    pub nprocs: u32,
    pub max_clients: usize,
    pub tick: Option<Duration>,
    /// Per-connection frame ceiling.
    pub max_frame: usize,
    /// Initial readable action for accepted clients.
    pub on_start: Action<M>,
    /// Runs exactly once per accepted client, at teardown of that client.
    pub on_client_done: Option<ConnHook<M>>,
    /// Runs exactly once per slot when the worker exits.
    pub on_finalize: Option<ConnHook<M>>,
    /// Builds the module in the worker process.
    pub init: Box<dyn Fn(&Logger) -> io::Result<M> + Send + Sync>,
}

impl<M: Module> ServiceDef<M> {
    pub fn new<F>(
        name: &'static str,
        sock: &'static str,
        on_start: Action<M>,
        init: F,
    ) -> ServiceDef<M>
    where
        F: Fn(&Logger) -> io::Result<M> + Send + Sync + 'static,
    {
        ServiceDef {
            name,
            sock,
            nprocs: 1,
            max_clients: 1024,
            tick: None,
            max_frame: crate::net::wire::DEFAULT_LIMIT,
            on_start,
            on_client_done: None,
            on_finalize: None,
            init: Box::new(init),
        }
    }

    pub fn nprocs(mut self, nprocs: u32) -> Self {
        self.nprocs = nprocs.max(1);
        self
    }

    pub fn max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn tick(mut self, period: Duration) -> Self {
        self.tick = Some(period);
        self
    }

    pub fn max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    pub fn on_client_done(mut self, hook: ConnHook<M>) -> Self {
        self.on_client_done = Some(hook);
        self
    }

    pub fn on_finalize(mut self, hook: ConnHook<M>) -> Self {
        self.on_finalize = Some(hook);
        self
    }
}

/// The subset of a `ServiceDef` a worker needs at dispatch time. Copyable
/// because actions are plain fn pointers.
pub(crate) struct Hooks<M: Module> {
    pub name: &'static str,
    pub max_clients: usize,
    pub tick: Option<Duration>,
    pub max_frame: usize,
    pub on_start: Action<M>,
    pub on_client_done: Option<ConnHook<M>>,
    pub on_finalize: Option<ConnHook<M>>,
}

impl<M: Module> Clone for Hooks<M> {
    fn clone(&self) -> Self {
        Hooks { ..*self }
    }
}

impl<M: Module> Copy for Hooks<M> {}

impl<M: Module> Hooks<M> {
    pub(crate) fn from_def(def: &ServiceDef<M>) -> Hooks<M> {
        Hooks {
            name: def.name,
            max_clients: def.max_clients,
            tick: def.tick,
            max_frame: def.max_frame,
            on_start: def.on_start,
            on_client_done: def.on_client_done,
            on_finalize: def.on_finalize,
        }
    }
}
