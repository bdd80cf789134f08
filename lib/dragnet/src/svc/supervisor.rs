//! Service supervision: socket binding, preforking, child tracking.
//!
//! The supervisor binds every service socket first, then forks `nprocs`
//! workers per service. Workers of one service share the inherited listening
//! descriptor and race accept on it; the kernel serializes the accepts. The
//! supervisor itself never accepts. Crashed workers are not restarted; their
//! failure is reflected in the serve result once all workers have exited.

use crate::svc::{Module, ServiceDef, Worker};
use nix::sys::signal::{kill, SigSet, Signal};
use nix::sys::signalfd::SignalFd;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use plinth::logging::{error, info, o, warn, Logger};
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Object-safe face of a `ServiceDef`, so one supervisor can host services
/// with different module types.
pub trait Service {
    fn name(&self) -> &'static str;
    fn nprocs(&self) -> u32;
    fn bind(&self, base: &Path, log: &Logger) -> io::Result<OwnedFd>;
    fn run_worker(&self, listener: RawFd, stop: Arc<AtomicBool>, log: &Logger)
        -> io::Result<()>;
}

impl<M: Module> Service for ServiceDef<M> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn nprocs(&self) -> u32 {
        self.nprocs.max(1)
    }

    /// Bind the service's unix socket under the basepath. A stale socket
    /// file from a previous run is replaced. The socket itself is the
    /// authentication surface; the basepath directory carries the real
    /// permissions, so the socket file is opened wide.
    fn bind(&self, base: &Path, log: &Logger) -> io::Result<OwnedFd> {
        let path = base.join(self.sock);
        if path.exists() {
            fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o777))?;

        info!(log, "service bound"; "svc" => self.name, "path" => path.display().to_string());
        Ok(listener.into())
    }

    fn run_worker(
        &self,
        listener: RawFd,
        stop: Arc<AtomicBool>,
        log: &Logger,
    ) -> io::Result<()> {
        // before module init: threads the module spawns must inherit the
        // blocked mask, or signal delivery bypasses the worker's signalfd
        crate::svc::worker::block_service_signals()?;
        let module = (self.init)(log)?;
        let mut worker = Worker::new(self, module, listener, stop, log.clone())?;
        worker.run()
    }
}

/// Bind all services, prefork their workers, then supervise until every
/// worker has exited. SIGTERM/SIGINT are forwarded to the workers.
pub fn serve(base: &Path, services: &[&dyn Service], log: &Logger) -> io::Result<()> {
    let mut listeners = Vec::with_capacity(services.len());
    for svc in services {
        listeners.push(svc.bind(base, log)?);
    }

    // block before forking so every child inherits the mask its own
    // signalfd needs
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGINT);
    mask.thread_block().map_err(io::Error::from)?;
    let sigfd = SignalFd::new(&mask).map_err(io::Error::from)?;

    let mut children: Vec<Pid> = Vec::new();
    for (svc, listener) in services.iter().zip(&listeners) {
        for proc_no in 0..svc.nprocs() {
            match unsafe { fork() }.map_err(io::Error::from)? {
                ForkResult::Parent { child } => {
                    info!(log, "worker forked";
                          "svc" => svc.name(), "proc" => proc_no, "pid" => child.as_raw());
                    children.push(child);
                }
                ForkResult::Child => {
                    let stop = Arc::new(AtomicBool::new(false));
                    let worker_log = log.new(o!("svc" => svc.name(), "proc" => proc_no));
                    let code = match svc.run_worker(listener.as_raw_fd(), stop, &worker_log) {
                        Ok(()) => 0,
                        Err(err) => {
                            error!(worker_log, "worker failed"; "error" => %err);
                            1
                        }
                    };
                    std::process::exit(code);
                }
            }
        }
    }

    supervise(sigfd, children, log)
}

/// Run one service's worker in-process, without forking. This is the
/// `--single` mode and the embedding path for tests.
pub fn serve_single(
    svc: &dyn Service,
    base: &Path,
    stop: Arc<AtomicBool>,
    log: &Logger,
) -> io::Result<()> {
    let listener = svc.bind(base, log)?;
    svc.run_worker(listener.as_raw_fd(), stop, log)
}

fn supervise(mut sigfd: SignalFd, mut children: Vec<Pid>, log: &Logger) -> io::Result<()> {
    let mut failures = 0usize;

    while !children.is_empty() {
        match sigfd.read_signal() {
            Ok(Some(si)) => {
                let signo = si.ssi_signo as i32;
                if signo == Signal::SIGCHLD as i32 {
                    reap(&mut children, &mut failures, log);
                } else if signo == Signal::SIGTERM as i32 || signo == Signal::SIGINT as i32 {
                    info!(log, "forwarding termination to workers"; "count" => children.len());
                    for pid in &children {
                        let _ = kill(*pid, Signal::SIGTERM);
                    }
                }
            }
            Ok(None) => {}
            Err(nix::errno::Errno::EINTR) => {}
            Err(err) => return Err(io::Error::from(err)),
        }
    }

    if failures > 0 {
        return Err(io::Error::other(format!("{} worker(s) failed", failures)));
    }
    Ok(())
}

fn reap(children: &mut Vec<Pid>, failures: &mut usize, log: &Logger) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                let Some(pid) = status.pid() else { break };
                children.retain(|p| *p != pid);
                match status {
                    WaitStatus::Exited(_, 0) => {
                        info!(log, "worker exited"; "pid" => pid.as_raw());
                    }
                    other => {
                        warn!(log, "worker died"; "pid" => pid.as_raw(), "status" => ?other);
                        *failures += 1;
                    }
                }
            }
            Err(nix::errno::Errno::ECHILD) => {
                children.clear();
                break;
            }
            Err(err) => {
                error!(log, "waitpid failed"; "error" => %err);
                break;
            }
        }
    }
}
