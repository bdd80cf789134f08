//! The resolver service: clients pass an output fd, then send a framed
//! request with a delimited host list. Results stream into the output fd as
//! gzip-compressed `"host addr"` lines, produced concurrently by the
//! resolver pool. A socketpair half passed back to the client reaches EOF
//! exactly once, when the batch has fully completed.
//!
//! The client conversation pipelines: after a request is submitted the slot
//! goes straight back to waiting for the next output fd.

use dragnet::net::support::NetError;
use dragnet::proto::{self, ResolveReq};
use dragnet::resolve::{BatchSink, Pool, PoolOpts};
use dragnet::svc::{ClientCtx, Module, ServiceDef};
use flate2::write::GzEncoder;
use flate2::Compression;
use plinth::logging::{debug, info, Logger};
use std::fs::File;
use std::io::{self, Write};
use std::net::IpAddr;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Mutex;

pub const DEFAULT_RESOLVERS: usize = 10;

pub struct ResolverMod {
    pool: Pool,
}

impl ResolverMod {
    pub fn new(nthreads: usize, log: &Logger) -> io::Result<ResolverMod> {
        let pool = Pool::new(
            &PoolOpts {
                nthreads,
                stack_size: None,
            },
            log.clone(),
        )?;
        info!(log, "resolver pool started"; "threads" => nthreads);
        Ok(ResolverMod { pool })
    }
}

impl Module for ResolverMod {
    type Conn = ResolverConn;

    fn detach(&mut self, log: &Logger) {
        info!(log, "shutting down resolver pool");
        self.pool.shutdown();
    }
}

#[derive(Default)]
pub struct ResolverConn {
    /// Compressed result stream over the fd the client passed in.
    out: Option<GzEncoder<File>>,
    /// Our half of the completion socketpair; handed to the batch sink.
    signal_local: Option<OwnedFd>,
    /// The client's half; sent back, then closed here.
    signal_peer: Option<OwnedFd>,
    hosts: Option<String>,
}

/// Writes batch results into the compressed stream. Resolver threads call
/// `resolved` concurrently, so the stream sits behind a mutex; `done`
/// flushes the stream and drops the signal half, which is what the client
/// observes as EOF.
struct ResultSink {
    out: Mutex<Option<GzEncoder<File>>>,
    signal: Mutex<Option<OwnedFd>>,
}

impl BatchSink for ResultSink {
    fn resolved(&self, host: &str, addr: IpAddr) {
        let mut guard = self.out.lock().unwrap();
        if let Some(out) = guard.as_mut() {
            let _ = writeln!(out, "{} {}", host, addr);
        }
    }

    fn done(&self) {
        if let Some(out) = self.out.lock().unwrap().take() {
            let _ = out.finish();
        }
        drop(self.signal.lock().unwrap().take());
    }
}

pub fn service(nresolvers: usize) -> ServiceDef<ResolverMod> {
    ServiceDef::new("resolver", "resolver.sock", on_client, move |log| {
        ResolverMod::new(nresolvers, log)
    })
}

fn on_client(_module: &mut ResolverMod, ctx: &mut ClientCtx<'_, ResolverMod>) {
    ctx.set_readable(Some(on_read_fd), true);
}

fn on_read_fd(_module: &mut ResolverMod, ctx: &mut ClientCtx<'_, ResolverMod>) {
    match ctx.recv_fd() {
        Ok(fd) => {
            let file = File::from(fd);
            ctx.conn().out = Some(GzEncoder::new(file, Compression::default()));
            ctx.set_readable(Some(on_read_req), true);
        }
        Err(NetError::Again) => {}
        Err(err) => {
            debug!(ctx.log, "result fd receive failed"; "error" => %err);
            ctx.finish();
        }
    }
}

fn on_read_req(_module: &mut ResolverMod, ctx: &mut ClientCtx<'_, ResolverMod>) {
    let body = match ctx.recv_msg() {
        Ok(body) => body,
        Err(NetError::Again) => return,
        Err(err) => {
            debug!(ctx.log, "request receive failed"; "error" => %err);
            ctx.finish();
            return;
        }
    };

    let req: ResolveReq = match proto::from_body(&body) {
        Ok(req) => req,
        Err(err) => {
            debug!(ctx.log, "request parse failed"; "error" => %err);
            ctx.finish();
            return;
        }
    };

    // completion signal: one half travels to the client, the other lives
    // with the batch until the last result is written
    let (local, peer) = match nix::sys::socket::socketpair(
        nix::sys::socket::AddressFamily::Unix,
        nix::sys::socket::SockType::Stream,
        None,
        nix::sys::socket::SockFlag::empty(),
    ) {
        Ok(pair) => pair,
        Err(err) => {
            debug!(ctx.log, "socketpair failed"; "error" => %err);
            ctx.finish();
            return;
        }
    };

    let conn = ctx.conn();
    conn.signal_local = Some(local);
    conn.signal_peer = Some(peer);
    conn.hosts = Some(req.hosts);

    ctx.set_readable(None, false);
    ctx.set_writable(Some(on_send_signal_fd), true);
}

fn on_send_signal_fd(module: &mut ResolverMod, ctx: &mut ClientCtx<'_, ResolverMod>) {
    let peer = match ctx.conn().signal_peer.take() {
        Some(peer) => peer,
        None => {
            ctx.finish();
            return;
        }
    };

    match ctx.send_fd(peer.as_fd(), 0) {
        Ok(()) => drop(peer), // the client owns the passed copy now
        Err(NetError::Again) => {
            ctx.conn().signal_peer = Some(peer);
            return;
        }
        Err(err) => {
            debug!(ctx.log, "signal fd send failed"; "error" => %err);
            ctx.finish();
            return;
        }
    }

    let conn = ctx.conn();
    let (out, signal, hosts) = match (
        conn.out.take(),
        conn.signal_local.take(),
        conn.hosts.take(),
    ) {
        (Some(out), Some(signal), Some(hosts)) => (out, signal, hosts),
        _ => {
            ctx.finish();
            return;
        }
    };

    let sink = ResultSink {
        out: Mutex::new(Some(out)),
        signal: Mutex::new(Some(signal)),
    };

    debug!(ctx.log, "batch submitted"; "bytes" => hosts.len());
    module.pool.add(&hosts, Box::new(sink));

    // pipeline: wait for the next output fd
    ctx.set_writable(None, false);
    ctx.set_readable(Some(on_read_fd), true);
}
