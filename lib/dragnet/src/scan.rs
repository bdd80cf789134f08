//! Bounded outbound connection scanner.
//!
//! The scanner pulls targets from a producer callback, keeps at most
//! `max_clients` connections in flight, feeds readiness events back to the
//! caller and enforces one deadline per connection. Connections optionally
//! speak TLS; the handshake is driven non-blocking, re-arming read/write
//! interest as the TLS engine asks for it.
//!
//! Closing is deferred: callbacks and the deadline sweep only queue a
//! connection, and the queue is swept once per loop pass. A connection's fd
//! is deregistered and closed exactly once, and `on_done` fires exactly
//! once, after the close.

use crate::net::support::{Cause, FdIo, NetError, NetResult};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use openssl::ssl::{ErrorCode, SslConnector, SslStream, SslVerifyMode};
use plinth::logging::{debug, trace, Logger};
use plinth::time::Deadline;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

/// Wake from the multiplexer at least this often, so new targets are
/// initiated and deadlines observed even on idle batches.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Interest flags a producer may request for a new connection.
pub const READABLE: u8 = 1 << 0;
/// Writable interest that disarms itself after its first delivery.
pub const WRITABLE_ONESHOT: u8 = 1 << 1;
/// Drive a TLS handshake before dispatching data callbacks.
pub const TLS_HANDSHAKE: u8 = 1 << 2;

/// Producer verdict for one `on_connect` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// A target was produced and the dial slot is filled.
    Next,
    /// No more targets, ever.
    Done,
    /// Abort the scan.
    Err,
    /// No target right now; throttle this tick.
    Wait,
}

/// Callback result for readable/writable dispatch: the `>0 / 0 / <0`
/// contract expressed as a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    More,
    Close,
    Error,
}

/// Filled by the producer during `on_connect`.
pub struct Dial<D> {
    pub fd: Option<OwnedFd>,
    pub flags: u8,
    /// Server name for TLS handshakes (SNI); connections are not verified
    /// against it.
    pub tls_name: Option<String>,
    pub data: D,
}

pub trait Prober {
    type Data: Default;

    fn on_connect(&mut self, dial: &mut Dial<Self::Data>) -> Verdict;
    fn on_readable(&mut self, conn: &mut Probe<Self::Data>) -> Flow;
    fn on_writable(&mut self, conn: &mut Probe<Self::Data>) -> Flow;
    fn on_done(&mut self, conn: &mut Probe<Self::Data>);
}

pub struct ScanOpts {
    pub max_clients: usize,
    pub timeout: Duration,
    pub connects_per_tick: usize,
    pub mdelay_per_tick: Duration,
    pub tls: Option<SslConnector>,
}

impl Default for ScanOpts {
    fn default() -> ScanOpts {
        ScanOpts {
            max_clients: 16,
            timeout: Duration::from_secs(5),
            connects_per_tick: 8,
            mdelay_per_tick: Duration::ZERO,
            tls: None,
        }
    }
}

/// Raw-fd stream the TLS engine reads and writes through. The fd can be
/// pulled out at close time while the TLS session object stays alive for
/// certificate access.
struct FdStream(Option<OwnedFd>);

impl Read for FdStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.0 {
            Some(fd) => FdIo(fd.as_fd()).read(buf),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }
}

impl Write for FdStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.0 {
            Some(fd) => FdIo(fd.as_fd()).write(buf),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Link {
    Plain(Option<OwnedFd>),
    Tls(Box<SslStream<FdStream>>),
}

/// One in-flight connection.
pub struct Probe<D> {
    link: Link,
    flags: u8,
    deadline: Deadline,
    nread: u64,
    nwritten: u64,
    want_write: bool,
    pub data: D,
}

impl<D> Probe<D> {
    fn raw_fd(&self) -> Option<RawFd> {
        match &self.link {
            Link::Plain(fd) => fd.as_ref().map(|f| f.as_raw_fd()),
            Link::Tls(stream) => stream.get_ref().0.as_ref().map(|f| f.as_raw_fd()),
        }
    }

    /// Close the underlying fd. TLS session state survives so `on_done`
    /// can still extract the peer certificate chain.
    fn close_fd(&mut self) {
        match &mut self.link {
            Link::Plain(fd) => drop(fd.take()),
            Link::Tls(stream) => drop(stream.get_mut().0.take()),
        }
    }

    /// Read from the connection; TLS-transparent. `Ok(0)` is EOF.
    pub fn read(&mut self, buf: &mut [u8]) -> NetResult<usize> {
        match &mut self.link {
            Link::Plain(Some(fd)) => {
                let n = FdIo(fd.as_fd()).read(buf).map_err(NetError::from)?;
                self.nread += n as u64;
                Ok(n)
            }
            Link::Tls(stream) => match stream.ssl_read(buf) {
                Ok(n) => {
                    self.nread += n as u64;
                    Ok(n)
                }
                Err(err) => match err.code() {
                    ErrorCode::ZERO_RETURN => Ok(0),
                    ErrorCode::WANT_READ => Err(NetError::Again),
                    ErrorCode::WANT_WRITE => {
                        self.want_write = true;
                        Err(NetError::Again)
                    }
                    _ => Err(NetError::Fatal(Cause::Io(io::Error::other(
                        err.to_string(),
                    )))),
                },
            },
            _ => Err(NetError::Fatal(Cause::Closed)),
        }
    }

    /// Write to the connection; TLS-transparent.
    pub fn write(&mut self, buf: &[u8]) -> NetResult<usize> {
        match &mut self.link {
            Link::Plain(Some(fd)) => {
                let n = FdIo(fd.as_fd()).write(buf).map_err(NetError::from)?;
                self.nwritten += n as u64;
                Ok(n)
            }
            Link::Tls(stream) => match stream.ssl_write(buf) {
                Ok(n) => {
                    self.nwritten += n as u64;
                    Ok(n)
                }
                Err(err) => match err.code() {
                    ErrorCode::WANT_READ => Err(NetError::Again),
                    ErrorCode::WANT_WRITE => {
                        self.want_write = true;
                        Err(NetError::Again)
                    }
                    _ => Err(NetError::Fatal(Cause::Io(io::Error::other(
                        err.to_string(),
                    )))),
                },
            },
            _ => Err(NetError::Fatal(Cause::Closed)),
        }
    }

    /// Append the peer's certificate chain in PEM form. A no-op for plain
    /// connections and for handshakes that never completed.
    pub fn cert_chain_pem(&self, out: &mut Vec<u8>) {
        if let Link::Tls(stream) = &self.link {
            if let Some(chain) = stream.ssl().peer_cert_chain() {
                for cert in chain {
                    if let Ok(pem) = cert.to_pem() {
                        out.extend_from_slice(&pem);
                    }
                }
            }
        }
    }

    #[inline]
    pub fn nread(&self) -> u64 {
        self.nread
    }

    #[inline]
    pub fn nwritten(&self) -> u64 {
        self.nwritten
    }
}

pub struct Scanner<P: Prober> {
    opts: ScanOpts,
    prober: P,
    poll: Poll,
    events: Events,
    probes: Vec<Option<Probe<P::Data>>>,
    free: Vec<usize>,
    active: usize,
    connect_done: bool,
    throttle: bool,
    close_q: Vec<usize>,
    log: Logger,
}

// scratch copy of one readiness event, so dispatch can borrow the scanner
struct Readiness {
    idx: usize,
    readable: bool,
    writable: bool,
    failed: bool,
}

impl<P: Prober> Scanner<P> {
    pub fn new(opts: ScanOpts, prober: P, log: Logger) -> io::Result<Scanner<P>> {
        let poll = Poll::new()?;
        let nevents = opts.connects_per_tick.max(8);
        Ok(Scanner {
            opts,
            prober,
            poll,
            events: Events::with_capacity(nevents),
            probes: Vec::new(),
            free: Vec::new(),
            active: 0,
            connect_done: false,
            throttle: false,
            close_q: Vec::new(),
            log,
        })
    }

    #[inline]
    pub fn active_conns(&self) -> usize {
        self.active
    }

    pub fn prober(&self) -> &P {
        &self.prober
    }

    pub fn into_prober(self) -> P {
        self.prober
    }

    /// Run until the producer reports done and every connection has been
    /// closed.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.connect_done || self.active > 0 {
            self.tick()?;
        }
        Ok(())
    }

    /// One loop pass: throttle, initiate, poll, dispatch, sweep. Exposed so
    /// embedding code (and tests) can interleave scanning with other work.
    pub fn tick(&mut self) -> io::Result<()> {
        if self.throttle {
            std::thread::sleep(self.opts.mdelay_per_tick);
            self.throttle = false;
        }

        self.start_connections()?;

        let batch = self.poll_once()?;
        for readiness in batch {
            self.dispatch(readiness);
        }

        self.sweep_deadlines();
        self.sweep_closed();
        Ok(())
    }

    fn start_connections(&mut self) -> io::Result<()> {
        let mut initiated = 0;

        while self.active < self.opts.max_clients
            && !self.connect_done
            && initiated < self.opts.connects_per_tick
        {
            let mut dial = Dial {
                fd: None,
                flags: 0,
                tls_name: None,
                data: P::Data::default(),
            };

            match self.prober.on_connect(&mut dial) {
                Verdict::Done => {
                    self.connect_done = true;
                    break;
                }
                Verdict::Wait => {
                    self.throttle = true;
                    break;
                }
                Verdict::Err => {
                    return Err(io::Error::other("scan producer failed"));
                }
                Verdict::Next => {}
            }

            let Some(fd) = dial.fd.take() else {
                break;
            };

            if dial.flags & (READABLE | WRITABLE_ONESHOT) == 0 {
                // no interest requested: complete the connection on the spot
                let mut probe = Probe {
                    link: Link::Plain(Some(fd)),
                    flags: dial.flags,
                    deadline: Deadline::after(Duration::ZERO),
                    nread: 0,
                    nwritten: 0,
                    want_write: false,
                    data: dial.data,
                };
                probe.close_fd();
                self.prober.on_done(&mut probe);
                continue;
            }

            self.register(fd, dial)?;
            initiated += 1;
        }

        Ok(())
    }

    fn register(&mut self, fd: OwnedFd, dial: Dial<P::Data>) -> io::Result<()> {
        let mut flags = dial.flags;

        let link = if flags & TLS_HANDSHAKE != 0 && self.opts.tls.is_some() {
            match self.tls_link(fd, dial.tls_name.as_deref()) {
                Ok(link) => link,
                Err(err) => {
                    debug!(self.log, "tls setup failed"; "error" => %err);
                    let mut probe = Probe {
                        link: Link::Plain(None),
                        flags,
                        deadline: Deadline::after(Duration::ZERO),
                        nread: 0,
                        nwritten: 0,
                        want_write: false,
                        data: dial.data,
                    };
                    self.prober.on_done(&mut probe);
                    return Err(err);
                }
            }
        } else {
            flags &= !TLS_HANDSHAKE;
            Link::Plain(Some(fd))
        };

        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.probes.push(None);
                self.probes.len() - 1
            }
        };

        let probe = Probe {
            link,
            flags,
            deadline: Deadline::after(self.opts.timeout),
            nread: 0,
            nwritten: 0,
            want_write: false,
            data: dial.data,
        };

        let raw = probe.raw_fd().expect("freshly registered probe has an fd");
        let interest = if flags & TLS_HANDSHAKE != 0 {
            // the handshake needs both directions until it settles
            Interest::READABLE | Interest::WRITABLE
        } else {
            Self::interest_for(flags).expect("checked above")
        };

        self.poll
            .registry()
            .register(&mut SourceFd(&raw), Token(idx), interest)?;

        self.probes[idx] = Some(probe);
        self.active += 1;
        trace!(self.log, "connection registered"; "conn" => idx, "flags" => flags);
        Ok(())
    }

    fn tls_link(&self, fd: OwnedFd, name: Option<&str>) -> io::Result<Link> {
        let connector = self.opts.tls.as_ref().expect("caller checked tls");
        let mut config = connector
            .configure()
            .map_err(|e| io::Error::other(e.to_string()))?;
        config.set_verify(SslVerifyMode::NONE);
        config.set_verify_hostname(false);
        if name.is_none() {
            config.set_use_server_name_indication(false);
        }

        let mut ssl = config
            .into_ssl(name.unwrap_or("scan.invalid"))
            .map_err(|e| io::Error::other(e.to_string()))?;
        ssl.set_connect_state();

        let stream = SslStream::new(ssl, FdStream(Some(fd)))
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(Link::Tls(Box::new(stream)))
    }

    fn interest_for(flags: u8) -> Option<Interest> {
        match (flags & READABLE != 0, flags & WRITABLE_ONESHOT != 0) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn poll_once(&mut self) -> io::Result<Vec<Readiness>> {
        match self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(err),
        }

        Ok(self
            .events
            .iter()
            .map(|event| Readiness {
                idx: event.token().0,
                readable: event.is_readable(),
                writable: event.is_writable(),
                failed: event.is_error() || event.is_read_closed(),
            })
            .collect())
    }

    fn dispatch(&mut self, readiness: Readiness) {
        let idx = readiness.idx;
        let flags = match self.probes[idx].as_ref() {
            Some(probe) => probe.flags,
            None => return,
        };

        if flags & TLS_HANDSHAKE != 0 {
            self.drive_handshake(idx);
            return;
        }

        let mut handled = false;

        if readiness.readable && flags & READABLE != 0 {
            handled = true;
            let probe = self.probes[idx].as_mut().expect("probe checked above");
            if self.prober.on_readable(probe) != Flow::More {
                self.close_q.push(idx);
                return;
            }
        }

        if readiness.writable && flags & WRITABLE_ONESHOT != 0 {
            handled = true;
            // writable interest is one-shot: downgrade before dispatch
            if let Some(probe) = self.probes[idx].as_mut() {
                probe.flags &= !WRITABLE_ONESHOT;
            }
            self.downgrade_interest(idx);

            let probe = self.probes[idx].as_mut().expect("probe checked above");
            if self.prober.on_writable(probe) != Flow::More {
                self.close_q.push(idx);
                return;
            }
        }

        // TLS asked for a write retry from inside a callback
        let wants_write = match self.probes[idx].as_mut() {
            Some(probe) => {
                let wants = std::mem::take(&mut probe.want_write);
                if wants {
                    probe.flags |= WRITABLE_ONESHOT;
                }
                wants
            }
            None => false,
        };
        if wants_write {
            self.rearm(idx, Interest::READABLE | Interest::WRITABLE);
        }

        if !handled && readiness.failed {
            self.close_q.push(idx);
        }
    }

    fn drive_handshake(&mut self, idx: usize) {
        let probe = self.probes[idx].as_mut().expect("probe checked by caller");
        let Link::Tls(stream) = &mut probe.link else {
            probe.flags &= !TLS_HANDSHAKE;
            return;
        };

        match stream.do_handshake() {
            Ok(()) => {
                probe.flags &= !TLS_HANDSHAKE;
                trace!(self.log, "tls handshake complete"; "conn" => idx);
                match Self::interest_for(probe.flags) {
                    Some(interest) => self.rearm(idx, interest),
                    None => self.close_q.push(idx),
                }
            }
            Err(err) => match err.code() {
                ErrorCode::WANT_READ => self.rearm(idx, Interest::READABLE),
                ErrorCode::WANT_WRITE => self.rearm(idx, Interest::WRITABLE),
                _ => {
                    debug!(self.log, "tls handshake failed"; "conn" => idx, "error" => %err);
                    self.close_q.push(idx);
                }
            },
        }
    }

    fn rearm(&mut self, idx: usize, interest: Interest) {
        let Some(probe) = self.probes[idx].as_ref() else {
            return;
        };
        let Some(raw) = probe.raw_fd() else { return };
        if let Err(err) = self
            .poll
            .registry()
            .reregister(&mut SourceFd(&raw), Token(idx), interest)
        {
            debug!(self.log, "reregister failed"; "conn" => idx, "error" => %err);
            self.close_q.push(idx);
        }
    }

    fn downgrade_interest(&mut self, idx: usize) {
        let Some(probe) = self.probes[idx].as_ref() else {
            return;
        };
        match Self::interest_for(probe.flags) {
            Some(interest) => self.rearm(idx, interest),
            None => {
                // nothing left to watch; only the deadline can close it now
                if let Some(raw) = probe.raw_fd() {
                    let _ = self.poll.registry().deregister(&mut SourceFd(&raw));
                }
            }
        }
    }

    fn sweep_deadlines(&mut self) {
        let now = Instant::now();
        for (idx, slot) in self.probes.iter().enumerate() {
            if let Some(probe) = slot {
                if probe.deadline.expired_at(now) {
                    self.close_q.push(idx);
                }
            }
        }
    }

    fn sweep_closed(&mut self) {
        while let Some(idx) = self.close_q.pop() {
            // a slot may be queued twice (callback + deadline); take() dedupes
            let Some(mut probe) = self.probes[idx].take() else {
                continue;
            };

            if let Some(raw) = probe.raw_fd() {
                let _ = self.poll.registry().deregister(&mut SourceFd(&raw));
            }
            probe.close_fd();
            self.prober.on_done(&mut probe);
            self.active -= 1;
            self.free.push(idx);
            trace!(self.log, "connection closed"; "conn" => idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tcp;
    use plinth::logging::discard;
    use std::net::{SocketAddr, TcpListener};

    /// Scripted producer: dials each target with the given flags, records
    /// callback activity.
    struct ScriptedProber {
        targets: Vec<SocketAddr>,
        flags: u8,
        wait_first: bool,
        connects: usize,
        started: usize,
        reads: usize,
        writes: usize,
        dones: usize,
        max_in_flight: usize,
    }

    impl ScriptedProber {
        fn new(targets: Vec<SocketAddr>, flags: u8) -> ScriptedProber {
            ScriptedProber {
                targets,
                flags,
                wait_first: false,
                connects: 0,
                started: 0,
                reads: 0,
                writes: 0,
                dones: 0,
                max_in_flight: 0,
            }
        }
    }

    impl Prober for ScriptedProber {
        type Data = ();

        fn on_connect(&mut self, dial: &mut Dial<()>) -> Verdict {
            self.connects += 1;
            if self.wait_first {
                self.wait_first = false;
                return Verdict::Wait;
            }
            let Some(addr) = self.targets.pop() else {
                return Verdict::Done;
            };
            dial.fd = Some(tcp::connect_nonblocking(addr).unwrap());
            dial.flags = self.flags;
            self.started += 1;
            self.max_in_flight = self.max_in_flight.max(self.started - self.dones);
            Verdict::Next
        }

        fn on_readable(&mut self, conn: &mut Probe<()>) -> Flow {
            self.reads += 1;
            let mut buf = [0u8; 256];
            match conn.read(&mut buf) {
                Ok(0) => Flow::Close,
                Ok(_) => Flow::More,
                Err(NetError::Again) => Flow::More,
                Err(_) => Flow::Error,
            }
        }

        fn on_writable(&mut self, conn: &mut Probe<()>) -> Flow {
            self.writes += 1;
            match conn.write(b"probe\r\n") {
                Ok(_) => Flow::Close,
                Err(NetError::Again) => Flow::More,
                Err(_) => Flow::Error,
            }
        }

        fn on_done(&mut self, _conn: &mut Probe<()>) {
            self.dones += 1;
        }
    }

    fn closed_port_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[test]
    fn test_scan_closed_ports_completes() {
        let addr = closed_port_addr();
        let prober = ScriptedProber::new(vec![addr, addr], READABLE | WRITABLE_ONESHOT);
        let opts = ScanOpts {
            max_clients: 2,
            connects_per_tick: 2,
            timeout: Duration::from_secs(1),
            ..Default::default()
        };

        let mut scanner = Scanner::new(opts, prober, discard()).unwrap();
        scanner.run().unwrap();

        let prober = scanner.into_prober();
        assert_eq!(prober.started, 2);
        assert_eq!(prober.dones, 2);
    }

    #[test]
    fn test_active_conns_bounded() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let prober = ScriptedProber::new(vec![addr; 10], WRITABLE_ONESHOT);
        let opts = ScanOpts {
            max_clients: 3,
            connects_per_tick: 8,
            timeout: Duration::from_secs(2),
            ..Default::default()
        };

        let mut scanner = Scanner::new(opts, prober, discard()).unwrap();
        scanner.run().unwrap();

        let prober = scanner.into_prober();
        assert_eq!(prober.started, 10);
        assert_eq!(prober.dones, 10);
        assert!(
            prober.max_in_flight <= 3,
            "in-flight high-water {} exceeded max_clients",
            prober.max_in_flight
        );
    }

    #[test]
    fn test_connects_per_tick_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let prober = ScriptedProber::new(vec![addr; 10], WRITABLE_ONESHOT);
        let opts = ScanOpts {
            max_clients: 10,
            connects_per_tick: 2,
            timeout: Duration::from_secs(2),
            ..Default::default()
        };

        let mut scanner = Scanner::new(opts, prober, discard()).unwrap();
        scanner.tick().unwrap();
        assert_eq!(scanner.prober().started, 2);
        scanner.tick().unwrap();
        assert_eq!(scanner.prober().started, 4);
    }

    #[test]
    fn test_deadline_closes_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // peer accepts and stays silent; only the deadline can close us
        let prober = ScriptedProber::new(vec![addr], READABLE);
        let opts = ScanOpts {
            max_clients: 1,
            connects_per_tick: 1,
            timeout: Duration::from_millis(100),
            ..Default::default()
        };

        let started = Instant::now();
        let mut scanner = Scanner::new(opts, prober, discard()).unwrap();
        scanner.run().unwrap();
        let elapsed = started.elapsed();

        let prober = scanner.into_prober();
        assert_eq!(prober.dones, 1);
        assert!(
            elapsed < Duration::from_secs(2),
            "deadline not enforced: took {:?}",
            elapsed
        );
        drop(listener);
    }

    #[test]
    fn test_wait_verdict_throttles_then_continues() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut prober = ScriptedProber::new(vec![addr], WRITABLE_ONESHOT);
        prober.wait_first = true;
        let opts = ScanOpts {
            max_clients: 1,
            connects_per_tick: 1,
            timeout: Duration::from_secs(2),
            mdelay_per_tick: Duration::from_millis(10),
            ..Default::default()
        };

        let mut scanner = Scanner::new(opts, prober, discard()).unwrap();
        scanner.run().unwrap();

        let prober = scanner.into_prober();
        assert_eq!(prober.started, 1);
        assert_eq!(prober.dones, 1);
        assert!(prober.connects >= 3, "wait + target + done verdicts");
    }

    #[test]
    fn test_cert_chain_empty_without_tls() {
        let mut probe: Probe<()> = Probe {
            link: Link::Plain(None),
            flags: 0,
            deadline: Deadline::after(Duration::ZERO),
            nread: 0,
            nwritten: 0,
            want_write: false,
            data: (),
        };
        let mut out = Vec::new();
        probe.cert_chain_pem(&mut out);
        assert!(out.is_empty());
        assert_eq!(probe.read(&mut [0u8; 4]).unwrap_err(), NetError::Fatal(Cause::Closed));
    }
}
