//! Banner grabbing on top of the bounded scanner: resolve target names,
//! connect to every `address:port`, keep whatever the peer says first, and
//! emit one record per connection.

use dragnet::net::support::NetError;
use dragnet::net::{netstring, tcp};
use dragnet::proto::BannerRecord;
use dragnet::resolve::{BatchSink, Pool, PoolOpts};
use dragnet::scan::{Dial, Flow, Prober, Probe, Verdict, READABLE, TLS_HANDSHAKE};
use plinth::logging::{debug, Logger};
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Condvar, Mutex};

/// Bytes of banner kept per connection.
const BANNER_MAX: usize = 1024;

/// One `host:port` argument, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub host: String,
    pub port: u16,
}

/// A connectable endpoint; `name` survives resolution for the record.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: Option<String>,
    pub addr: SocketAddr,
}

/// Parse `host:port`, with `[v6::addr]:port` bracketing for literals.
pub fn parse_spec(arg: &str) -> Result<TargetSpec, String> {
    let (host, port) = match arg.strip_prefix('[') {
        Some(rest) => {
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated address bracket: {}", arg))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| format!("missing port: {}", arg))?;
            (host, port)
        }
        None => arg
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port: {}", arg))?,
    };

    if host.is_empty() {
        return Err(format!("missing host: {}", arg));
    }
    let port: u16 = port.parse().map_err(|_| format!("bad port: {}", arg))?;
    if port == 0 {
        return Err(format!("bad port: {}", arg));
    }

    Ok(TargetSpec {
        host: host.to_string(),
        port,
    })
}

struct Collector {
    results: Mutex<Vec<(String, IpAddr)>>,
    finished: Mutex<bool>,
    cond: Condvar,
}

#[derive(Clone)]
struct CollectorHandle(Arc<Collector>);

impl BatchSink for CollectorHandle {
    fn resolved(&self, host: &str, addr: IpAddr) {
        self.0
            .results
            .lock()
            .unwrap()
            .push((host.to_string(), addr));
    }

    fn done(&self) {
        *self.0.finished.lock().unwrap() = true;
        self.0.cond.notify_all();
    }
}

/// Expand specs into connectable targets. Literal addresses pass through;
/// names go through the resolver pool and may expand to several addresses
/// each. Unresolvable names silently yield nothing.
pub fn expand_targets(
    specs: &[TargetSpec],
    resolvers: usize,
    log: &Logger,
) -> std::io::Result<Vec<Target>> {
    let mut targets = Vec::new();
    let mut names: Vec<&TargetSpec> = Vec::new();

    for spec in specs {
        match spec.host.parse::<IpAddr>() {
            Ok(ip) => targets.push(Target {
                name: None,
                addr: SocketAddr::new(ip, spec.port),
            }),
            Err(_) => names.push(spec),
        }
    }

    if !names.is_empty() {
        let pool = Pool::new(
            &PoolOpts {
                nthreads: resolvers,
                stack_size: None,
            },
            log.clone(),
        )?;

        let collector = CollectorHandle(Arc::new(Collector {
            results: Mutex::new(Vec::new()),
            finished: Mutex::new(false),
            cond: Condvar::new(),
        }));

        let hosts: Vec<&str> = names.iter().map(|spec| spec.host.as_str()).collect();
        pool.add(&hosts.join(" "), Box::new(collector.clone()));

        let mut finished = collector.0.finished.lock().unwrap();
        while !*finished {
            finished = collector.0.cond.wait(finished).unwrap();
        }
        drop(finished);

        let resolved = collector.0.results.lock().unwrap();
        for spec in names {
            for (host, addr) in resolved.iter() {
                if host == &spec.host {
                    targets.push(Target {
                        name: Some(spec.host.clone()),
                        addr: SocketAddr::new(*addr, spec.port),
                    });
                }
            }
        }
    }

    Ok(targets)
}

#[derive(Default)]
pub struct GrabData {
    target: Option<Target>,
    banner: Vec<u8>,
}

/// The scanning client: pulls targets off a queue, reads one banner per
/// connection, writes a record when the connection completes.
pub struct BannerGrabber<W: Write> {
    queue: Vec<Target>,
    tls: bool,
    out: W,
    log: Logger,
    pub grabbed: usize,
    pub write_errors: usize,
}

impl<W: Write> BannerGrabber<W> {
    pub fn new(mut targets: Vec<Target>, tls: bool, out: W, log: Logger) -> BannerGrabber<W> {
        // pop() serves them back in argument order
        targets.reverse();
        BannerGrabber {
            queue: targets,
            tls,
            out,
            log,
            grabbed: 0,
            write_errors: 0,
        }
    }

    pub fn into_output(self) -> W {
        self.out
    }
}

impl<W: Write> Prober for BannerGrabber<W> {
    type Data = GrabData;

    fn on_connect(&mut self, dial: &mut Dial<GrabData>) -> Verdict {
        let Some(target) = self.queue.pop() else {
            return Verdict::Done;
        };

        match tcp::connect_nonblocking(target.addr) {
            Ok(fd) => {
                dial.fd = Some(fd);
                dial.flags = READABLE | if self.tls { TLS_HANDSHAKE } else { 0 };
                dial.tls_name = target.name.clone();
                dial.data.target = Some(target);
                Verdict::Next
            }
            Err(err) => {
                debug!(self.log, "connect failed"; "addr" => %target.addr, "error" => %err);
                Verdict::Next
            }
        }
    }

    fn on_readable(&mut self, conn: &mut Probe<GrabData>) -> Flow {
        let mut buf = [0u8; BANNER_MAX];
        match conn.read(&mut buf) {
            Ok(0) => Flow::Close,
            Ok(n) => {
                let data = &mut conn.data;
                let room = BANNER_MAX.saturating_sub(data.banner.len());
                data.banner.extend_from_slice(&buf[..n.min(room)]);
                // one read is a banner; no point lingering
                Flow::Close
            }
            Err(NetError::Again) => Flow::More,
            Err(_) => Flow::Error,
        }
    }

    fn on_writable(&mut self, _conn: &mut Probe<GrabData>) -> Flow {
        Flow::More
    }

    fn on_done(&mut self, conn: &mut Probe<GrabData>) {
        let Some(target) = conn.data.target.take() else {
            return;
        };

        let mut certs = Vec::new();
        if self.tls {
            conn.cert_chain_pem(&mut certs);
        }

        let record = BannerRecord {
            name: target.name,
            addr: target.addr.ip().to_string(),
            port: target.addr.port(),
            banner: std::mem::take(&mut conn.data.banner),
            certs: match certs.is_empty() {
                true => None,
                false => Some(String::from_utf8_lossy(&certs).into_owned()),
            },
        };

        match serde_json::to_vec(&record) {
            Ok(body) => {
                if self.out.write_all(&netstring::encode(&body)).is_err() {
                    self.write_errors += 1;
                } else {
                    self.grabbed += 1;
                }
            }
            Err(_) => self.write_errors += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dragnet::scan::{ScanOpts, Scanner};
    use plinth::logging::discard;
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn test_parse_spec() {
        assert_eq!(
            parse_spec("example.com:80").unwrap(),
            TargetSpec {
                host: "example.com".to_string(),
                port: 80
            }
        );
        assert_eq!(
            parse_spec("127.0.0.1:8080").unwrap(),
            TargetSpec {
                host: "127.0.0.1".to_string(),
                port: 8080
            }
        );
        assert_eq!(
            parse_spec("[::1]:443").unwrap(),
            TargetSpec {
                host: "::1".to_string(),
                port: 443
            }
        );
    }

    #[test]
    fn test_parse_spec_rejects_garbage() {
        assert!(parse_spec("example.com").is_err());
        assert!(parse_spec(":80").is_err());
        assert!(parse_spec("host:0").is_err());
        assert!(parse_spec("host:notaport").is_err());
        assert!(parse_spec("[::1]443").is_err());
    }

    #[test]
    fn test_expand_literal_targets_skip_resolution() {
        let specs = vec![parse_spec("127.0.0.1:80").unwrap()];
        let targets = expand_targets(&specs, 2, &discard()).unwrap();
        assert_eq!(targets.len(), 1);
        assert!(targets[0].name.is_none());
        assert_eq!(targets[0].addr, "127.0.0.1:80".parse().unwrap());
    }

    #[test]
    fn test_expand_resolves_names() {
        let specs = vec![parse_spec("localhost:1234").unwrap()];
        let targets = expand_targets(&specs, 2, &discard()).unwrap();
        assert!(!targets.is_empty());
        for target in &targets {
            assert_eq!(target.name.as_deref(), Some("localhost"));
            assert_eq!(target.addr.port(), 1234);
            assert!(target.addr.ip().is_loopback());
        }
    }

    #[test]
    fn test_grab_banner_from_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // a one-shot server that greets and hangs up
        let server = std::thread::spawn(move || {
            for _ in 0..1 {
                let (mut peer, _) = listener.accept().unwrap();
                peer.write_all(b"220 hello\r\n").unwrap();
            }
        });

        let targets = vec![Target {
            name: None,
            addr,
        }];
        let grabber = BannerGrabber::new(targets, false, Vec::new(), discard());

        let opts = ScanOpts {
            max_clients: 2,
            connects_per_tick: 2,
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let mut scanner = Scanner::new(opts, grabber, discard()).unwrap();
        scanner.run().unwrap();
        server.join().unwrap();

        let grabber = scanner.into_prober();
        assert_eq!(grabber.grabbed, 1);
        let out = grabber.into_output();

        let parsed = netstring::parse(&out, 1 << 20).unwrap();
        let record: BannerRecord = serde_json::from_slice(parsed.body(&out)).unwrap();
        assert_eq!(record.port, addr.port());
        assert_eq!(record.banner, b"220 hello\r\n");
        assert!(record.certs.is_none());
    }
}
