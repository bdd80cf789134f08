//! Request/response behavior of the jobs service over its socket, including
//! the timeout ladder and the oversized-frame rejection.

use dragnet::net::support::{Cause, NetError};
use dragnet::net::wire::Client;
use dragnet::proto::{self, JobReq, StatusResp};
use dragnet::svc;
use jobd::jobs;
use plinth::logging::discard;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Daemon {
    base: PathBuf,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Daemon {
    fn spawn(name: &str, default_timeout: Duration) -> Daemon {
        let base = std::env::temp_dir().join(format!("jobd-it-{}-{}", std::process::id(), name));
        let jobdir = base.join("jobs.d");
        std::fs::create_dir_all(&jobdir).unwrap();

        let script = jobdir.join("sleep-forever");
        let mut f = std::fs::File::create(&script).unwrap();
        f.write_all(b"#!/bin/sh\nexec sleep 60\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let base = base.clone();
            let stop = stop.clone();
            Some(std::thread::spawn(move || {
                let def = jobs::service(
                    base.join("jobs.d"),
                    default_timeout,
                    Duration::from_millis(100),
                );
                svc::serve_single(&def, &base, stop, &discard()).unwrap();
            }))
        };

        Daemon { base, stop, thread }
    }

    fn request(&self, req: &JobReq) -> StatusResp {
        let mut client = self.connect();
        client.send_msg(&proto::to_body(req).unwrap()).unwrap();
        let body = client.recv_msg().unwrap();
        proto::from_body(&body).unwrap()
    }

    fn connect(&self) -> Client {
        let path = self.base.join("jobs.sock");
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            match Client::connect(&path) {
                Ok(client) => return client,
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                Err(err) => panic!("connect: {}", err),
            }
        }
    }

    fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
        let _ = std::fs::remove_dir_all(&self.base);
    }
}

fn start_req(kind: &str, timeout: Option<u64>) -> JobReq {
    JobReq {
        action: "start".to_string(),
        kind: Some(kind.to_string()),
        timeout,
        ..JobReq::default()
    }
}

fn action_req(action: &str, id: &str) -> JobReq {
    JobReq {
        action: action.to_string(),
        id: Some(id.to_string()),
        ..JobReq::default()
    }
}

#[test]
fn test_start_status_stop() {
    let daemon = Daemon::spawn("lifecycle", Duration::from_secs(600));

    let resp = daemon.request(&start_req("sleep-forever", None));
    let id = resp.okmsg.expect("start should return a job id");
    assert!(resp.errmsg.is_none());
    assert!(id.len() >= 32, "expected a real id, got {:?}", id);

    let resp = daemon.request(&action_req("status", &id));
    assert_eq!(resp.okmsg.as_deref(), Some("ACTIVE"));

    let resp = daemon.request(&action_req("stop", &id));
    assert_eq!(resp.okmsg.as_deref(), Some("OK"));

    // stop delivers SIGTERM; once the child is reaped the job is gone
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let resp = daemon.request(&action_req("status", &id));
        if resp.okmsg.as_deref() == Some("INACTIVE") {
            break;
        }
        assert!(Instant::now() < deadline, "job never became INACTIVE");
        std::thread::sleep(Duration::from_millis(50));
    }

    daemon.shutdown();
}

#[test]
fn test_job_timeout_ladder_over_socket() {
    // jobs expire after a second; ticks every 100ms escalate and reap
    let daemon = Daemon::spawn("timeout", Duration::from_secs(1));

    let resp = daemon.request(&start_req("sleep-forever", None));
    let id = resp.okmsg.expect("job id");

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let resp = daemon.request(&action_req("status", &id));
        if resp.okmsg.as_deref() == Some("INACTIVE") {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "timed-out job never became INACTIVE"
        );
        std::thread::sleep(Duration::from_millis(100));
    }

    daemon.shutdown();
}

#[test]
fn test_unknown_action_and_missing_id() {
    let daemon = Daemon::spawn("badreq", Duration::from_secs(600));

    let resp = daemon.request(&JobReq {
        action: "status".to_string(),
        ..JobReq::default()
    });
    assert_eq!(resp.errmsg.as_deref(), Some("missing job ID"));

    let resp = daemon.request(&action_req("frobnicate", "x"));
    assert_eq!(resp.errmsg.as_deref(), Some("unknown action"));

    let resp = daemon.request(&start_req("No-Such/Type", None));
    assert_eq!(resp.errmsg.as_deref(), Some("empty or invalid job type"));

    daemon.shutdown();
}

#[test]
fn test_oversized_request_rejected_with_status() {
    let daemon = Daemon::spawn("oversize", Duration::from_secs(600));

    let mut client = daemon.connect();
    client
        .stream()
        .try_clone()
        .unwrap()
        .write_all(b"2000001:")
        .unwrap();

    let body = client.recv_msg().unwrap();
    let resp: StatusResp = proto::from_body(&body).unwrap();
    assert_eq!(resp.errmsg.as_deref(), Some("request too large"));
    assert_eq!(
        client.recv_msg().unwrap_err(),
        NetError::Fatal(Cause::Closed)
    );

    daemon.shutdown();
}
