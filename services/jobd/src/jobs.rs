//! The job-runner service.
//!
//! `start` requests launch an executable from the job directory with a
//! controlled environment and a socketpair as its stdio; the parent half is
//! retained so `log` requests can drain whatever the job wrote. A periodic
//! tick escalates overdue jobs from SIGTERM to SIGKILL, and child reaping
//! removes them from the registry.

use dragnet::net::netstring;
use dragnet::net::support::{Cause, NetError};
use dragnet::proto::{self, JobReq, StatusResp};
use dragnet::svc::{ClientCtx, Module, ServiceDef, Transition};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use plinth::logging::{debug, info, warn, Logger};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);
pub const DEFAULT_TICK: Duration = Duration::from_secs(30);

/// Ceiling for one `log` response body.
const LOG_SNAPSHOT_MAX: usize = 64 * 1024;

struct Job {
    id: String,
    pid: Pid,
    started: Instant,
    timeout: Duration,
    /// Our half of the job's stdio socketpair.
    sock: OwnedFd,
    term_sent: bool,
}

pub struct JobsMod {
    jobdir: PathBuf,
    default_timeout: Duration,
    jobs: Vec<Job>,
}

/// Job types name executables; anything that could traverse paths or need
/// quoting is rejected outright.
fn is_valid_kind(kind: &str) -> bool {
    !kind.is_empty()
        && kind
            .bytes()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == b'-')
}

/// Environment for a job child: identity, type, and `JOBD_P_`-prefixed
/// request parameters.
fn build_env(req: &JobReq, id: &str) -> Vec<(String, String)> {
    let mut env = Vec::with_capacity(req.params.len() + 2);
    env.push(("JOBD_ID".to_string(), id.to_string()));
    if let Some(kind) = &req.kind {
        env.push(("JOBD_TYPE".to_string(), kind.clone()));
    }
    for param in &req.params {
        if let Some((name, value)) = param.split_once('=') {
            if !name.is_empty() {
                env.push((format!("JOBD_P_{}", name), value.to_string()));
            }
        }
    }
    env
}

impl JobsMod {
    pub fn new(jobdir: PathBuf, default_timeout: Duration) -> JobsMod {
        JobsMod {
            jobdir,
            default_timeout,
            jobs: Vec::new(),
        }
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Launch a job; returns its freshly allocated id.
    pub fn start(&mut self, req: &JobReq, log: &Logger) -> Result<String, &'static str> {
        let kind = req.kind.as_deref().unwrap_or("");
        if !is_valid_kind(kind) {
            return Err("empty or invalid job type");
        }

        let path = self.jobdir.join(kind);
        if !path.is_file() {
            return Err("no such job type");
        }

        let id = uuid::Uuid::new_v4().to_string();
        let env = build_env(req, &id);

        let (parent_sock, child_sock) = nix::sys::socket::socketpair(
            nix::sys::socket::AddressFamily::Unix,
            nix::sys::socket::SockType::Stream,
            None,
            nix::sys::socket::SockFlag::empty(),
        )
        .map_err(|_| "socketpair failure")?;

        let stdin = child_sock.try_clone().map_err(|_| "descriptor dup failure")?;
        let stdout = child_sock.try_clone().map_err(|_| "descriptor dup failure")?;

        let child = Command::new(&path)
            .env_clear()
            .envs(env)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(child_sock))
            .spawn()
            .map_err(|_| "job spawn failure")?;

        let pid = Pid::from_raw(child.id() as i32);
        let timeout = req
            .timeout
            .map(Duration::from_secs)
            .filter(|t| !t.is_zero())
            .unwrap_or(self.default_timeout);

        info!(log, "job started";
              "id" => id.as_str(), "type" => kind, "pid" => pid.as_raw(),
              "timeout_secs" => timeout.as_secs());

        self.jobs.push(Job {
            id: id.clone(),
            pid,
            started: Instant::now(),
            timeout,
            sock: parent_sock,
            term_sent: false,
        });

        Ok(id)
    }

    pub fn status(&self, id: &str) -> &'static str {
        match self.jobs.iter().any(|job| job.id == id) {
            true => "ACTIVE",
            false => "INACTIVE",
        }
    }

    pub fn stop(&mut self, id: &str, log: &Logger) {
        if let Some(job) = self.jobs.iter_mut().find(|job| job.id == id) {
            info!(log, "stopping job"; "id" => id, "pid" => job.pid.as_raw());
            let _ = kill(job.pid, Signal::SIGTERM);
            job.term_sent = true;
        }
    }

    /// Drain whatever the job has written so far, bounded by the snapshot
    /// ceiling. Must not block the worker, so the socket goes non-blocking
    /// and the read stops at the first would-block.
    pub fn log_snapshot(&mut self, id: &str) -> Option<Vec<u8>> {
        let job = self.jobs.iter().find(|job| job.id == id)?;

        let raw = job.sock.as_raw_fd();
        let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
        unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };

        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        while out.len() < LOG_SNAPSHOT_MAX {
            let n = unsafe { libc::read(raw, chunk.as_mut_ptr().cast(), chunk.len()) };
            if n <= 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n as usize]);
        }

        Some(out)
    }

    /// SIGTERM everything overdue; SIGKILL what already got its warning.
    fn check_times(&mut self, log: &Logger) {
        for job in &mut self.jobs {
            if job.term_sent {
                warn!(log, "timeout escalation, SIGKILL"; "id" => job.id.as_str(), "pid" => job.pid.as_raw());
                let _ = kill(job.pid, Signal::SIGKILL);
                continue;
            }

            if job.started.elapsed() >= job.timeout {
                warn!(log, "timeout reached, SIGTERM"; "id" => job.id.as_str(), "pid" => job.pid.as_raw());
                let _ = kill(job.pid, Signal::SIGTERM);
                job.term_sent = true;
            }
        }
    }

    fn remove_by_pid(&mut self, pid: Pid, log: &Logger) {
        if let Some(at) = self.jobs.iter().position(|job| job.pid == pid) {
            let job = self.jobs.swap_remove(at);
            info!(log, "job finished"; "id" => job.id.as_str(), "pid" => pid.as_raw());
        }
    }
}

impl Module for JobsMod {
    type Conn = ();

    fn on_tick(&mut self, log: &Logger) {
        self.check_times(log);
    }

    fn on_child_reaped(&mut self, pid: Pid, _status: WaitStatus, log: &Logger) {
        self.remove_by_pid(pid, log);
    }

    /// Shutdown discipline: warn every job, give them a second, kill the
    /// rest, and reap them all before the worker exits.
    fn detach(&mut self, log: &Logger) {
        if self.jobs.is_empty() {
            return;
        }

        info!(log, "terminating jobs"; "count" => self.jobs.len());
        for job in &self.jobs {
            let _ = kill(job.pid, Signal::SIGTERM);
        }

        std::thread::sleep(Duration::from_secs(1));

        for job in &self.jobs {
            let _ = kill(job.pid, Signal::SIGKILL);
        }

        for job in self.jobs.drain(..) {
            match waitpid(job.pid, None) {
                Ok(_) => info!(log, "job reaped at shutdown"; "id" => job.id.as_str(), "pid" => job.pid.as_raw()),
                Err(err) => warn!(log, "shutdown wait failed"; "pid" => job.pid.as_raw(), "error" => %err),
            }
        }
    }
}

pub fn service(
    jobdir: PathBuf,
    default_timeout: Duration,
    tick: Duration,
) -> ServiceDef<JobsMod> {
    ServiceDef::new("jobs", "jobs.sock", on_client, move |_log| {
        Ok(JobsMod::new(jobdir.clone(), default_timeout))
    })
    .tick(tick)
}

fn on_client(_module: &mut JobsMod, ctx: &mut ClientCtx<'_, JobsMod>) {
    ctx.set_readable(Some(on_request), true);
}

fn respond(ctx: &mut ClientCtx<'_, JobsMod>, resp: &StatusResp) {
    let body = match proto::to_body(resp) {
        Ok(body) => body,
        Err(_) => {
            ctx.finish();
            return;
        }
    };
    if ctx.enqueue(&netstring::encode(&body), Transition::close()).is_err() {
        ctx.finish();
    }
}

fn on_request(module: &mut JobsMod, ctx: &mut ClientCtx<'_, JobsMod>) {
    let body = match ctx.recv_msg() {
        Ok(body) => body,
        Err(NetError::Again) => return,
        Err(NetError::Fatal(Cause::TooLarge)) => {
            respond(ctx, &StatusResp::err("request too large"));
            return;
        }
        Err(err) => {
            debug!(ctx.log, "request receive failed"; "error" => %err);
            ctx.finish();
            return;
        }
    };

    let req: JobReq = match proto::from_body(&body) {
        Ok(req) => req,
        Err(_) => {
            respond(ctx, &StatusResp::err("job request parse error"));
            return;
        }
    };

    if req.action == "start" {
        match module.start(&req, &ctx.log) {
            Ok(id) => respond(ctx, &StatusResp::ok(id)),
            Err(errmsg) => respond(ctx, &StatusResp::err(errmsg)),
        }
        return;
    }

    let Some(id) = req.id.as_deref() else {
        respond(ctx, &StatusResp::err("missing job ID"));
        return;
    };

    match req.action.as_str() {
        "status" => {
            let status = module.status(id);
            respond(ctx, &StatusResp::ok(status));
        }
        "stop" => {
            module.stop(id, &ctx.log);
            respond(ctx, &StatusResp::ok("OK"));
        }
        "log" => match module.log_snapshot(id) {
            Some(captured) => {
                let text = String::from_utf8_lossy(&captured).into_owned();
                respond(ctx, &StatusResp::ok(text));
            }
            None => respond(ctx, &StatusResp::err("no such job")),
        },
        _ => respond(ctx, &StatusResp::err("unknown action")),
    }
}
