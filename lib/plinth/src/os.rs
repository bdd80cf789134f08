//! Process-level glue for daemons: user/group resolution, privilege drop,
//! daemonization and pid-file handling.
//!
//! Daemons chdir into a basepath and keep their runtime state there: the
//! listening sockets, a `<name>.pid` file and a `<name>.dump` file that
//! captures stdout/stderr of the daemonized process.

use nix::unistd::{self, ForkResult, Gid, Group, Pid, Uid, User};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum OsError {
    #[error("unknown user {0}")]
    NoSuchUser(String),
    #[error("unknown group {0}")]
    NoSuchGroup(String),
    #[error("{op}: {source}")]
    Sys {
        op: &'static str,
        source: nix::Error,
    },
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

fn sys(op: &'static str) -> impl FnOnce(nix::Error) -> OsError {
    move |source| OsError::Sys { op, source }
}

fn io_at<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> OsError + 'a {
    move |source| OsError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Resolve a user name to a uid.
pub fn lookup_uid(name: &str) -> Result<Uid, OsError> {
    User::from_name(name)
        .map_err(sys("getpwnam"))?
        .map(|u| u.uid)
        .ok_or_else(|| OsError::NoSuchUser(name.to_string()))
}

/// Resolve a group name to a gid.
pub fn lookup_gid(name: &str) -> Result<Gid, OsError> {
    Group::from_name(name)
        .map_err(sys("getgrnam"))?
        .map(|g| g.gid)
        .ok_or_else(|| OsError::NoSuchGroup(name.to_string()))
}

/// Drop to an unprivileged user and group. The supplementary group list is
/// replaced by the target group alone. Must run before any worker forks so
/// the whole process tree is unprivileged.
pub fn drop_privileges(uid: Uid, gid: Gid) -> Result<(), OsError> {
    unistd::setgroups(&[gid]).map_err(sys("setgroups"))?;
    unistd::setgid(gid).map_err(sys("setgid"))?;
    unistd::setuid(uid).map_err(sys("setuid"))?;
    Ok(())
}

pub struct DaemonOpts<'a> {
    pub name: &'a str,
    pub basepath: &'a Path,
    pub uid: Option<Uid>,
    pub gid: Option<Gid>,
}

impl DaemonOpts<'_> {
    fn pidfile(&self) -> PathBuf {
        self.basepath.join(format!("{}.pid", self.name))
    }

    fn dumpfile(&self) -> PathBuf {
        self.basepath.join(format!("{}.dump", self.name))
    }
}

/// Create `<basepath>/<name>.pid` with the calling process' pid. The file is
/// created with O_CREAT|O_EXCL: startup fails if it already exists.
pub fn write_pidfile(opts: &DaemonOpts) -> Result<(), OsError> {
    let path = opts.pidfile();
    let mut f = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(io_at("create pidfile", &path))?;
    writeln!(f, "{}", Pid::this()).map_err(io_at("write pidfile", &path))?;
    Ok(())
}

pub fn remove_pidfile(opts: &DaemonOpts) -> Result<(), OsError> {
    let path = opts.pidfile();
    std::fs::remove_file(&path).map_err(io_at("remove pidfile", &path))
}

/// Detach from the controlling terminal and become a daemon rooted in the
/// basepath. The parent process exits; the child gets a fresh session, a pid
/// file, stdout/stderr redirected into the dump file and stdin from
/// /dev/null, then drops privileges if a uid/gid was supplied.
pub fn daemonize(opts: &DaemonOpts) -> Result<(), OsError> {
    unistd::chdir(opts.basepath).map_err(sys("chdir"))?;

    match unsafe { unistd::fork() }.map_err(sys("fork"))? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    unistd::setsid().map_err(sys("setsid"))?;
    write_pidfile(opts)?;

    let dump_path = opts.dumpfile();
    let dump = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&dump_path)
        .map_err(io_at("open dumpfile", &dump_path))?;
    let devnull = File::open("/dev/null")
        .map_err(io_at("open", Path::new("/dev/null")))?;

    unistd::dup2(devnull.as_raw_fd(), 0).map_err(sys("dup2 stdin"))?;
    unistd::dup2(dump.as_raw_fd(), 1).map_err(sys("dup2 stdout"))?;
    unistd::dup2(dump.as_raw_fd(), 2).map_err(sys("dup2 stderr"))?;

    if let (Some(uid), Some(gid)) = (opts.uid, opts.gid) {
        drop_privileges(uid, gid)?;
    }

    Ok(())
}

/// Foreground mode: just enter the basepath.
pub fn foreground(basepath: &Path) -> Result<(), OsError> {
    unistd::chdir(basepath).map_err(sys("chdir"))
}
