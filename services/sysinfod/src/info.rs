//! System information service: any request frame is answered with one
//! snapshot of uptime, load and filesystem capacity, then the connection
//! closes after the response drains.

use dragnet::net::netstring;
use dragnet::net::support::NetError;
use dragnet::proto::{self, SysinfoResp};
use dragnet::svc::{ClientCtx, Module, ServiceDef, Transition};
use plinth::logging::debug;
use std::io;
use std::path::{Path, PathBuf};

pub struct SysinfoMod {
    rootpath: PathBuf,
}

impl Module for SysinfoMod {
    type Conn = ();
}

pub fn service(rootpath: PathBuf) -> ServiceDef<SysinfoMod> {
    ServiceDef::new("sysinfo", "sysinfo.sock", on_client, move |_| {
        Ok(SysinfoMod {
            rootpath: rootpath.clone(),
        })
    })
}

fn read_first_fields(path: &str, count: usize) -> io::Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)?;
    let fields: Vec<f64> = text
        .split_whitespace()
        .take(count)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < count {
        return Err(io::Error::new(io::ErrorKind::InvalidData, path.to_string()));
    }
    Ok(fields)
}

/// Gather one snapshot. Capacity fractions are free-vs-total for blocks and
/// inodes under `rootpath`.
pub fn gather(rootpath: &Path) -> io::Result<SysinfoResp> {
    let uptime = read_first_fields("/proc/uptime", 1)?[0] as u64;
    let load = read_first_fields("/proc/loadavg", 3)?;

    let vfs = nix::sys::statvfs::statvfs(rootpath).map_err(io::Error::from)?;
    let fcap = match vfs.blocks() {
        0 => 0.0,
        total => vfs.blocks_available() as f64 / total as f64,
    };
    let icap = match vfs.files() {
        0 => 0.0,
        total => vfs.files_available() as f64 / total as f64,
    };

    Ok(SysinfoResp {
        uptime,
        loadavg: [load[0], load[1], load[2]],
        fcap,
        icap,
    })
}

fn on_client(_module: &mut SysinfoMod, ctx: &mut ClientCtx<'_, SysinfoMod>) {
    ctx.set_readable(Some(on_request), true);
}

fn on_request(module: &mut SysinfoMod, ctx: &mut ClientCtx<'_, SysinfoMod>) {
    match ctx.recv_msg() {
        Ok(_request) => {}
        Err(NetError::Again) => return,
        Err(err) => {
            debug!(ctx.log, "request receive failed"; "error" => %err);
            ctx.finish();
            return;
        }
    }

    let resp = match gather(&module.rootpath) {
        Ok(resp) => resp,
        Err(err) => {
            debug!(ctx.log, "sysinfo gather failed"; "error" => %err);
            ctx.finish();
            return;
        }
    };

    let body = match proto::to_body(&resp) {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_root() {
        let info = gather(Path::new("/")).unwrap();
        assert!(info.uptime > 0);
        assert!(info.loadavg.iter().all(|l| *l >= 0.0));
        assert!((0.0..=1.0).contains(&info.fcap));
        assert!((0.0..=1.0).contains(&info.icap));
    }

    #[test]
    fn test_gather_bad_root() {
        assert!(gather(Path::new("/no/such/root")).is_err());
    }
}
