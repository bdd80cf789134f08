//! Ether-frame transmit service: a request carries raw frames for one
//! interface; each is validated and written to a packet socket, then a
//! status response closes the conversation.

use crate::rawsock;
use dragnet::net::netstring;
use dragnet::net::support::{Cause, NetError};
use dragnet::proto::{self, EtherReq, StatusResp};
use dragnet::svc::{ClientCtx, Module, ServiceDef, Transition};
use plinth::logging::{debug, info};
use std::io;
use std::os::fd::AsRawFd;

/// Ethernet header without VLAN tags.
pub const MIN_FRAME: usize = 14;
/// Header plus the classic 1500-byte MTU.
pub const MAX_FRAME: usize = 1514;
/// Frames per request.
pub const MAX_FRAMES: usize = 64;

pub struct EtherMod;

impl Module for EtherMod {
    type Conn = ();
}

pub fn service() -> ServiceDef<EtherMod> {
    ServiceDef::new("ethframe", "ethframe.sock", on_client, |_| Ok(EtherMod))
}

pub fn validate(req: &EtherReq) -> Result<(), &'static str> {
    if req.ifname.is_empty() || req.ifname.len() >= libc::IFNAMSIZ {
        return Err("invalid interface name");
    }
    if req.frames.is_empty() {
        return Err("no frames in request");
    }
    if req.frames.len() > MAX_FRAMES {
        return Err("too many frames in request");
    }
    for frame in &req.frames {
        if frame.len() < MIN_FRAME || frame.len() > MAX_FRAME {
            return Err("frame size out of range");
        }
    }
    Ok(())
}

fn send_frames(req: &EtherReq) -> io::Result<usize> {
    let sock = rawsock::open(&req.ifname, false)?;

    let mut sent = 0;
    for frame in &req.frames {
        let n = unsafe {
            libc::write(sock.as_raw_fd(), frame.as_ptr().cast(), frame.len())
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        sent += 1;
    }
    Ok(sent)
}

fn respond(ctx: &mut ClientCtx<'_, EtherMod>, resp: &StatusResp) {
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

fn on_client(_module: &mut EtherMod, ctx: &mut ClientCtx<'_, EtherMod>) {
    ctx.set_readable(Some(on_request), true);
}

fn on_request(_module: &mut EtherMod, ctx: &mut ClientCtx<'_, EtherMod>) {
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

    let req: EtherReq = match proto::from_body(&body) {
        Ok(req) => req,
        Err(_) => {
            respond(ctx, &StatusResp::err("ethframe request parse error"));
            return;
        }
    };

    if let Err(errmsg) = validate(&req) {
        respond(ctx, &StatusResp::err(errmsg));
        return;
    }

    match send_frames(&req) {
        Ok(sent) => {
            info!(ctx.log, "frames sent"; "ifname" => req.ifname.as_str(), "count" => sent);
            respond(ctx, &StatusResp::ok(sent.to_string()));
        }
        Err(err) => {
            debug!(ctx.log, "frame send failed"; "ifname" => req.ifname.as_str(), "error" => %err);
            respond(ctx, &StatusResp::err("frame transmit failure"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(ifname: &str, frames: Vec<Vec<u8>>) -> EtherReq {
        EtherReq {
            ifname: ifname.to_string(),
            frames,
        }
    }

    #[test]
    fn test_validate_accepts_plain_frame() {
        assert!(validate(&req("lo", vec![vec![0u8; 64]])).is_ok());
        assert!(validate(&req("lo", vec![vec![0u8; MIN_FRAME]])).is_ok());
        assert!(validate(&req("lo", vec![vec![0u8; MAX_FRAME]])).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        assert_eq!(
            validate(&req("lo", vec![vec![0u8; MIN_FRAME - 1]])),
            Err("frame size out of range")
        );
        assert_eq!(
            validate(&req("lo", vec![vec![0u8; MAX_FRAME + 1]])),
            Err("frame size out of range")
        );
    }

    #[test]
    fn test_validate_rejects_bad_shape() {
        assert_eq!(validate(&req("lo", vec![])), Err("no frames in request"));
        assert_eq!(
            validate(&req("", vec![vec![0u8; 64]])),
            Err("invalid interface name")
        );
        assert_eq!(
            validate(&req("a-very-long-interface-name", vec![vec![0u8; 64]])),
            Err("invalid interface name")
        );
        assert_eq!(
            validate(&req("lo", vec![vec![0u8; 64]; MAX_FRAMES + 1])),
            Err("too many frames in request")
        );
    }
}
