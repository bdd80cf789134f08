//! Packet capture service.
//!
//! The client passes an output fd, then a capture request. The service
//! opens a raw receive socket on the interface, writes a pcap file header
//! to the output, and attaches the socket to the worker loop as a side
//! channel. Each readable event drains at most `DISPATCH_CNT` packets into
//! pcap records. The capture ends when writing the output fails, i.e. when
//! the client stops reading its end.

use crate::rawsock;
use byteorder::{LittleEndian, WriteBytesExt};
use dragnet::net::netstring;
use dragnet::net::support::NetError;
use dragnet::proto::{self, CaptureReq, StatusResp};
use dragnet::svc::{ClientCtx, Module, ServiceDef, SideChannel, Transition};
use plinth::logging::{debug, info};
use std::fs::File;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// Packets drained per readable event on the capture socket.
pub const DISPATCH_CNT: usize = 64;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const LINKTYPE_ETHERNET: u32 = 1;

pub struct CaptureMod;

impl Module for CaptureMod {
    type Conn = CaptureConn;
}

#[derive(Default)]
pub struct CaptureConn {
    /// Output destination, present on the parent client between read_fd and
    /// the side-channel handoff, then on the side channel for its lifetime.
    out: Option<File>,
    snaplen: u32,
}

pub fn service() -> ServiceDef<CaptureMod> {
    ServiceDef::new("capture", "capture.sock", on_client, |_| Ok(CaptureMod))
}

/// Classic pcap file header.
pub fn file_header(snaplen: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.write_u32::<LittleEndian>(PCAP_MAGIC).unwrap();
    out.write_u16::<LittleEndian>(PCAP_VERSION_MAJOR).unwrap();
    out.write_u16::<LittleEndian>(PCAP_VERSION_MINOR).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap(); // thiszone
    out.write_u32::<LittleEndian>(0).unwrap(); // sigfigs
    out.write_u32::<LittleEndian>(snaplen).unwrap();
    out.write_u32::<LittleEndian>(LINKTYPE_ETHERNET).unwrap();
    out
}

/// One pcap record: header plus packet bytes truncated to the snap length.
pub fn record(packet: &[u8], snaplen: u32) -> Vec<u8> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let incl = packet.len().min(snaplen as usize);

    let mut out = Vec::with_capacity(16 + incl);
    out.write_u32::<LittleEndian>(now.as_secs() as u32).unwrap();
    out.write_u32::<LittleEndian>(now.subsec_micros()).unwrap();
    out.write_u32::<LittleEndian>(incl as u32).unwrap();
    out.write_u32::<LittleEndian>(packet.len() as u32).unwrap();
    out.extend_from_slice(&packet[..incl]);
    out
}

fn respond(ctx: &mut ClientCtx<'_, CaptureMod>, resp: &StatusResp) {
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

fn on_client(_module: &mut CaptureMod, ctx: &mut ClientCtx<'_, CaptureMod>) {
    ctx.set_readable(Some(on_read_fd), true);
}

fn on_read_fd(_module: &mut CaptureMod, ctx: &mut ClientCtx<'_, CaptureMod>) {
    match ctx.recv_fd() {
        Ok(fd) => {
            ctx.conn().out = Some(File::from(fd));
            ctx.set_readable(Some(on_read_req), true);
        }
        Err(NetError::Again) => {}
        Err(err) => {
            debug!(ctx.log, "output fd receive failed"; "error" => %err);
            ctx.finish();
        }
    }
}

fn on_read_req(_module: &mut CaptureMod, ctx: &mut ClientCtx<'_, CaptureMod>) {
    let body = match ctx.recv_msg() {
        Ok(body) => body,
        Err(NetError::Again) => return,
        Err(err) => {
            debug!(ctx.log, "request receive failed"; "error" => %err);
            ctx.finish();
            return;
        }
    };

    let req: CaptureReq = match proto::from_body(&body) {
        Ok(req) => req,
        Err(_) => {
            respond(ctx, &StatusResp::err("capture request parse error"));
            return;
        }
    };

    let mut out = match ctx.conn().out.take() {
        Some(out) => out,
        None => {
            respond(ctx, &StatusResp::err("no output descriptor"));
            return;
        }
    };

    let sock = match rawsock::open(&req.ifname, req.promisc) {
        Ok(sock) => sock,
        Err(err) => {
            debug!(ctx.log, "capture socket failed"; "ifname" => req.ifname.as_str(), "error" => %err);
            respond(ctx, &StatusResp::err("capture socket failure"));
            return;
        }
    };

    if out.write_all(&file_header(req.snaplen)).is_err() {
        respond(ctx, &StatusResp::err("output write failure"));
        return;
    }

    info!(ctx.log, "capture started";
          "ifname" => req.ifname.as_str(), "promisc" => req.promisc, "snaplen" => req.snaplen);

    ctx.add_side_channel(SideChannel::owned(
        sock,
        Some(on_capture_readable),
        CaptureConn {
            out: Some(out),
            snaplen: req.snaplen,
        },
    ));

    respond(ctx, &StatusResp::ok("capturing"));
}

fn on_capture_readable(_module: &mut CaptureMod, ctx: &mut ClientCtx<'_, CaptureMod>) {
    let raw = ctx.raw_fd();
    let snaplen = ctx.conn().snaplen;
    let mut buf = [0u8; 65536];

    for _ in 0..DISPATCH_CNT {
        let n = unsafe { libc::recv(raw, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n < 0 {
            // EAGAIN ends the batch; anything else ends the capture
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::WouldBlock {
                debug!(ctx.log, "capture read failed"; "error" => %err);
                ctx.finish();
            }
            return;
        }
        if n == 0 {
            continue;
        }

        let rec = record(&buf[..n as usize], snaplen);
        let done = match ctx.conn().out.as_mut() {
            Some(out) => out.write_all(&rec).is_err(),
            None => true,
        };
        if done {
            // the reader went away; tear the capture down
            ctx.finish();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use std::io::Cursor;

    #[test]
    fn test_file_header_layout() {
        let hdr = file_header(65535);
        assert_eq!(hdr.len(), 24);

        let mut cur = Cursor::new(&hdr);
        assert_eq!(cur.read_u32::<LittleEndian>().unwrap(), PCAP_MAGIC);
        assert_eq!(cur.read_u16::<LittleEndian>().unwrap(), 2);
        assert_eq!(cur.read_u16::<LittleEndian>().unwrap(), 4);
        cur.set_position(16);
        assert_eq!(cur.read_u32::<LittleEndian>().unwrap(), 65535);
        assert_eq!(cur.read_u32::<LittleEndian>().unwrap(), LINKTYPE_ETHERNET);
    }

    #[test]
    fn test_record_truncates_to_snaplen() {
        let packet = vec![7u8; 2000];
        let rec = record(&packet, 96);
        assert_eq!(rec.len(), 16 + 96);

        let mut cur = Cursor::new(&rec);
        let _ts_sec = cur.read_u32::<LittleEndian>().unwrap();
        let _ts_usec = cur.read_u32::<LittleEndian>().unwrap();
        assert_eq!(cur.read_u32::<LittleEndian>().unwrap(), 96); // incl_len
        assert_eq!(cur.read_u32::<LittleEndian>().unwrap(), 2000); // orig_len
        assert_eq!(&rec[16..], &packet[..96]);
    }

    #[test]
    fn test_record_short_packet_kept_whole() {
        let packet = vec![1u8; 60];
        let rec = record(&packet, 65535);
        assert_eq!(rec.len(), 16 + 60);
        let mut cur = Cursor::new(&rec[8..16]);
        assert_eq!(cur.read_u32::<LittleEndian>().unwrap(), 60);
        assert_eq!(cur.read_u32::<LittleEndian>().unwrap(), 60);
    }
}
