//! Request/response bodies for the service sockets.
//!
//! Bodies are JSON objects inside the netstring envelope. Handlers only ever
//! see them through these typed bags; the framing layer treats them as
//! opaque bytes.

use crate::net::support::{Cause, NetError, NetResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Serialize a message into a frame body.
pub fn to_body<T: Serialize>(msg: &T) -> NetResult<Vec<u8>> {
    serde_json::to_vec(msg).map_err(|_| NetError::Fatal(Cause::Malformed))
}

/// Parse a frame body into a message.
pub fn from_body<T: DeserializeOwned>(body: &[u8]) -> NetResult<T> {
    serde_json::from_slice(body).map_err(|_| NetError::Fatal(Cause::Malformed))
}

/// Resolver request: a delimited list of host names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveReq {
    pub hosts: String,
}

/// Job-runner request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobReq {
    /// One of "start", "status", "stop", "log".
    pub action: String,
    /// Job type for "start"; names an executable in the job directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Job id for "status", "stop" and "log".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// "NAME=VALUE" parameters exported into the job environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
    /// Per-job timeout in seconds; the daemon default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Generic status response used by every request/response service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusResp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub okmsg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
}

impl StatusResp {
    pub fn ok<S: Into<String>>(msg: S) -> StatusResp {
        StatusResp {
            okmsg: Some(msg.into()),
            errmsg: None,
        }
    }

    pub fn err<S: Into<String>>(msg: S) -> StatusResp {
        StatusResp {
            okmsg: None,
            errmsg: Some(msg.into()),
        }
    }
}

/// Ether-frame transmit request: raw frames for one interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtherReq {
    pub ifname: String,
    pub frames: Vec<Vec<u8>>,
}

/// Packet capture request. The output fd travels separately, before the
/// frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureReq {
    pub ifname: String,
    #[serde(default)]
    pub promisc: bool,
    #[serde(default = "default_snaplen")]
    pub snaplen: u32,
}

fn default_snaplen() -> u32 {
    65535
}

/// System information response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SysinfoResp {
    /// Seconds since boot.
    pub uptime: u64,
    pub loadavg: [f64; 3],
    /// Fraction of filesystem blocks free under the configured root.
    pub fcap: f64,
    /// Fraction of inodes free under the configured root.
    pub icap: f64,
}

/// One banner-grab observation, as emitted by the scanner client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BannerRecord {
    /// Host name the target was resolved from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub addr: String,
    pub port: u16,
    /// Whatever the peer sent first, possibly empty.
    pub banner: Vec<u8>,
    /// PEM-encoded certificate chain for TLS grabs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certs: Option<String>,
}
