//! The control channel between the `vsbmc` CLI and the supervisor.
//!
//! Request/reply over local TCP. Every message is framed as a `u32`
//! little-endian payload length followed by a UTF-8 JSON payload. One
//! request is in flight per connection; the supervisor replies and the
//! client closes the socket.

use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::{Error, Result};

/// Upper bound on a frame payload; anything larger is a protocol error.
const MAX_FRAME_LEN: u32 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Request / Reply
// ---------------------------------------------------------------------------

/// A command sent by the CLI to the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Add {
        vm_name: String,
        #[serde(default)]
        vm_uuid: Option<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        address: Option<String>,
        #[serde(default)]
        fakemac: Option<String>,
        #[serde(default)]
        viserver: Option<String>,
        #[serde(default)]
        viserver_username: Option<String>,
        #[serde(default)]
        viserver_password: Option<String>,
    },
    Delete {
        vm_names: Vec<String>,
    },
    Start {
        vm_names: Vec<String>,
    },
    Stop {
        vm_names: Vec<String>,
    },
    List {
        #[serde(default)]
        fakemac: bool,
    },
    Show {
        vm_name: String,
    },
}

/// The supervisor's reply: `rc` 0 on success, with `msg` lines on error
/// and `header`/`rows` for the listers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reply {
    pub rc: i32,
    #[serde(default)]
    pub msg: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<String>>>,
}

impl Reply {
    pub fn ok() -> Self {
        Reply::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply {
            rc: 1,
            msg: vec![message.into()],
            ..Reply::default()
        }
    }

    pub fn table(header: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Reply {
            rc: 0,
            msg: Vec::new(),
            header: Some(header),
            rows: Some(rows),
        }
    }

    /// Merge another reply into this one, keeping the worst `rc`. Used by
    /// the multi-VM commands (`delete`, `start`, `stop`).
    pub fn merge(&mut self, other: Reply) {
        if other.rc != 0 {
            self.rc = other.rc;
        }
        self.msg.extend(other.msg);
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Write one length-framed JSON message.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(Error::Control("frame too large".into()));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-framed JSON message.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(Error::Control(format!("oversized frame: {} bytes", len)));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Send one request to the supervisor and await its reply, bounded by
/// `timeout`.
pub async fn call(addr: SocketAddr, request: &Request, timeout: Duration) -> Result<Reply> {
    tokio::time::timeout(timeout, async {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, request).await?;
        read_frame(&mut stream).await
    })
    .await
    .map_err(|_| Error::Control("server response timed out".into()))?
}
