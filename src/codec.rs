//! Wire codec: `SyncMessage` payload encoding and async frame I/O
//!
//! Every connection carries frames of `8 ASCII digits | payload`. The payload
//! is a bincode-encoded record whose optional fields are omitted for message
//! types that do not use them.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::protocol::timeouts::{read_deadline_ms, write_deadline_ms, DIAL_MS};
use crate::protocol::{MsgType, HEADER_LEN, VERSION};
use crate::protocol_core::{build_frame_header, parse_frame_header, validate_frame_size};

/// One protocol message. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct SyncMessage {
    pub version: u32,
    pub msg_type: MsgType,
    pub file_name: Option<String>,
    pub file_md5: Option<String>,
    pub content_len: Option<u32>,
    pub content: Option<Vec<u8>>,
}

// On-wire shape; msg_type stays numeric so unknown ids reach the validator
#[derive(Serialize, Deserialize)]
struct WireMessage {
    version: u32,
    msg_type: u32,
    file_name: Option<String>,
    file_md5: Option<String>,
    content_len: Option<u32>,
    content: Option<Vec<u8>>,
}

impl SyncMessage {
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            version: VERSION,
            msg_type,
            file_name: None,
            file_md5: None,
            content_len: None,
            content: None,
        }
    }

    pub fn heartbeat_req() -> Self {
        Self::new(MsgType::HeartbeatReq).with_content_len(0)
    }

    pub fn heartbeat_res() -> Self {
        Self::new(MsgType::HeartbeatRes).with_content_len(0)
    }

    /// `COMMON_RESP_OK` or `COMMON_RESP_FAIL`
    pub fn response(ok: bool) -> Self {
        let t = if ok { MsgType::RespOk } else { MsgType::RespFail };
        Self::new(t).with_content_len(0)
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_file_md5(mut self, md5: impl Into<String>) -> Self {
        self.file_md5 = Some(md5.into());
        self
    }

    pub fn with_content_len(mut self, len: u32) -> Self {
        self.content_len = Some(len);
        self
    }

    /// Attach a whole-file body; `content_len` follows the body length
    pub fn with_content(mut self, content: Vec<u8>) -> Result<Self> {
        let len = u32::try_from(content.len())
            .with_context(|| format!("content of {} bytes exceeds u32", content.len()))?;
        self.content_len = Some(len);
        self.content = Some(content);
        Ok(self)
    }

    pub fn file_name(&self) -> &str {
        self.file_name.as_deref().unwrap_or("")
    }

    pub fn file_md5(&self) -> &str {
        self.file_md5.as_deref().unwrap_or("")
    }

    pub fn content_len(&self) -> u32 {
        self.content_len.unwrap_or(0)
    }

    pub fn content(&self) -> &[u8] {
        self.content.as_deref().unwrap_or(&[])
    }

    pub fn is_ok(&self) -> bool {
        self.msg_type == MsgType::RespOk
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = WireMessage {
            version: self.version,
            msg_type: self.msg_type.id(),
            file_name: self.file_name.clone(),
            file_md5: self.file_md5.clone(),
            content_len: self.content_len,
            content: self.content.clone(),
        };
        bincode::serialize(&wire).context("encode message")
    }

    /// Decode a payload, rejecting foreign versions and unknown message types
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let wire: WireMessage = bincode::deserialize(payload).context("decode message")?;
        if wire.version != VERSION {
            bail!(
                "protocol version mismatch: got {}, expected {}",
                wire.version,
                VERSION
            );
        }
        let Some(msg_type) = MsgType::from_id(wire.msg_type) else {
            bail!("unknown message type {}", wire.msg_type);
        };
        Ok(Self {
            version: wire.version,
            msg_type,
            file_name: wire.file_name,
            file_md5: wire.file_md5,
            content_len: wire.content_len,
            content: wire.content,
        })
    }
}

// Content is elided so debug logs stay readable
impl fmt::Debug for SyncMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version:{},msgType:{},msgName:{},filename:{},filemd5:{},contentLen:{}",
            self.version,
            self.msg_type.id(),
            self.msg_type.name(),
            self.file_name(),
            self.file_md5(),
            self.content_len()
        )
    }
}

/// Connect with the protocol dial timeout
pub async fn dial(addr: &str) -> Result<TcpStream> {
    let stream = match timeout(Duration::from_millis(DIAL_MS), TcpStream::connect(addr)).await {
        Ok(res) => res.with_context(|| format!("dial {}", addr))?,
        Err(_) => bail!("dial {} timed out ({} ms)", addr, DIAL_MS),
    };
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Fill `buf` completely, accumulating partial reads.
/// End of stream before `buf` is full is an error, never a short result.
async fn read_full<S>(stream: &mut S, buf: &mut [u8], what: &str) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream
            .read(&mut buf[filled..])
            .await
            .with_context(|| format!("read {}", what))?;
        if n == 0 {
            bail!(
                "connection closed after {} of {} {} bytes",
                filled,
                buf.len(),
                what
            );
        }
        filled += n;
    }
    Ok(())
}

/// Write one frame: header then payload, all bytes or an error
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let header = build_frame_header(payload.len())?;
    let ms = write_deadline_ms(payload.len());
    match timeout(Duration::from_millis(ms), async {
        stream.write_all(&header).await?;
        if !payload.is_empty() {
            stream.write_all(payload).await?;
        }
        stream.flush().await
    })
    .await
    {
        Ok(result) => result.context("write frame"),
        Err(_) => bail!("frame write timeout ({} ms)", ms),
    }
}

/// Read one frame payload
pub async fn read_frame<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    read_full(stream, &mut header, "frame header").await?;
    let len = parse_frame_header(&header)?;
    validate_frame_size(len)?;
    let mut payload = vec![0u8; len];
    read_full(stream, &mut payload, "frame payload").await?;
    Ok(payload)
}

pub async fn read_frame_timed<S>(stream: &mut S, ms: u64) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    match timeout(Duration::from_millis(ms), read_frame(stream)).await {
        Ok(res) => res,
        Err(_) => bail!("frame read timeout ({} ms)", ms),
    }
}

/// Read one frame with separate deadlines: `header_ms` for the header, then
/// one sized by the declared length for the payload
pub async fn read_frame_bounded<S>(stream: &mut S, header_ms: u64) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match timeout(
        Duration::from_millis(header_ms),
        read_full(stream, &mut header, "frame header"),
    )
    .await
    {
        Ok(res) => res?,
        Err(_) => bail!("frame header read timeout ({} ms)", header_ms),
    }
    let len = parse_frame_header(&header)?;
    validate_frame_size(len)?;
    let mut payload = vec![0u8; len];
    let ms = read_deadline_ms(len);
    match timeout(
        Duration::from_millis(ms),
        read_full(stream, &mut payload, "frame payload"),
    )
    .await
    {
        Ok(res) => res?,
        Err(_) => bail!("frame payload read timeout ({} ms)", ms),
    }
    Ok(payload)
}

pub async fn write_message<S>(stream: &mut S, msg: &SyncMessage) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let payload = msg.encode()?;
    write_frame(stream, &payload).await
}

pub async fn read_message<S>(stream: &mut S) -> Result<SyncMessage>
where
    S: AsyncRead + Unpin,
{
    let payload = read_frame(stream).await?;
    SyncMessage::decode(&payload)
}

pub async fn read_message_timed<S>(stream: &mut S, ms: u64) -> Result<SyncMessage>
where
    S: AsyncRead + Unpin,
{
    let payload = read_frame_timed(stream, ms).await?;
    SyncMessage::decode(&payload)
}

/// `read_message` for a peer that must start talking within `header_ms`
pub async fn read_message_bounded<S>(stream: &mut S, header_ms: u64) -> Result<SyncMessage>
where
    S: AsyncRead + Unpin,
{
    let payload = read_frame_bounded(stream, header_ms).await?;
    SyncMessage::decode(&payload)
}
