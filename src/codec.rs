//! Wire framing for calls.
//!
//! Each call owns one bidirectional QUIC stream carrying length-prefixed frames:
//!
//! ```text
//! +----------------+-----------+----------------+
//! | len: u32 (LE)  | kind: u8  | body (len - 1) |
//! +----------------+-----------+----------------+
//! ```
//!
//! The client opens with a `Header`, follows with `Data` frames and half-closes
//! with `End`. The server answers with `Data` frames and ends the call with a
//! single `Status` trailer. `Cancel` travels client to server when the caller
//! gives up, carrying the reason.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    status::{Code, Status},
    transport::{QuicRecvAdapter, QuicSendAdapter},
    RpcError,
};

pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

const KIND_HEADER: u8 = 1;
const KIND_DATA: u8 = 2;
const KIND_END: u8 = 3;
const KIND_STATUS: u8 = 4;
const KIND_CANCEL: u8 = 5;

/// Message cardinality of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pattern {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl Pattern {
    /// Whether the caller may send more than one request.
    pub fn streams_requests(self) -> bool {
        matches!(self, Pattern::ClientStreaming | Pattern::BidiStreaming)
    }

    /// Whether the server may send more than one response.
    pub fn streams_responses(self) -> bool {
        matches!(self, Pattern::ServerStreaming | Pattern::BidiStreaming)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHeader {
    id: u64,
    method: String,
    pattern: Pattern,
    timeout_ms: Option<u64>,
}

impl CallHeader {
    pub fn new(id: u64, method: impl Into<String>, pattern: Pattern, timeout: Option<Duration>) -> Self {
        Self {
            id,
            method: method.into(),
            pattern,
            timeout_ms: timeout.map(|t| t.as_nanos().div_ceil(1_000_000).min(u64::MAX as u128) as u64),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    /// Time the caller is still willing to wait, measured when the header was sent.
    ///
    /// Rounded up to whole milliseconds, so the server never expires a call
    /// before the caller does.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Header(CallHeader),
    Data(Bytes),
    End,
    Status(Status),
    Cancel(Code),
}

impl Frame {
    pub fn data<T: Serialize>(message: &T) -> Result<Self, RpcError> {
        Ok(Frame::Data(Bytes::from(bincode::serialize(message)?)))
    }

    pub fn decode_data<T: DeserializeOwned>(payload: &[u8]) -> Result<T, RpcError> {
        Ok(bincode::deserialize(payload)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Header(_) => "header",
            Frame::Data(_) => "data",
            Frame::End => "end",
            Frame::Status(_) => "status",
            Frame::Cancel(_) => "cancel",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    fn oversized(&self, len: usize) -> RpcError {
        RpcError::TransportError(format!(
            "frame of {len} bytes exceeds the {} byte limit",
            self.max_frame_size
        ))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, RpcError> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len == 0 {
            return Err(RpcError::TransportError("zero-length frame".to_string()));
        }
        if len > self.max_frame_size {
            return Err(self.oversized(len));
        }
        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let mut body = src.split_to(len);
        let kind = body.get_u8();
        let body = body.freeze();

        let frame = match kind {
            KIND_HEADER => Frame::Header(bincode::deserialize(&body)?),
            KIND_DATA => Frame::Data(body),
            KIND_END => Frame::End,
            KIND_STATUS => Frame::Status(bincode::deserialize(&body)?),
            KIND_CANCEL => Frame::Cancel(bincode::deserialize(&body)?),
            other => {
                return Err(RpcError::TransportError(format!("unknown frame kind {other}")));
            }
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = RpcError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), RpcError> {
        let (kind, body): (u8, Bytes) = match frame {
            Frame::Header(header) => (KIND_HEADER, bincode::serialize(&header)?.into()),
            Frame::Data(payload) => (KIND_DATA, payload),
            Frame::End => (KIND_END, Bytes::new()),
            Frame::Status(status) => (KIND_STATUS, bincode::serialize(&status)?.into()),
            Frame::Cancel(code) => (KIND_CANCEL, bincode::serialize(&code)?.into()),
        };

        let len = 1 + body.len();
        if len > self.max_frame_size {
            return Err(self.oversized(len));
        }

        dst.reserve(LENGTH_PREFIX + len);
        dst.put_u32_le(len as u32);
        dst.put_u8(kind);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// Reassembles frames from the receive half of a stream.
pub(crate) struct FrameReader {
    source: Box<dyn QuicRecvAdapter>,
    buffer: BytesMut,
    codec: FrameCodec,
}

impl FrameReader {
    pub(crate) fn new(source: Box<dyn QuicRecvAdapter>, codec: FrameCodec) -> Self {
        Self {
            source,
            buffer: BytesMut::with_capacity(8192),
            codec,
        }
    }

    /// Next complete frame, `Ok(None)` when the peer finished the stream on a frame boundary.
    ///
    /// Cancel safe: partial frames stay buffered across calls.
    pub(crate) async fn next_frame(&mut self) -> Result<Option<Frame>, RpcError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            match self.source.receive_bytes().await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None if self.buffer.is_empty() => return Ok(None),
                None => {
                    return Err(RpcError::TransportError(format!(
                        "stream ended inside a frame ({} bytes buffered)",
                        self.buffer.len()
                    )));
                }
            }
        }
    }
}

pub(crate) struct FrameWriter {
    sink: Box<dyn QuicSendAdapter>,
    codec: FrameCodec,
}

impl FrameWriter {
    pub(crate) fn new(sink: Box<dyn QuicSendAdapter>, codec: FrameCodec) -> Self {
        Self { sink, codec }
    }

    pub(crate) async fn write_frame(&mut self, frame: Frame) -> Result<(), RpcError> {
        let mut buf = BytesMut::new();
        self.codec.encode(frame, &mut buf)?;
        self.sink.send_bytes(buf.freeze()).await
    }

    pub(crate) async fn finish(&mut self) -> Result<(), RpcError> {
        self.sink.finish().await
    }
}
