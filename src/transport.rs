//! Seams between the call machinery and QUIC.
//!
//! The server and client only see these traits, so tests can swap s2n-quic for
//! the in-memory transport in [`memory`].

use async_trait::async_trait;
use bytes::Bytes;
use s2n_quic::stream::{BidirectionalStream, ReceiveStream, SendStream};

use crate::RpcError;

#[async_trait]
pub(crate) trait QuicSendAdapter: Send {
    async fn send_bytes(&mut self, data: Bytes) -> Result<(), RpcError>;

    /// Half-closes the stream; the peer reads end-of-stream after the last byte.
    async fn finish(&mut self) -> Result<(), RpcError>;
}

#[async_trait]
pub(crate) trait QuicRecvAdapter: Send {
    /// Next chunk, `Ok(None)` once the peer finished its side.
    async fn receive_bytes(&mut self) -> Result<Option<Bytes>, RpcError>;
}

pub(crate) trait QuicStreamAdapter: Send {
    fn split(self: Box<Self>) -> (Box<dyn QuicRecvAdapter>, Box<dyn QuicSendAdapter>);
}

impl QuicStreamAdapter for BidirectionalStream {
    fn split(self: Box<Self>) -> (Box<dyn QuicRecvAdapter>, Box<dyn QuicSendAdapter>) {
        let (recv, send) = BidirectionalStream::split(*self);
        (Box::new(recv), Box::new(send))
    }
}

#[async_trait]
impl QuicSendAdapter for SendStream {
    async fn send_bytes(&mut self, data: Bytes) -> Result<(), RpcError> {
        self.send(data)
            .await
            .map_err(|err| RpcError::TransportError(err.to_string()))
    }

    async fn finish(&mut self) -> Result<(), RpcError> {
        SendStream::finish(self).map_err(|err| RpcError::TransportError(err.to_string()))
    }
}

#[async_trait]
impl QuicRecvAdapter for ReceiveStream {
    async fn receive_bytes(&mut self) -> Result<Option<Bytes>, RpcError> {
        self.receive()
            .await
            .map_err(|err| RpcError::TransportError(err.to_string()))
    }
}

#[async_trait]
pub(crate) trait QuicConnectionAdapter: Send + Sync {
    async fn open_bidirectional_stream(&mut self) -> Result<Box<dyn QuicStreamAdapter>, RpcError>;
}

pub(crate) struct RealConnectionAdapter {
    inner: s2n_quic::Connection,
}

impl RealConnectionAdapter {
    pub(crate) fn new(inner: s2n_quic::Connection) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl QuicConnectionAdapter for RealConnectionAdapter {
    async fn open_bidirectional_stream(&mut self) -> Result<Box<dyn QuicStreamAdapter>, RpcError> {
        let stream = self
            .inner
            .open_bidirectional_stream()
            .await
            .map_err(|e| RpcError::ConnectionError(e.to_string()))?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
pub(crate) trait QuicServerConnectionAdapter: Send {
    async fn accept_bidirectional_stream(
        &mut self,
    ) -> Result<Option<Box<dyn QuicStreamAdapter>>, RpcError>;
}

pub(crate) struct RealServerConnectionAdapter {
    inner: s2n_quic::connection::Connection,
}

impl RealServerConnectionAdapter {
    fn new(inner: s2n_quic::connection::Connection) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl QuicServerConnectionAdapter for RealServerConnectionAdapter {
    async fn accept_bidirectional_stream(
        &mut self,
    ) -> Result<Option<Box<dyn QuicStreamAdapter>>, RpcError> {
        match self.inner.accept_bidirectional_stream().await {
            Ok(Some(stream)) => Ok(Some(Box::new(stream))),
            Ok(None) => Ok(None),
            Err(e) => Err(RpcError::ConnectionError(e.to_string())),
        }
    }
}

#[async_trait]
pub(crate) trait QuicServerAdapter: Send {
    async fn accept(&mut self) -> Option<Box<dyn QuicServerConnectionAdapter>>;
}

pub(crate) struct RealServerAdapter {
    inner: s2n_quic::Server,
}

impl RealServerAdapter {
    pub(crate) fn new(inner: s2n_quic::Server) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl QuicServerAdapter for RealServerAdapter {
    async fn accept(&mut self) -> Option<Box<dyn QuicServerConnectionAdapter>> {
        self.inner
            .accept()
            .await
            .map(|connection| Box::new(RealServerConnectionAdapter::new(connection)) as _)
    }
}
