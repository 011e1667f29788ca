use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use s2n_quic::{client::Connect, Client};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    call::{read_responses, write_requests, Call},
    channel::{channel, MessageReceiver},
    codec::{CallHeader, Frame, FrameCodec, FrameReader, FrameWriter, Pattern},
    config::{quic_limits, RpcConfig},
    context::CallContext,
    transport::{QuicConnectionAdapter, RealConnectionAdapter},
    RpcError,
};

/// One QUIC connection; every call opens its own stream on it.
#[derive(Clone)]
pub struct RpcClient {
    connection: Arc<RwLock<Box<dyn QuicConnectionAdapter>>>,
    config: RpcConfig,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    pub async fn connect(connect_addr: SocketAddr, config: RpcConfig) -> Result<Self, RpcError> {
        let client = Client::builder()
            .with_tls(config.cert_path.as_path())
            .map_err(|e| RpcError::TlsError(format!("{:?}", e)))?
            .with_limits(quic_limits()?)
            .map_err(|e| RpcError::ConfigError(format!("Failed to apply client limits: {:?}", e)))?
            .with_io(config.bind_address.as_str())
            .map_err(|e| RpcError::ConfigError(format!("{:?}", e)))?
            .start()
            .map_err(|e| RpcError::ConfigError(format!("{:?}", e)))?;

        let connect = Connect::new(connect_addr).with_server_name(config.server_name.as_str());
        let mut connection = client
            .connect(connect)
            .await
            .map_err(|e| RpcError::ConnectionError(e.to_string()))?;

        if let Some(_interval) = config.keep_alive_interval {
            connection
                .keep_alive(true)
                .map_err(|e| RpcError::ConfigError(e.to_string()))?;
        }
        debug!("connected to {}", connect_addr);

        Ok(Self::with_connection(
            Box::new(RealConnectionAdapter::new(connection)),
            config,
        ))
    }

    pub(crate) fn with_connection(connection: Box<dyn QuicConnectionAdapter>, config: RpcConfig) -> Self {
        Self {
            connection: Arc::new(RwLock::new(connection)),
            config,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Opens a call on a fresh stream and starts its pumps.
    ///
    /// The deadline of `context`, if any, travels to the server as the time
    /// remaining when the header is written.
    pub async fn open<Req, Resp>(
        &self,
        method: &str,
        pattern: Pattern,
        context: CallContext,
    ) -> Result<Call<Req, Resp>, RpcError>
    where
        Req: Serialize + Send + 'static,
        Resp: DeserializeOwned + Send + 'static,
    {
        context.check()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let stream = {
            let mut conn = self.connection.write().await;
            conn.open_bidirectional_stream().await?
        };
        let (recv, send) = stream.split();
        let codec = FrameCodec::new(self.config.max_frame_size);
        let reader = FrameReader::new(recv, codec.clone());
        let mut writer = FrameWriter::new(send, codec);

        let header = CallHeader::new(id, method, pattern, context.remaining());
        writer.write_frame(Frame::Header(header)).await?;
        debug!(id, method, "call opened");

        let buffer = self.config.message_buffer;
        let (request_tx, request_rx) = channel::<Req>(&context, buffer);
        let (response_tx, response_rx) = channel::<Resp>(&context, buffer);
        tokio::spawn(write_requests(writer, request_rx, context.clone()));
        tokio::spawn(read_responses(reader, response_tx, context.clone()));

        Ok(Call::new(id, method, pattern, request_tx, response_rx, context))
    }

    pub async fn unary<Req, Resp>(&self, method: &str, request: Req, context: CallContext) -> Result<Resp, RpcError>
    where
        Req: Serialize + Send + 'static,
        Resp: DeserializeOwned + Send + 'static,
    {
        let mut call = self.open(method, Pattern::Unary, context).await?;
        call.send(request).await?;
        call.receive_single().await
    }

    /// Sends the single request and hands back the response stream.
    pub async fn server_streaming<Req, Resp>(
        &self,
        method: &str,
        request: Req,
        context: CallContext,
    ) -> Result<MessageReceiver<Resp>, RpcError>
    where
        Req: Serialize + Send + 'static,
        Resp: DeserializeOwned + Send + 'static,
    {
        let mut call = self.open(method, Pattern::ServerStreaming, context).await?;
        call.send(request).await?;
        Ok(call.into_responses())
    }

    /// Opens a call the caller streams into; finish it with [`Call::close_and_receive`].
    pub async fn client_streaming<Req, Resp>(
        &self,
        method: &str,
        context: CallContext,
    ) -> Result<Call<Req, Resp>, RpcError>
    where
        Req: Serialize + Send + 'static,
        Resp: DeserializeOwned + Send + 'static,
    {
        self.open(method, Pattern::ClientStreaming, context).await
    }

    pub async fn bidi_streaming<Req, Resp>(
        &self,
        method: &str,
        context: CallContext,
    ) -> Result<Call<Req, Resp>, RpcError>
    where
        Req: Serialize + Send + 'static,
        Resp: DeserializeOwned + Send + 'static,
    {
        self.open(method, Pattern::BidiStreaming, context).await
    }
}
