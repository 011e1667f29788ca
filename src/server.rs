use std::{
    any::Any, collections::HashMap, future::Future, net::SocketAddr, panic::AssertUnwindSafe,
    pin::Pin, sync::Arc,
};

use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    call::{read_requests, write_responses},
    channel::{channel, MessageReceiver, MessageSender},
    codec::{CallHeader, Frame, FrameCodec, FrameReader, FrameWriter, Pattern},
    config::{canonicalize_path, quic_limits, RpcConfig},
    context::CallContext,
    status::{CallStatus, Code, Status},
    transport::{QuicServerAdapter, QuicStreamAdapter, RealServerAdapter},
    RpcError,
};

type CallHandlerFn = Arc<
    dyn Fn(FrameReader, FrameWriter, CallContext) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

#[derive(Clone)]
struct RegisteredMethod {
    pattern: Pattern,
    handler: CallHandlerFn,
}

type MethodTable = Arc<RwLock<HashMap<String, RegisteredMethod>>>;

#[derive(Clone)]
pub struct RpcServer {
    methods: MethodTable,

    pub socket_addr: Option<SocketAddr>,

    pub config: RpcConfig,
}

impl RpcServer {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            methods: Arc::new(RwLock::new(HashMap::new())),
            socket_addr: None,
            config,
        }
    }

    /// One request in, one response out.
    pub async fn register_unary<Req, Resp, F, Fut>(&self, method: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let name = method.to_string();
        self.register_call(
            method,
            Pattern::Unary,
            move |mut requests: MessageReceiver<Req>,
                  mut responses: MessageSender<Resp>,
                  context: CallContext| {
                let handler = handler.clone();
                let name = name.clone();
                async move {
                    let request = single_request(&name, &mut requests).await?;
                    let response = handler(request, context).await?;
                    responses.send(response).await
                }
            },
        )
        .await;
    }

    /// One request in, the handler streams responses through the sender.
    pub async fn register_server_streaming<Req, Resp, F, Fut>(&self, method: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, MessageSender<Resp>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let name = method.to_string();
        self.register_call(
            method,
            Pattern::ServerStreaming,
            move |mut requests: MessageReceiver<Req>,
                  responses: MessageSender<Resp>,
                  context: CallContext| {
                let handler = handler.clone();
                let name = name.clone();
                async move {
                    let request = single_request(&name, &mut requests).await?;
                    handler(request, responses, context).await
                }
            },
        )
        .await;
    }

    /// The handler reads requests until end-of-input and answers once.
    pub async fn register_client_streaming<Req, Resp, F, Fut>(&self, method: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(MessageReceiver<Req>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register_call(
            method,
            Pattern::ClientStreaming,
            move |requests: MessageReceiver<Req>,
                  mut responses: MessageSender<Resp>,
                  context: CallContext| {
                let handler = handler.clone();
                async move {
                    let response = handler(requests, context).await?;
                    responses.send(response).await
                }
            },
        )
        .await;
    }

    pub async fn register_bidi_streaming<Req, Resp, F, Fut>(&self, method: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(MessageReceiver<Req>, MessageSender<Resp>, CallContext) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        self.register_call(method, Pattern::BidiStreaming, handler).await;
    }

    async fn register_call<Req, Resp, F, Fut>(&self, method: &str, pattern: Pattern, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(MessageReceiver<Req>, MessageSender<Resp>, CallContext) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let buffer = self.config.message_buffer;
        let call_handler: CallHandlerFn = Arc::new(
            move |reader: FrameReader, writer: FrameWriter, context: CallContext| {
                let handler = handler.clone();
                Box::pin(serve_call(handler, reader, writer, context, buffer))
                    as Pin<Box<dyn Future<Output = ()> + Send>>
            },
        );

        self.methods.write().await.insert(
            method.to_string(),
            RegisteredMethod {
                pattern,
                handler: call_handler,
            },
        );
    }

    pub async fn start(&mut self, server: s2n_quic::Server) -> Result<(), RpcError> {
        let mut adapter = RealServerAdapter::new(server);
        self.start_with_adapter(&mut adapter).await
    }

    pub(crate) async fn start_with_adapter<A>(&mut self, server: &mut A) -> Result<(), RpcError>
    where
        A: QuicServerAdapter,
    {
        let codec = FrameCodec::new(self.config.max_frame_size);

        while let Some(mut connection) = server.accept().await {
            let methods = self.methods.clone();
            let codec = codec.clone();

            tokio::spawn(async move {
                debug!("connection accepted");
                loop {
                    match connection.accept_bidirectional_stream().await {
                        Ok(Some(stream)) => {
                            tokio::spawn(Self::handle_stream(
                                methods.clone(),
                                codec.clone(),
                                stream,
                            ));
                        }
                        Ok(None) => break,
                        Err(err) => {
                            debug!("connection closed: {}", err);
                            break;
                        }
                    }
                }
            });
        }

        Ok(())
    }

    async fn handle_stream(methods: MethodTable, codec: FrameCodec, stream: Box<dyn QuicStreamAdapter>) {
        let (recv, send) = stream.split();
        let mut reader = FrameReader::new(recv, codec.clone());
        let mut writer = FrameWriter::new(send, codec);

        let header = match reader.next_frame().await {
            Ok(Some(Frame::Header(header))) => header,
            Ok(Some(frame)) => {
                let message = format!("expected a header, got a {} frame", frame.kind());
                reject(&mut writer, message).await;
                return;
            }
            Ok(None) => return,
            Err(err) => {
                debug!("failed to read call header: {}", err);
                return;
            }
        };

        let registered = methods.read().await.get(header.method()).cloned();
        let handler = match registered {
            Some(method) if method.pattern == header.pattern() => method.handler,
            Some(method) => {
                let message = format!(
                    "{} is a {:?} method, called as {:?}",
                    header.method(),
                    method.pattern,
                    header.pattern()
                );
                warn!("{}", message);
                reject(&mut writer, message).await;
                return;
            }
            None => {
                let err = RpcError::UnknownMethod(header.method().to_string());
                warn!("{}", err);
                reject(&mut writer, err.to_string()).await;
                return;
            }
        };

        let context = call_context(&header);
        debug!(id = header.id(), method = header.method(), "call started");
        handler(reader, writer, context).await;
    }

    pub fn bind(&mut self) -> Result<s2n_quic::Server, RpcError> {
        let cert_path = canonicalize_path(&self.config.cert_path)?;
        let key_path =
            self.config.key_path.as_ref().ok_or_else(|| {
                RpcError::ConfigError("Server key path not configured".to_string())
            })?;
        let key_path = canonicalize_path(key_path)?;

        let server = s2n_quic::Server::builder()
            .with_tls((cert_path.as_path(), key_path.as_path()))
            .map_err(|e| RpcError::TlsError(format!("{:?}", e)))?
            .with_limits(quic_limits()?)
            .map_err(|e| RpcError::ConfigError(format!("Failed to apply limits: {:?}", e)))?
            .with_io(self.config.bind_address.as_str())
            .map_err(|e| RpcError::ConfigError(format!("{:?}", e)))?
            .start()
            .map_err(|e| RpcError::ConfigError(format!("{:?}", e)))?;

        let local_addr = server.local_addr().map_err(|_err| {
            RpcError::ConfigError("Could not retrieve local_addr() from server".to_string())
        })?;

        self.socket_addr = Some(local_addr);
        info!("RPC server listening on {local_addr}");
        Ok(server)
    }
}

fn call_context(header: &CallHeader) -> CallContext {
    match header.timeout() {
        Some(timeout) => CallContext::with_timeout(timeout),
        None => CallContext::new(),
    }
}

async fn reject(writer: &mut FrameWriter, message: String) {
    let status = Status::new(Code::Internal, message);
    if let Err(err) = writer.write_frame(Frame::Status(status)).await {
        debug!("failed to reject call: {}", err);
    }
    let _ = writer.finish().await;
}

async fn single_request<Req>(method: &str, requests: &mut MessageReceiver<Req>) -> Result<Req, RpcError> {
    requests
        .receive()
        .await?
        .ok_or_else(|| RpcError::InternalError(format!("{method} called without a request")))
}

/// Runs one call: both pumps on their own tasks, the handler on this one.
///
/// A panicking handler ends the call with an `INTERNAL` status.
async fn serve_call<Req, Resp, F, Fut>(
    handler: Arc<F>,
    reader: FrameReader,
    writer: FrameWriter,
    context: CallContext,
    buffer: usize,
) where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(MessageReceiver<Req>, MessageSender<Resp>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
{
    let (request_tx, request_rx) = channel::<Req>(&context, buffer);
    let (response_tx, response_rx) = channel::<Resp>(&context, buffer);

    let inbound = tokio::spawn(read_requests(reader, request_tx, context.clone()));
    let outbound = tokio::spawn(write_responses(writer, response_rx, context.clone()));

    let work = AssertUnwindSafe(handler(request_rx, response_tx, context.clone())).catch_unwind();
    let outcome = context
        .run(async move {
            work.await.unwrap_or_else(|panic| {
                warn!("handler panicked: {}", panic_message(panic.as_ref()));
                Err(RpcError::InternalError("handler panicked".to_string()))
            })
        })
        .await;

    match outcome {
        Ok(()) => {
            context.complete();
        }
        Err(err) => {
            if context.finish(CallStatus::from(&err)) {
                debug!("handler failed: {}", err);
            }
        }
    }

    let (inbound, outbound) = tokio::join!(inbound, outbound);
    if let Err(err) = inbound.and(outbound) {
        warn!("call pump panicked: {}", err);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}

#[cfg(test)]
impl RpcServer {
    /// Serves this server over the in-memory transport and returns a connected client.
    pub(crate) fn serve_in_memory(mut self) -> crate::RpcClient {
        let (dialer, mut listener) = crate::transport::memory::listener();
        let connection = dialer.dial().expect("listener is alive");
        let config = self.config.clone();
        tokio::spawn(async move {
            let _ = self.start_with_adapter(&mut listener).await;
        });
        crate::RpcClient::with_connection(Box::new(connection), config)
    }
}
