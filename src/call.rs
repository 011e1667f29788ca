//! A single logical invocation and the tasks that move its frames.
//!
//! Each end of a call runs one pump per direction. The pumps only meet through
//! the shared [`CallContext`], so a stalled reader never blocks the writer.

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{
    channel::{MessageReceiver, MessageSender},
    codec::{Frame, FrameReader, FrameWriter, Pattern},
    context::CallContext,
    status::{CallStatus, Code, Status},
    RpcError,
};

/// Client handle of an open call.
///
/// Requests go out through [`Call::send`], responses come back through
/// [`Call::receive`]. For unary and server-streaming calls the request
/// direction closes itself after the first message.
#[derive(Debug)]
pub struct Call<Req, Resp> {
    id: u64,
    method: String,
    pattern: Pattern,
    requests: MessageSender<Req>,
    responses: MessageReceiver<Resp>,
    context: CallContext,
}

impl<Req, Resp> Call<Req, Resp> {
    pub(crate) fn new(
        id: u64,
        method: impl Into<String>,
        pattern: Pattern,
        requests: MessageSender<Req>,
        responses: MessageReceiver<Resp>,
        context: CallContext,
    ) -> Self {
        Self {
            id,
            method: method.into(),
            pattern,
            requests,
            responses,
            context,
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

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub async fn send(&mut self, message: Req) -> Result<(), RpcError> {
        self.requests.send(message).await?;
        if !self.pattern.streams_requests() {
            self.requests.close();
        }
        Ok(())
    }

    /// Ends the request direction. The server sees end-of-input.
    pub fn close_send(&mut self) {
        self.requests.close();
    }

    pub async fn receive(&mut self) -> Result<Option<Resp>, RpcError> {
        self.responses.receive().await
    }

    /// Abandons the call. The server is told through a `Cancel` frame.
    pub fn cancel(&self) -> bool {
        self.context.cancel()
    }

    pub fn status(&self) -> CallStatus {
        self.context.status()
    }

    /// Waits for the terminal status, normally set by the server's trailer.
    pub async fn finished(&self) -> CallStatus {
        self.context.finished().await
    }

    /// Closes the request direction and waits for the single response.
    pub async fn close_and_receive(mut self) -> Result<Resp, RpcError> {
        self.close_send();
        self.receive_single().await
    }

    /// Reads the only response of a single-response call, then waits for the trailer.
    pub(crate) async fn receive_single(&mut self) -> Result<Resp, RpcError> {
        let response = self.responses.receive().await?.ok_or_else(|| {
            RpcError::InternalError(format!("{} finished without a response", self.method))
        })?;

        match self.context.finished().await.error() {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }

    /// Separates the two directions so they can be driven from different tasks.
    ///
    /// Dropping the sender without closing it cancels the call.
    pub fn split(self) -> (MessageSender<Req>, MessageReceiver<Resp>) {
        (self.requests, self.responses)
    }

    pub fn into_responses(mut self) -> MessageReceiver<Resp> {
        self.requests.close();
        self.responses
    }
}

/// Server inbound: decodes request frames into the handler's receiver.
///
/// Keeps reading after `End` so a late `Cancel` still reaches the call.
pub(crate) async fn read_requests<Req>(
    mut reader: FrameReader,
    mut requests: MessageSender<Req>,
    context: CallContext,
) where
    Req: DeserializeOwned,
{
    let mut ended = false;

    loop {
        let frame = tokio::select! {
            frame = reader.next_frame() => frame,
            _ = context.finished() => break,
        };

        match frame {
            Ok(Some(Frame::Data(payload))) if !ended => {
                let message = match Frame::decode_data::<Req>(&payload) {
                    Ok(message) => message,
                    Err(err) => {
                        context.finish(CallStatus::Internal(format!("malformed request: {err}")));
                        break;
                    }
                };
                match requests.send(message).await {
                    // The handler stopped reading; drain the rest of the input.
                    Ok(()) | Err(RpcError::StreamClosed) => {}
                    Err(_) => break,
                }
            }
            Ok(Some(Frame::End)) => {
                ended = true;
                requests.close();
            }
            Ok(Some(Frame::Cancel(code))) => {
                debug!("client canceled the call ({})", code);
                context.finish(CallStatus::from_cancel(code));
                break;
            }
            Ok(Some(frame)) => {
                context.finish(CallStatus::Internal(format!(
                    "unexpected {} frame from client",
                    frame.kind()
                )));
                break;
            }
            Ok(None) => {
                requests.close();
                break;
            }
            Err(err) => {
                debug!("request stream failed: {}", err);
                context.finish(CallStatus::from(&err));
                break;
            }
        }
    }
}

/// Server outbound: writes handler responses, then the `Status` trailer.
pub(crate) async fn write_responses<Resp>(
    mut writer: FrameWriter,
    mut responses: MessageReceiver<Resp>,
    context: CallContext,
) where
    Resp: Serialize,
{
    while let Ok(Some(message)) = responses.receive().await {
        let frame = match Frame::data(&message) {
            Ok(frame) => frame,
            Err(err) => {
                context.finish(CallStatus::Internal(format!("unencodable response: {err}")));
                break;
            }
        };
        if let Err(err) = writer.write_frame(frame).await {
            context.finish(CallStatus::from(&err));
            break;
        }
    }

    let status = context.finished().await;
    let trailer = Status::from(&status);
    debug!("call finished with {}", trailer.code());
    if let Err(err) = writer.write_frame(Frame::Status(trailer)).await {
        debug!("failed to send status trailer: {}", err);
    }
    let _ = writer.finish().await;
}

/// Client outbound: writes requests and `End`, and tells the server when the
/// caller gave up.
///
/// A request sender dropped without [`MessageSender::close`] counts as giving up.
pub(crate) async fn write_requests<Req>(
    mut writer: FrameWriter,
    mut requests: MessageReceiver<Req>,
    context: CallContext,
) where
    Req: Serialize,
{
    loop {
        let next = tokio::select! {
            biased;
            next = requests.receive() => next,
            _ = context.finished() => break,
        };

        match next {
            Ok(Some(message)) => {
                let frame = match Frame::data(&message) {
                    Ok(frame) => frame,
                    Err(err) => {
                        context.finish(CallStatus::Internal(format!("unencodable request: {err}")));
                        break;
                    }
                };
                if let Err(err) = writer.write_frame(frame).await {
                    // The server stopped reading; its trailer decides the outcome.
                    debug!("failed to send request: {}", err);
                    break;
                }
            }
            Ok(None) if !requests.closed_by_sender() => {
                debug!("request sender dropped before closing; canceling the call");
                context.cancel();
                break;
            }
            Ok(None) => {
                if let Err(err) = writer.write_frame(Frame::End).await {
                    debug!("failed to send end of input: {}", err);
                }
                break;
            }
            Err(_) => break,
        }
    }

    let reason = match context.finished().await {
        CallStatus::Canceled => Some(Code::Canceled),
        CallStatus::DeadlineExceeded => Some(Code::DeadlineExceeded),
        _ => None,
    };
    if let Some(code) = reason {
        if let Err(err) = writer.write_frame(Frame::Cancel(code)).await {
            debug!("failed to send cancel: {}", err);
        }
    }
    let _ = writer.finish().await;
}

/// Client inbound: delivers responses and applies the server's trailer.
pub(crate) async fn read_responses<Resp>(
    mut reader: FrameReader,
    mut responses: MessageSender<Resp>,
    context: CallContext,
) where
    Resp: DeserializeOwned,
{
    loop {
        let frame = tokio::select! {
            frame = reader.next_frame() => frame,
            _ = context.failed() => break,
        };

        match frame {
            Ok(Some(Frame::Data(payload))) => {
                let message = match Frame::decode_data::<Resp>(&payload) {
                    Ok(message) => message,
                    Err(err) => {
                        context.finish(CallStatus::Internal(format!("malformed response: {err}")));
                        break;
                    }
                };
                match responses.send(message).await {
                    Ok(()) => {}
                    Err(RpcError::StreamClosed) => {
                        // Nobody reads the responses anymore.
                        context.cancel();
                        break;
                    }
                    Err(_) => break,
                }
            }
            Ok(Some(Frame::Status(status))) => {
                debug!("server finished the call with {}", status.code());
                context.finish(CallStatus::from(status));
                break;
            }
            Ok(Some(frame)) => {
                context.finish(CallStatus::Internal(format!(
                    "unexpected {} frame from server",
                    frame.kind()
                )));
                break;
            }
            Ok(None) => {
                context.finish(CallStatus::TransportError(
                    "stream finished without a status".to_string(),
                ));
                break;
            }
            Err(err) => {
                context.finish(CallStatus::from(&err));
                break;
            }
        }
    }
}
