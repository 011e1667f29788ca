//! RPC interaction patterns over QUIC.
//!
//! A call is one bidirectional QUIC stream carrying framed messages in both
//! directions. [`RpcServer`] dispatches calls to handlers registered per
//! [`Pattern`]; [`RpcClient`] opens them and hands back a [`Call`] whose two
//! directions progress independently. Every call carries a [`CallContext`]
//! that aborts it on deadline or cancellation.

use thiserror::Error;

pub mod call;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod greet;
pub mod server;
pub mod status;
pub mod tls;
mod transport;

pub use call::Call;
pub use channel::{channel, MessageReceiver, MessageSender};
pub use client::RpcClient;
pub use codec::{CallHeader, Frame, FrameCodec, Pattern};
pub use config::RpcConfig;
pub use context::CallContext;
pub use server::RpcServer;
pub use status::{CallStatus, Code, Status};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Call canceled")]
    Canceled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Stream closed")]
    StreamClosed,

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl RpcError {
    /// The call status code this error stands for, if it ended a call.
    pub fn status_code(&self) -> Option<Code> {
        match self {
            RpcError::Canceled => Some(Code::Canceled),
            RpcError::DeadlineExceeded => Some(Code::DeadlineExceeded),
            RpcError::InternalError(_) => Some(Code::Internal),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameReader, FrameWriter};
    use crate::transport::{QuicServerConnectionAdapter, QuicStreamAdapter};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time;

    fn test_server() -> RpcServer {
        RpcServer::new(RpcConfig::new("unused.pem", "127.0.0.1:0").with_message_buffer(8))
    }

    async fn echo_server() -> RpcClient {
        let server = test_server();
        server
            .register_unary("Echo.Unary", |request: String, _context| async move {
                Ok::<_, RpcError>(format!("echo {request}"))
            })
            .await;
        server
            .register_server_streaming(
                "Echo.Repeat",
                |count: u32, mut responses: MessageSender<u32>, _context| async move {
                    for i in 0..count {
                        responses.send(i).await?;
                    }
                    Ok::<_, RpcError>(())
                },
            )
            .await;
        server
            .register_client_streaming(
                "Echo.Join",
                |mut requests: MessageReceiver<String>, _context| async move {
                    let mut joined = String::new();
                    while let Some(part) = requests.receive().await? {
                        joined.push_str(&part);
                    }
                    Ok::<_, RpcError>(joined)
                },
            )
            .await;
        server
            .register_bidi_streaming(
                "Echo.Chat",
                |mut requests: MessageReceiver<String>,
                 mut responses: MessageSender<String>,
                 _context| async move {
                    while let Some(line) = requests.receive().await? {
                        responses.send(line.to_uppercase()).await?;
                    }
                    Ok::<_, RpcError>(())
                },
            )
            .await;
        server.serve_in_memory()
    }

    #[tokio::test]
    async fn unary_call_returns_the_single_response() {
        let client = echo_server().await;
        let response: String = client
            .unary("Echo.Unary", "ping".to_string(), CallContext::new())
            .await
            .unwrap();
        assert_eq!(response, "echo ping");
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_connection() {
        let client = echo_server().await;
        let calls = (0..10).map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .unary::<String, String>("Echo.Unary", i.to_string(), CallContext::new())
                    .await
            })
        });

        for (i, call) in calls.collect::<Vec<_>>().into_iter().enumerate() {
            assert_eq!(call.await.unwrap().unwrap(), format!("echo {i}"));
        }
    }

    #[tokio::test]
    async fn server_stream_is_ordered_and_ends_idempotently() {
        let client = echo_server().await;
        let mut responses = client
            .server_streaming::<u32, u32>("Echo.Repeat", 5, CallContext::new())
            .await
            .unwrap();

        for expected in 0..5 {
            assert_eq!(responses.receive().await.unwrap(), Some(expected));
        }
        assert_eq!(responses.receive().await.unwrap(), None);
        assert_eq!(responses.receive().await.unwrap(), None);
        assert_eq!(responses.context().status(), CallStatus::Ok);
    }

    #[tokio::test]
    async fn client_stream_answers_once_after_end_of_input() {
        let client = echo_server().await;
        let mut call = client
            .client_streaming::<String, String>("Echo.Join", CallContext::new())
            .await
            .unwrap();

        for part in ["a", "b", "c"] {
            call.send(part.to_string()).await.unwrap();
        }
        call.close_send();
        call.close_send();
        assert!(matches!(
            call.send("late".to_string()).await,
            Err(RpcError::StreamClosed)
        ));
        assert_eq!(call.close_and_receive().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn client_stream_with_no_messages_still_completes() {
        let client = echo_server().await;
        let call = client
            .client_streaming::<String, String>("Echo.Join", CallContext::new())
            .await
            .unwrap();
        assert_eq!(call.close_and_receive().await.unwrap(), "");
    }

    #[tokio::test]
    async fn unary_request_direction_closes_after_one_message() {
        let client = echo_server().await;
        let mut call = client
            .open::<String, String>("Echo.Unary", Pattern::Unary, CallContext::new())
            .await
            .unwrap();

        call.send("one".to_string()).await.unwrap();
        assert!(matches!(
            call.send("two".to_string()).await,
            Err(RpcError::StreamClosed)
        ));
        assert_eq!(call.receive().await.unwrap().as_deref(), Some("echo one"));
        assert_eq!(call.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn bidi_messages_sent_without_reading_all_arrive_in_order() {
        let client = echo_server().await;
        let call = client
            .bidi_streaming::<String, String>("Echo.Chat", CallContext::new())
            .await
            .unwrap();
        let (mut requests, mut responses) = call.split();

        let lines: Vec<String> = (0..6).map(|i| format!("line {i}")).collect();
        for line in &lines {
            requests.send(line.clone()).await.unwrap();
        }
        requests.close();

        let mut received = Vec::new();
        while let Some(line) = responses.receive().await.unwrap() {
            received.push(line);
        }
        let expected: Vec<String> = lines.iter().map(|l| l.to_uppercase()).collect();
        assert_eq!(received, expected);
        assert_eq!(responses.context().status(), CallStatus::Ok);
    }

    #[tokio::test]
    async fn bidi_directions_run_on_separate_tasks() {
        let client = echo_server().await;
        let call = client
            .bidi_streaming::<String, String>("Echo.Chat", CallContext::new())
            .await
            .unwrap();
        let (mut requests, mut responses) = call.split();

        let writer = tokio::spawn(async move {
            for name in ["rohan", "jayant", "shyam"] {
                requests.send(name.to_string()).await?;
            }
            requests.close();
            Ok::<_, RpcError>(())
        });
        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(line) = responses.receive().await? {
                seen.push(line);
            }
            Ok::<_, RpcError>(seen)
        });

        let (written, read) = tokio::join!(writer, reader);
        written.unwrap().unwrap();
        assert_eq!(read.unwrap().unwrap(), vec!["ROHAN", "JAYANT", "SHYAM"]);
    }

    #[tokio::test]
    async fn one_closed_direction_leaves_the_call_running() {
        let server = test_server();
        server
            .register_bidi_streaming(
                "Drain.Chat",
                |mut requests: MessageReceiver<String>,
                 mut responses: MessageSender<String>,
                 _context| async move {
                    responses.send("ready".to_string()).await?;
                    responses.close();
                    while requests.receive().await?.is_some() {}
                    Ok::<_, RpcError>(())
                },
            )
            .await;
        let client = server.serve_in_memory();

        let mut call = client
            .bidi_streaming::<String, String>("Drain.Chat", CallContext::new())
            .await
            .unwrap();
        assert_eq!(call.receive().await.unwrap().as_deref(), Some("ready"));
        call.send("still talking".to_string()).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(call.status(), CallStatus::Running);

        call.close_send();
        assert_eq!(call.finished().await, CallStatus::Ok);
        assert_eq!(call.receive().await.unwrap(), None);
    }

    async fn slow_server(contexts: mpsc::UnboundedSender<CallContext>) -> RpcClient {
        let server = test_server();
        server
            .register_unary("Slow.Work", move |request: String, context: CallContext| {
                let contexts = contexts.clone();
                async move {
                    let _ = contexts.send(context.clone());
                    for _ in 0..3 {
                        context.sleep(Duration::from_secs(1)).await?;
                    }
                    Ok::<_, RpcError>(request)
                }
            })
            .await;
        server.serve_in_memory()
    }

    #[tokio::test(start_paused = true)]
    async fn short_deadline_fails_both_ends_with_deadline_exceeded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = slow_server(tx).await;

        let err = client
            .unary::<String, String>(
                "Slow.Work",
                "job".to_string(),
                CallContext::with_timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::DeadlineExceeded));
        assert_eq!(err.status_code(), Some(Code::DeadlineExceeded));

        let server_context = rx.recv().await.unwrap();
        assert_eq!(server_context.finished().await, CallStatus::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn generous_deadline_lets_the_call_complete() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = slow_server(tx).await;

        let started = time::Instant::now();
        let response: String = client
            .unary(
                "Slow.Work",
                "job".to_string(),
                CallContext::with_timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(response, "job");
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn client_cancel_reaches_the_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = slow_server(tx).await;

        let mut call = client
            .open::<String, String>("Slow.Work", Pattern::Unary, CallContext::new())
            .await
            .unwrap();
        call.send("job".to_string()).await.unwrap();
        let server_context = rx.recv().await.unwrap();

        assert!(call.cancel());
        assert!(matches!(call.receive().await, Err(RpcError::Canceled)));
        assert_eq!(server_context.finished().await, CallStatus::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_context_fails_before_opening_a_stream() {
        let client = echo_server().await;
        let context = CallContext::with_timeout(Duration::from_millis(10));
        time::advance(Duration::from_millis(20)).await;

        let err = client
            .unary::<String, String>("Echo.Unary", "late".to_string(), context)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn handler_errors_surface_as_internal_status() {
        let server = test_server();
        server
            .register_unary("Broken.Call", |_request: String, _context| async move {
                Err::<String, _>(RpcError::InternalError("boom".to_string()))
            })
            .await;
        let client = server.serve_in_memory();

        let err = client
            .unary::<String, String>("Broken.Call", "x".to_string(), CallContext::new())
            .await
            .unwrap_err();
        assert!(matches!(&err, RpcError::InternalError(message) if message == "boom"));
        assert_eq!(err.status_code(), Some(Code::Internal));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_ends_the_call_with_internal_status() {
        let server = test_server();
        server
            .register_unary("Broken.Panic", |request: String, _context| async move {
                if request == "boom" {
                    panic!("handler blew up");
                }
                Ok::<_, RpcError>(request)
            })
            .await;
        let client = server.serve_in_memory();

        let err = time::timeout(
            Duration::from_secs(60),
            client.unary::<String, String>("Broken.Panic", "boom".to_string(), CallContext::new()),
        )
        .await
        .expect("call should terminate")
        .unwrap_err();
        assert!(matches!(&err, RpcError::InternalError(message) if message == "handler panicked"));
        assert_eq!(err.status_code(), Some(Code::Internal));
    }

    #[tokio::test]
    async fn dropping_an_open_client_stream_cancels_the_call() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = test_server();
        server
            .register_client_streaming(
                "Tracked.Join",
                move |mut requests: MessageReceiver<String>, context: CallContext| {
                    let contexts = tx.clone();
                    async move {
                        let _ = contexts.send(context);
                        let mut joined = String::new();
                        while let Some(part) = requests.receive().await? {
                            joined.push_str(&part);
                        }
                        Ok::<_, RpcError>(joined)
                    }
                },
            )
            .await;
        let client = server.serve_in_memory();

        let mut call = client
            .client_streaming::<String, String>("Tracked.Join", CallContext::new())
            .await
            .unwrap();
        call.send("a".to_string()).await.unwrap();
        call.send("b".to_string()).await.unwrap();
        let client_context = call.context().clone();
        drop(call);

        let server_context = rx.recv().await.unwrap();
        assert_eq!(server_context.finished().await, CallStatus::Canceled);
        assert_eq!(client_context.finished().await, CallStatus::Canceled);
    }

    #[tokio::test]
    async fn reset_stream_fails_the_call_with_transport_error() {
        let (connection, mut server_connection) = transport::memory::connection_pair();
        let client = RpcClient::with_connection(Box::new(connection), test_server().config);

        // Answers once, then drops its send half without finishing it.
        tokio::spawn(async move {
            let stream: Box<dyn QuicStreamAdapter> =
                server_connection.accept_bidirectional_stream().await?.ok_or(RpcError::StreamClosed)?;
            let (recv, send) = stream.split();
            let mut reader = FrameReader::new(recv, FrameCodec::default());
            let mut writer = FrameWriter::new(send, FrameCodec::default());
            reader.next_frame().await?;
            writer.write_frame(Frame::data(&"partial".to_string())?).await?;
            drop(writer);
            let _ = reader.next_frame().await;
            Ok::<_, RpcError>(())
        });

        let mut call = client
            .bidi_streaming::<String, String>("Flaky.Chat", CallContext::new())
            .await
            .unwrap();
        assert_eq!(call.receive().await.unwrap().as_deref(), Some("partial"));
        assert!(matches!(call.receive().await, Err(RpcError::TransportError(_))));
        assert!(matches!(call.status(), CallStatus::TransportError(_)));
        assert!(matches!(
            call.send("after reset".to_string()).await,
            Err(RpcError::TransportError(_))
        ));
    }

    #[tokio::test]
    async fn unknown_methods_are_rejected_by_name() {
        let client = echo_server().await;
        let err = client
            .unary::<String, String>("Echo.Missing", "x".to_string(), CallContext::new())
            .await
            .unwrap_err();
        assert!(matches!(&err, RpcError::InternalError(message) if message.contains("Echo.Missing")));
    }

    #[tokio::test]
    async fn pattern_mismatch_is_rejected() {
        let client = echo_server().await;
        let mut call = client
            .open::<String, String>("Echo.Chat", Pattern::Unary, CallContext::new())
            .await
            .unwrap();
        call.send("x".to_string()).await.unwrap();

        let err = call.receive().await.unwrap_err();
        assert!(matches!(&err, RpcError::InternalError(message) if message.contains("Echo.Chat")));
        assert!(matches!(call.status(), CallStatus::Internal(_)));
    }

    #[test]
    fn only_call_ending_errors_carry_a_status_code() {
        assert_eq!(RpcError::StreamClosed.status_code(), None);
        assert_eq!(RpcError::TransportError("reset".into()).status_code(), None);
        assert_eq!(RpcError::Canceled.status_code(), Some(Code::Canceled));
    }
}
