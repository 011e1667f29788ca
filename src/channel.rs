//! One direction of a call: an ordered message queue with an explicit end-of-stream.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::Stream;
use tokio::sync::mpsc;

use crate::{context::CallContext, RpcError};

/// Creates both ends of one call direction bound to `context`.
///
/// Sends and receives stop as soon as the call is canceled or expires.
pub fn channel<T>(context: &CallContext, buffer: usize) -> (MessageSender<T>, MessageReceiver<T>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let closed = Arc::new(AtomicBool::new(false));
    (
        MessageSender {
            tx: Some(tx),
            closed: closed.clone(),
            context: context.clone(),
        },
        MessageReceiver {
            rx,
            closed,
            context: context.clone(),
            finished: false,
        },
    )
}

#[derive(Debug)]
pub struct MessageSender<T> {
    tx: Option<mpsc::Sender<T>>,
    closed: Arc<AtomicBool>,
    context: CallContext,
}

impl<T> MessageSender<T> {
    /// Queues `message`, waiting for buffer space.
    ///
    /// Fails with [`RpcError::StreamClosed`] once this direction was closed or the
    /// other end went away, and with the call's failure once it was canceled or expired.
    pub async fn send(&mut self, message: T) -> Result<(), RpcError> {
        self.context.check()?;
        let tx = self.tx.as_ref().ok_or(RpcError::StreamClosed)?;

        let result = tokio::select! {
            sent = tx.send(message) => sent.map_err(|_| RpcError::StreamClosed),
            err = self.context.failed() => Err(err),
        };

        if matches!(result, Err(RpcError::StreamClosed)) {
            self.tx = None;
        }
        result
    }

    /// Signals end-of-stream. Closing twice is a no-op.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }
}

#[derive(Debug)]
pub struct MessageReceiver<T> {
    rx: mpsc::Receiver<T>,
    closed: Arc<AtomicBool>,
    context: CallContext,
    finished: bool,
}

impl<T> MessageReceiver<T> {
    /// Next message in send order, `Ok(None)` at end-of-stream.
    ///
    /// End-of-stream is sticky: every later call returns `Ok(None)` again. A
    /// canceled or expired call yields its error once, then end-of-stream.
    pub async fn receive(&mut self) -> Result<Option<T>, RpcError> {
        if self.finished {
            return Ok(None);
        }
        if let Some(err) = self.context.failure() {
            self.finish();
            return Err(err);
        }

        let next = tokio::select! {
            biased;
            message = self.rx.recv() => Ok(message),
            err = self.context.failed() => Err(err),
        };

        match next {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => {
                self.finish();
                match self.context.failure() {
                    Some(err) => Err(err),
                    None => Ok(None),
                }
            }
            Err(err) => {
                self.finish();
                Err(err)
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the sender ended this direction with [`MessageSender::close`].
    ///
    /// After end-of-stream, `false` means the sender was dropped mid-stream.
    pub(crate) fn closed_by_sender(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    /// Adapts the receiver into a [`Stream`] that ends after end-of-stream or the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, RpcError>>
    where
        T: Send + 'static,
    {
        async_stream::stream! {
            let mut receiver = self;
            loop {
                match receiver.receive().await {
                    Ok(Some(message)) => yield Ok(message),
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.rx.close();
    }
}
