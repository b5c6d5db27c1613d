//! Transport layer abstraction for sync operations.

use crate::engine::Batch;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::mpsc::Sender;
use std::time::Duration;

/// A transport delivers one request to the remote store and resolves to
/// exactly one response.
///
/// Network errors are not a separate channel: implementations map them to a
/// response whose status is [`ResponseStatus::TransientFailure`].
///
/// [`ResponseStatus::TransientFailure`]: crate::ResponseStatus::TransientFailure
pub trait Transport<Req, Resp>: Send + Sync + 'static {
    /// Sends a request.
    fn send(&self, request: Req) -> impl Future<Output = Resp> + Send;
}

/// Posts responses back to an engine from any thread.
pub struct CompletionSender<E, R> {
    sender: Sender<(Batch<E>, R)>,
}

impl<E, R> CompletionSender<E, R> {
    pub(crate) fn new(sender: Sender<(Batch<E>, R)>) -> Self {
        Self { sender }
    }

    /// Queues `response` for `batch`.
    ///
    /// Fails if the engine has been dropped.
    pub fn send(&self, batch: Batch<E>, response: R) -> SyncResult<()> {
        self.sender
            .send((batch, response))
            .map_err(|_| SyncError::transport_fatal("sync engine dropped"))
    }
}

impl<E, R> Clone for CompletionSender<E, R> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

type Responder<Req, Resp> = Box<dyn Fn(&Req) -> Resp + Send + Sync>;

/// A mock transport for testing.
///
/// Responses come from a closure; every request is recorded.
pub struct MockTransport<Req, Resp> {
    responder: Responder<Req, Resp>,
    sent: Mutex<Vec<Req>>,
    delay: Option<Duration>,
}

impl<Req, Resp> MockTransport<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    /// Creates a mock answering every request with `responder`.
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&Req) -> Resp + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            sent: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleeps for `delay` before each response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns the requests sent so far.
    pub fn sent_requests(&self) -> Vec<Req> {
        self.sent.lock().clone()
    }

    /// Returns the number of requests sent.
    pub fn request_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl<Req, Resp> Transport<Req, Resp> for MockTransport<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    fn send(&self, request: Req) -> impl Future<Output = Resp> + Send {
        let response = (self.responder)(&request);
        self.sent.lock().push(request);
        let delay = self.delay;
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            response
        }
    }
}
