//! Transcoder contract: entities in, requests out, responses back.

use crate::entity::Entity;
use std::collections::HashSet;

/// How the transport classified the outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    /// The remote store accepted the request.
    Success,
    /// The remote store authoritatively rejected the request.
    PermanentFailure,
    /// Network error or retryable server status.
    TransientFailure,
    /// The request expired before a response arrived.
    Expired,
}

impl ResponseStatus {
    /// Returns true for [`ResponseStatus::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, ResponseStatus::Success)
    }

    /// Returns true if the batch may be sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResponseStatus::TransientFailure | ResponseStatus::Expired
        )
    }
}

/// A transport response that can report its outcome category.
pub trait TransportResponse {
    /// Returns the outcome category.
    fn status(&self) -> ResponseStatus;
}

impl TransportResponse for ResponseStatus {
    fn status(&self) -> ResponseStatus {
        *self
    }
}

/// Per-entity-type policy for building requests and interpreting responses.
///
/// Transcoders with a `fetch_limit` above 1 are expected to override the
/// batch-shaped methods; the defaults only look at one entity of the batch.
/// When the limit is 1 the engine never calls the batch-shaped methods.
pub trait ObjectTranscoder<E: Entity> {
    /// Outbound request type.
    type Request;
    /// Response type delivered by the transport.
    type Response: TransportResponse;

    /// How many entities can be synchronized in one request.
    ///
    /// Values below 1 are treated as 1.
    fn fetch_limit(&self) -> usize {
        1
    }

    /// Returns false to pause scheduling without touching the working set.
    fn is_available(&self) -> bool {
        true
    }

    /// Whether an expired request is sent again.
    fn should_retry_on_expiration(&self) -> bool {
        true
    }

    /// Builds a request for a single entity.
    ///
    /// `None` means the entity cannot currently be represented as a request.
    fn request_for(&mut self, object: &E) -> Option<Self::Request>;

    /// Builds one request covering the whole batch.
    fn request_for_batch(&mut self, objects: &HashSet<E>) -> Option<Self::Request> {
        let object = objects.iter().next()?;
        self.request_for(object)
    }

    /// Applies the response for a single entity.
    fn handle_response(&mut self, response: &Self::Response, object: &E);

    /// Applies the response for a batch.
    fn handle_batch_response(&mut self, response: &Self::Response, objects: &HashSet<E>) {
        if let Some(object) = objects.iter().next() {
            self.handle_response(response, object);
        }
    }

    /// Consulted on a transient failure; returning false gives up on the
    /// batch instead of rescheduling it.
    fn should_try_to_resend(&self, _objects: &HashSet<E>, _response: &Self::Response) -> bool {
        true
    }
}
