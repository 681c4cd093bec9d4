//! Deferred response handling.
//!
//! With lazy send, some requests (statement and blob release, pipelined
//! blob opens) are written without waiting for their response. Each one
//! registers a [`DeferredAction`]; responses arrive in request order, so the
//! queue is drained strictly FIFO before any direct response is read.

use crate::error::Error;
use fbwire_protocol::Response;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Callback receiving the response (or failure) of one deferred request.
pub type ResponseHandler = Box<dyn FnOnce(Result<Response, Error>) + Send>;

/// A pending response handler.
pub struct DeferredAction {
    description: &'static str,
    requires_sync: bool,
    handler: ResponseHandler,
}

impl DeferredAction {
    pub fn new(
        description: &'static str,
        handler: impl FnOnce(Result<Response, Error>) + Send + 'static,
    ) -> Self {
        Self {
            description,
            requires_sync: false,
            handler: Box::new(handler),
        }
    }

    /// An action whose result is stored in the returned slot.
    pub fn with_slot(description: &'static str) -> (Self, PendingResponse) {
        let slot = PendingResponse::default();
        let target = slot.clone();
        (Self::new(description, move |result| target.fill(result)), slot)
    }

    /// Marks the request as one the server only answers after a later
    /// round trip, so draining must send a ping first.
    pub fn requiring_sync(mut self) -> Self {
        self.requires_sync = true;
        self
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    pub fn requires_sync(&self) -> bool {
        self.requires_sync
    }

    pub(crate) fn complete(self, result: Result<Response, Error>) {
        (self.handler)(result)
    }
}

impl fmt::Debug for DeferredAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredAction")
            .field("description", &self.description)
            .field("requires_sync", &self.requires_sync)
            .finish()
    }
}

/// FIFO of deferred actions owned by a connection.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    actions: VecDeque<DeferredAction>,
}

impl DeferredQueue {
    pub fn push(&mut self, action: DeferredAction) {
        self.actions.push_back(action);
    }

    pub fn pop(&mut self) -> Option<DeferredAction> {
        self.actions.pop_front()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns whether any queued request needs a ping to be answered.
    pub fn requires_sync(&self) -> bool {
        self.actions.iter().any(DeferredAction::requires_sync)
    }
}

/// Shared slot filled when a deferred response is processed.
#[derive(Clone, Default)]
pub struct PendingResponse {
    slot: Arc<Mutex<Option<Result<Response, Error>>>>,
}

impl PendingResponse {
    fn fill(&self, result: Result<Response, Error>) {
        *self.slot.lock() = Some(result);
    }

    pub fn is_complete(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Takes the result; `None` until the response was processed.
    pub fn take(&self) -> Option<Result<Response, Error>> {
        self.slot.lock().take()
    }
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fbwire_protocol::{GenericResponse, SqlResponse};

    #[test]
    fn test_queue_is_fifo() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut queue = DeferredQueue::default();
        for i in 0..3 {
            let seen = seen.clone();
            queue.push(DeferredAction::new("test", move |_| seen.lock().push(i)));
        }
        assert_eq!(queue.len(), 3);
        while let Some(action) = queue.pop() {
            action.complete(Ok(Response::Sql(SqlResponse { count: 0 })));
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requires_sync() {
        let mut queue = DeferredQueue::default();
        queue.push(DeferredAction::new("open blob", |_| {}));
        assert!(!queue.requires_sync());
        queue.push(DeferredAction::new("free statement", |_| {}).requiring_sync());
        assert!(queue.requires_sync());
    }

    #[test]
    fn test_slot() {
        let (action, slot) = DeferredAction::with_slot("open blob");
        assert!(!slot.is_complete());
        action.complete(Ok(Response::Generic(GenericResponse {
            object_handle: 7,
            ..GenericResponse::default()
        })));
        assert!(slot.is_complete());
        match slot.take() {
            Some(Ok(Response::Generic(r))) => assert_eq!(r.object_handle, 7),
            other => panic!("unexpected slot content: {:?}", other),
        }
        assert!(slot.take().is_none());
    }
}
