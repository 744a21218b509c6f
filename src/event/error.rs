//! Errors reported by the event layer.

use thiserror::Error;

use crate::event::binding::{BindID, UnsafeEventID};
use crate::event::caller::CallerID;

/// Raised by a typed callback when the payload it received is not the type it
/// was bound with. Only reachable through the untyped trigger path or an
/// [`EventID`](crate::event::typed::EventID) built with the wrong payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadMismatch {
    /// Name of the payload type the callback was bound with.
    pub expected: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("{bind_id} on {event} for {caller} expected a `{expected}` payload")]
    PayloadMismatch {
        event: UnsafeEventID,
        caller: CallerID,
        bind_id: BindID,
        expected: &'static str,
    },
}
