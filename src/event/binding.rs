//! Identifier types and the [`Binding`] handle.
//!
//! A [`Binding`] is what [`Bus::bind`](crate::event::bus::Bus::bind) and
//! friends return. It names exactly one registration and carries a handle to
//! the bus command queue, so it can cancel itself without a reference to the
//! bus. It owns nothing else; dropping it does not unbind.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::event::bus::Command;
use crate::event::caller::CallerID;

/// Untyped identifier of a declared event kind.
///
/// Typed code uses [`EventID`](crate::event::typed::EventID), which wraps one
/// of these together with the payload type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct UnsafeEventID(pub u64);

impl fmt::Display for UnsafeEventID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event#{}", self.0)
    }
}

/// Identifier of one registration on one bus.
///
/// Allocated from an atomic counter when the bind call is made, so ids are
/// unique and increase in call order. They are never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct BindID(pub u64);

impl fmt::Display for BindID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bind#{}", self.0)
    }
}

/// Handle to a single registration.
#[derive(Clone)]
pub struct Binding {
    pub(crate) queue: Sender<Command>,
    pub event_id: UnsafeEventID,
    pub caller_id: CallerID,
    pub bind_id: BindID,
}

impl Binding {
    /// Unbind this registration from the bus it came from.
    ///
    /// Deferred like [`Bus::unbind`](crate::event::bus::Bus::unbind). Calling it
    /// twice, or after the bus was reset or dropped, does nothing.
    pub fn unbind(&self) {
        let _ = self.queue.send(Command::Unbind {
            event_id: self.event_id,
            caller_id: self.caller_id,
            bind_id: self.bind_id,
        });
    }

    /// Returns `true` if this binding was handed out by the bus owning `queue`.
    pub(crate) fn belongs_to(&self, queue: &Sender<Command>) -> bool {
        self.queue.same_channel(queue)
    }
}

impl PartialEq for Binding {
    fn eq(&self, other: &Self) -> bool {
        self.bind_id == other.bind_id
            && self.event_id == other.event_id
            && self.caller_id == other.caller_id
            && self.belongs_to(&other.queue)
    }
}

impl Eq for Binding {}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("event_id", &self.event_id)
            .field("caller_id", &self.caller_id)
            .field("bind_id", &self.bind_id)
            .finish()
    }
}
