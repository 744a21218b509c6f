//! Publish/subscribe event core.
//!
//! Subsystems talk to each other by binding callbacks to event kinds on a
//! shared [`Bus`] and triggering those events, instead of holding references
//! to one another.
//!
//! Submodules:
//! - [`bus`] – registration tables, the mutation worker and trigger
//! - [`binding`] – identifier types and the [`Binding`] handle
//! - [`caller`] – [`CallerID`] and the [`CallerMap`] entity registry
//! - [`typed`] – [`EventID<T>`] and the typed bind/trigger API
//! - [`enter`] – the built-in per-frame [`ENTER`] event
//! - [`response`] – control flags returned by callbacks
//! - [`error`] – payload mismatch reporting
pub mod binding;
pub mod bus;
pub mod caller;
pub mod enter;
pub mod error;
pub mod response;
pub mod typed;

pub use binding::{BindID, Binding, UnsafeEventID};
pub use bus::{Bindable, Bus, BusStats, WeakBus, empty_binding};
pub use caller::{Caller, CallerID, CallerMap};
pub use enter::{ENTER, EnterLoop, EnterPayload};
pub use error::EventError;
pub use response::Response;
pub use typed::{EventID, register_event};
