//! Typed event kinds and the typed bind/trigger API.
//!
//! An [`EventID<T>`] is an [`UnsafeEventID`] tagged with its payload type `T`.
//! Binding and triggering through it is checked at compile time: a callback
//! bound to an `EventID<T>` always receives a `&T`.
//!
//! Declare engine-wide events once and share the id:
//!
//! ```ignore
//! static DAMAGE: LazyLock<EventID<Damage>> = LazyLock::new(register_event);
//!
//! bus.bind(*DAMAGE, player.cid(), |_, d: &Damage| {
//!     println!("took {}", d.amount);
//!     Response::NONE
//! });
//! bus.trigger(*DAMAGE, player.cid(), &Damage { amount: 3 });
//! ```

use log::{debug, warn};
use std::any::{Any, type_name};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::event::binding::{Binding, UnsafeEventID};
use crate::event::bus::{Bindable, Bus};
use crate::event::caller::{Caller, CallerID};
use crate::event::error::{EventError, PayloadMismatch};
use crate::event::response::Response;

/// Event ids below this value are reserved for events built into the crate.
pub const FIRST_USER_EVENT: u64 = 16;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(FIRST_USER_EVENT);

/// Identifier of an event kind whose payload is a `T`.
pub struct EventID<T> {
    id: UnsafeEventID,
    _payload: PhantomData<fn(&T)>,
}

impl<T> EventID<T> {
    /// Wrap a raw id. Nothing checks that `T` matches what other code uses
    /// with the same id; prefer [`register_event`].
    pub const fn from_raw(id: UnsafeEventID) -> Self {
        Self {
            id,
            _payload: PhantomData,
        }
    }

    pub const fn id(self) -> UnsafeEventID {
        self.id
    }
}

impl<T> Clone for EventID<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for EventID<T> {}

impl<T> PartialEq for EventID<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for EventID<T> {}

impl<T> fmt::Debug for EventID<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventID<{}>({})", type_name::<T>(), self.id.0)
    }
}

/// Mint a new event kind carrying payloads of type `T`.
pub fn register_event<T: Any>() -> EventID<T> {
    let id = UnsafeEventID(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed));
    debug!("registered {} for `{}`", id, type_name::<T>());
    EventID::from_raw(id)
}

/// Wrap a typed callback so it can be stored on the bus.
fn narrow<T, F>(f: F) -> Bindable
where
    T: Any,
    F: Fn(CallerID, &T) -> Response + Send + Sync + 'static,
{
    Arc::new(
        move |caller_id: CallerID, payload: &dyn Any| match payload.downcast_ref::<T>() {
            Some(payload) => Ok(f(caller_id, payload)),
            None => Err(PayloadMismatch {
                expected: type_name::<T>(),
            }),
        },
    )
}

impl Bus {
    /// Bind `f` to run whenever `event` is triggered for `caller`.
    pub fn bind<T, F>(&self, event: EventID<T>, caller: impl Caller, f: F) -> Binding
    where
        T: Any,
        F: Fn(CallerID, &T) -> Response + Send + Sync + 'static,
    {
        self.bind_bindable(event.id(), caller.cid(), narrow(f), false)
    }

    /// Like [`bind`](Self::bind), and re-bound after every
    /// [`reset`](Self::reset).
    pub fn persistent_bind<T, F>(&self, event: EventID<T>, caller: impl Caller, f: F) -> Binding
    where
        T: Any,
        F: Fn(CallerID, &T) -> Response + Send + Sync + 'static,
    {
        self.bind_bindable(event.id(), caller.cid(), narrow(f), true)
    }

    /// Bind `f` to global triggers of `event`.
    pub fn global_bind<T, F>(&self, event: EventID<T>, f: F) -> Binding
    where
        T: Any,
        F: Fn(&T) -> Response + Send + Sync + 'static,
    {
        self.bind(event, CallerID::GLOBAL, move |_, payload: &T| f(payload))
    }

    /// Bind `f` to `event` for `entity`, handing the callback the entity itself.
    ///
    /// The entity is looked up in [`Bus::caller_map`] on every dispatch and is
    /// never kept alive by the binding. Once it has been removed from the map
    /// or dropped, the binding unbinds itself.
    pub fn bind_entity<C, T, F>(&self, event: EventID<T>, entity: &Arc<C>, f: F) -> Binding
    where
        C: Caller + Any + Send + Sync,
        T: Any,
        F: Fn(&C, &T) -> Response + Send + Sync + 'static,
    {
        let map = Arc::clone(self.caller_map());
        let cid = entity.cid();
        if !map.has_entity(cid) {
            warn!(
                "binding {} to {} which is not registered in this bus' caller map",
                event.id(),
                cid
            );
        }
        self.bind(event, cid, move |cid, payload: &T| match map.get::<C>(cid) {
            Some(entity) => f(&entity, payload),
            None => {
                debug!("{} is gone, dropping its binding", cid);
                Response::UNBIND_THIS_BINDING
            }
        })
    }

    /// Trigger `event` for `caller` with `payload`.
    pub fn trigger<T: Any>(&self, event: EventID<T>, caller: impl Caller, payload: &T) -> Response {
        self.trigger_erased(event.id(), caller.cid(), payload)
    }

    /// Trigger `event` for the global caller.
    pub fn trigger_global<T: Any>(&self, event: EventID<T>, payload: &T) -> Response {
        self.trigger_erased(event.id(), CallerID::GLOBAL, payload)
    }

    /// Trigger `event` for every caller bound to it.
    pub fn broadcast<T: Any>(&self, event: EventID<T>, payload: &T) -> Response {
        self.broadcast_erased(event.id(), payload)
    }

    /// Trigger `event` for `caller`, reporting payload mismatches as errors.
    pub fn try_trigger<T: Any>(
        &self,
        event: EventID<T>,
        caller: impl Caller,
        payload: &T,
    ) -> Result<Response, EventError> {
        self.try_trigger_erased(event.id(), caller.cid(), payload)
    }
}
