//! The event bus: registration tables, the mutation worker and trigger.
//!
//! A [`Bus`] keeps, per `(event, caller)` pair, an ordered list of bound
//! callbacks. Two kinds of operations act on it:
//!
//! - **Mutations** ([`Bus::bind_erased`], [`Bus::unbind`], [`Bus::reset`],
//!   [`Bus::clear_persistent_bindings`], ...) never run on the caller's thread.
//!   They are turned into [`Command`]s and sent over a `crossbeam_channel` to a
//!   dedicated worker thread, which applies them one by one under the write
//!   lock. The call returns immediately.
//! - **Triggers** ([`Bus::trigger_erased`] and the typed variants) run on the
//!   caller's thread under the read lock and invoke every bound callback in
//!   registration order.
//!
//! Because mutations are queued, a callback running inside a trigger may bind,
//! unbind or reset freely: the worker simply waits for the read lock to be
//! released. The price is that a bind issued mid-trigger is not visible to
//! that same pass. Use [`Bus::flush`] outside of callbacks to wait until
//! everything queued so far has been applied.
//!
//! Bus handles are cheap to clone. The worker stops once the last handle is
//! dropped. Callbacks that need the bus should capture a [`WeakBus`]; a strong
//! handle stored inside a callback keeps the bus alive forever.

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use smallvec::SmallVec;
use std::any::Any;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crate::config::BusConfig;
use crate::event::binding::{BindID, Binding, UnsafeEventID};
use crate::event::caller::{CallerID, CallerMap};
use crate::event::error::{EventError, PayloadMismatch};
use crate::event::response::Response;

/// Stored, type-erased callback.
///
/// Typed callbacks are wrapped into one of these by
/// [`Bus::bind`](crate::event::bus::Bus::bind); the `Err` case is how the
/// wrapper reports a payload of the wrong type.
pub type Bindable =
    Arc<dyn Fn(CallerID, &dyn Any) -> Result<Response, PayloadMismatch> + Send + Sync>;

/// Adapt a closure that ignores caller and payload into an untyped callback.
pub fn empty_binding<F>(f: F) -> impl Fn(CallerID, &dyn Any) -> Response + Send + Sync + 'static
where
    F: Fn() + Send + Sync + 'static,
{
    move |_: CallerID, _: &dyn Any| {
        f();
        Response::NONE
    }
}

/// Mutations queued for the worker thread.
pub(crate) enum Command {
    Bind {
        event_id: UnsafeEventID,
        caller_id: CallerID,
        bind_id: BindID,
        bindable: Bindable,
        persistent: bool,
    },
    Unbind {
        event_id: UnsafeEventID,
        caller_id: CallerID,
        bind_id: BindID,
    },
    /// Drop the whole list of one caller for one event.
    UnbindCaller {
        event_id: UnsafeEventID,
        caller_id: CallerID,
    },
    /// Drop every list of one caller, across all events.
    UnbindAllFrom { caller_id: CallerID },
    Reset,
    ClearPersistent,
    /// Acknowledge once everything queued before it has been applied.
    Flush(Sender<()>),
    Shutdown,
}

/// Callbacks bound to one caller for one event, in dispatch order.
type BindableList = SmallVec<[(BindID, Bindable); 4]>;

struct PersistentBinding {
    event_id: UnsafeEventID,
    caller_id: CallerID,
    bindable: Bindable,
}

#[derive(Default)]
struct Tables {
    lists: FxHashMap<UnsafeEventID, FxHashMap<CallerID, BindableList>>,
    persistent: Vec<PersistentBinding>,
}

impl Tables {
    fn store(&mut self, event_id: UnsafeEventID, caller_id: CallerID, bind_id: BindID, bindable: Bindable) {
        self.lists
            .entry(event_id)
            .or_default()
            .entry(caller_id)
            .or_default()
            .push((bind_id, bindable));
    }

    fn remove(&mut self, event_id: UnsafeEventID, caller_id: CallerID, bind_id: BindID) {
        let Some(callers) = self.lists.get_mut(&event_id) else {
            return;
        };
        if let Some(list) = callers.get_mut(&caller_id) {
            // Removal keeps the relative order of the remaining entries.
            list.retain(|(id, _)| *id != bind_id);
            if list.is_empty() {
                callers.remove(&caller_id);
            }
        }
        if callers.is_empty() {
            self.lists.remove(&event_id);
        }
    }

    fn remove_caller(&mut self, event_id: UnsafeEventID, caller_id: CallerID) {
        if let Some(callers) = self.lists.get_mut(&event_id) {
            callers.remove(&caller_id);
            if callers.is_empty() {
                self.lists.remove(&event_id);
            }
        }
    }

    fn remove_all_from(&mut self, caller_id: CallerID) {
        self.lists.retain(|_, callers| {
            callers.remove(&caller_id);
            !callers.is_empty()
        });
    }

    fn binding_count(&self) -> usize {
        self.lists
            .values()
            .flat_map(|callers| callers.values())
            .map(|list| list.len())
            .sum()
    }
}

/// State shared between bus handles and the worker thread.
struct State {
    tables: RwLock<Tables>,
    next_bind_id: AtomicU64,
}

impl State {
    fn alloc_bind_id(&self) -> BindID {
        BindID(self.next_bind_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Apply one mutation. Runs on the worker thread only.
    fn apply(&self, command: Command) {
        let mut tables = self.tables.write();
        match command {
            Command::Bind {
                event_id,
                caller_id,
                bind_id,
                bindable,
                persistent,
            } => {
                if persistent {
                    tables.persistent.push(PersistentBinding {
                        event_id,
                        caller_id,
                        bindable: Arc::clone(&bindable),
                    });
                }
                tables.store(event_id, caller_id, bind_id, bindable);
            }
            Command::Unbind {
                event_id,
                caller_id,
                bind_id,
            } => tables.remove(event_id, caller_id, bind_id),
            Command::UnbindCaller {
                event_id,
                caller_id,
            } => tables.remove_caller(event_id, caller_id),
            Command::UnbindAllFrom { caller_id } => tables.remove_all_from(caller_id),
            Command::Reset => {
                // Swap the old lists out so their callbacks are dropped after the
                // persistent ones are stored again.
                let old = std::mem::take(&mut tables.lists);
                let replay: Vec<_> = tables
                    .persistent
                    .iter()
                    .map(|p| (p.event_id, p.caller_id, Arc::clone(&p.bindable)))
                    .collect();
                let replayed = replay.len();
                for (event_id, caller_id, bindable) in replay {
                    let bind_id = self.alloc_bind_id();
                    tables.store(event_id, caller_id, bind_id, bindable);
                }
                drop(tables);
                drop(old);
                info!("[bus] reset, {} persistent binding(s) restored", replayed);
            }
            Command::ClearPersistent => {
                let cleared = tables.persistent.len();
                tables.persistent.clear();
                info!("[bus] cleared {} persistent binding(s)", cleared);
            }
            // Control commands, handled in `bus_worker`.
            Command::Flush(_) | Command::Shutdown => {}
        }
    }
}

/// Entry point of the bus worker thread.
///
/// Blocks on the command queue and applies each mutation under the write
/// lock, in the order they were queued. Exits on [`Command::Shutdown`] or when
/// every sender is gone.
fn bus_worker(state: Arc<State>, rx_cmd: Receiver<Command>) {
    debug!(
        "[bus] worker starting (id={:?})",
        thread::current().id()
    );
    for command in rx_cmd.iter() {
        match command {
            Command::Flush(done) => {
                let _ = done.send(());
            }
            Command::Shutdown => break,
            command => state.apply(command),
        }
    }
    debug!("[bus] worker exiting");
}

thread_local! {
    /// Buses with a trigger pass running on this thread, innermost last.
    static DISPATCHING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct DispatchGuard;

impl DispatchGuard {
    fn enter(bus_key: usize) -> Self {
        DISPATCHING.with(|stack| stack.borrow_mut().push(bus_key));
        DispatchGuard
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCHING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Returns `true` while the current thread is inside a trigger pass of any bus.
pub fn in_dispatch() -> bool {
    DISPATCHING.with(|stack| !stack.borrow().is_empty())
}

fn dispatching(bus_key: usize) -> bool {
    DISPATCHING.with(|stack| stack.borrow().contains(&bus_key))
}

/// Counters describing the current contents of a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BusStats {
    /// Active bindings across all events and callers.
    pub bindings: usize,
    /// Distinct `(event, caller)` lists.
    pub lists: usize,
    /// Stored persistent bindings.
    pub persistent: usize,
    /// Last bind id handed out.
    pub last_bind_id: u64,
}

struct Inner {
    state: Arc<State>,
    tx_cmd: Sender<Command>,
    worker: Option<JoinHandle<()>>,
    caller_map: Arc<CallerMap>,
    config: BusConfig,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.tx_cmd.send(Command::Shutdown);
        if let Some(handle) = self.worker.take() {
            // The last handle can be released by a callback the worker itself is
            // dropping; it exits on the Shutdown queued above.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}

/// Handle to an event bus. Clones share the same bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

/// Non-owning bus handle, for callbacks that need to reach their own bus.
#[derive(Clone, Default)]
pub struct WeakBus {
    inner: Weak<Inner>,
}

impl WeakBus {
    pub fn upgrade(&self) -> Option<Bus> {
        self.inner.upgrade().map(|inner| Bus { inner })
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    /// Create a bus with default configuration and its own [`CallerMap`].
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self::with_caller_map(Arc::new(CallerMap::new()), config)
    }

    /// Create a bus resolving entities through an existing [`CallerMap`].
    pub fn with_caller_map(caller_map: Arc<CallerMap>, config: BusConfig) -> Self {
        let (tx_cmd, rx_cmd) = unbounded::<Command>();
        let state = Arc::new(State {
            tables: RwLock::new(Tables::default()),
            next_bind_id: AtomicU64::new(0),
        });

        let worker_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name(config.worker_name.clone())
            .spawn(move || bus_worker(worker_state, rx_cmd))
            .expect("failed to spawn event bus worker thread");
        info!("[bus] started worker '{}'", config.worker_name);

        Bus {
            inner: Arc::new(Inner {
                state,
                tx_cmd,
                worker: Some(handle),
                caller_map,
                config,
            }),
        }
    }

    pub fn downgrade(&self) -> WeakBus {
        WeakBus {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The registry used to resolve entity bindings.
    pub fn caller_map(&self) -> &Arc<CallerMap> {
        &self.inner.caller_map
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Returns `true` if both handles refer to the same bus.
    pub fn same_bus(&self, other: &Bus) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Identifies this bus in the per-thread dispatch stack.
    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn send(&self, command: Command) {
        // Only fails once the worker is gone, at which point nothing is left to mutate.
        if self.inner.tx_cmd.send(command).is_err() {
            debug!("[bus] command dropped, worker has stopped");
        }
    }

    pub(crate) fn bind_bindable(
        &self,
        event_id: UnsafeEventID,
        caller_id: CallerID,
        bindable: Bindable,
        persistent: bool,
    ) -> Binding {
        let bind_id = self.inner.state.alloc_bind_id();
        self.send(Command::Bind {
            event_id,
            caller_id,
            bind_id,
            bindable,
            persistent,
        });
        Binding {
            queue: self.inner.tx_cmd.clone(),
            event_id,
            caller_id,
            bind_id,
        }
    }

    /// Bind an untyped callback to `event_id` for `caller_id`.
    ///
    /// The bind id is allocated now; the registration itself is applied by the
    /// worker and only becomes visible to triggers after that. The returned
    /// [`Binding`] can be unbound right away either way.
    pub fn bind_erased<F>(&self, event_id: UnsafeEventID, caller_id: CallerID, f: F) -> Binding
    where
        F: Fn(CallerID, &dyn Any) -> Response + Send + Sync + 'static,
    {
        self.bind_bindable(event_id, caller_id, erase(f), false)
    }

    /// Like [`bind_erased`](Self::bind_erased), and also re-bound after every
    /// [`reset`](Self::reset).
    ///
    /// Unbinding the returned handle only removes the current registration.
    /// Use [`clear_persistent_bindings`](Self::clear_persistent_bindings) to
    /// stop it from coming back.
    pub fn persistent_bind_erased<F>(
        &self,
        event_id: UnsafeEventID,
        caller_id: CallerID,
        f: F,
    ) -> Binding
    where
        F: Fn(CallerID, &dyn Any) -> Response + Send + Sync + 'static,
    {
        self.bind_bindable(event_id, caller_id, erase(f), true)
    }

    /// Remove exactly the registration named by `binding`. Deferred; a no-op if
    /// it is already gone.
    pub fn unbind(&self, binding: &Binding) {
        if !binding.belongs_to(&self.inner.tx_cmd) {
            debug!(
                "[bus] {} was handed out by another bus, forwarding unbind",
                binding.bind_id
            );
            binding.unbind();
            return;
        }
        self.send(Command::Unbind {
            event_id: binding.event_id,
            caller_id: binding.caller_id,
            bind_id: binding.bind_id,
        });
    }

    /// Remove every binding of `caller_id`, for all events. Deferred.
    pub fn unbind_all_from(&self, caller_id: CallerID) {
        self.send(Command::UnbindAllFrom { caller_id });
    }

    /// Drop every registration, then re-bind the persistent ones. Deferred.
    pub fn reset(&self) {
        self.send(Command::Reset);
    }

    /// Forget the persistent bindings. Active registrations stay until the next
    /// [`reset`](Self::reset). Deferred.
    pub fn clear_persistent_bindings(&self) {
        self.send(Command::ClearPersistent);
    }

    /// Block until every mutation queued before this call has been applied.
    ///
    /// Returns `false` without waiting when called from inside a trigger pass
    /// of this same bus on this thread (the worker would wait for this
    /// thread's read lock forever) or when the worker has stopped. Flushing
    /// another bus from a callback waits as usual.
    pub fn flush(&self) -> bool {
        if dispatching(self.key()) {
            warn!("[bus] flush called from inside a trigger, not waiting");
            return false;
        }
        let (done_tx, done_rx) = bounded(1);
        if self.inner.tx_cmd.send(Command::Flush(done_tx)).is_err() {
            return false;
        }
        done_rx.recv().is_ok()
    }

    /// Invoke every callback bound to `event_id` for `caller_id`, in
    /// registration order, and return their combined [`Response`].
    ///
    /// Unbind requests in the responses are queued after the pass. A typed
    /// callback that received the wrong payload type is skipped; depending on
    /// [`BusConfig::panic_on_payload_mismatch`] the trigger then panics or only
    /// logs it. Use [`try_trigger_erased`](Self::try_trigger_erased) to get the
    /// mismatch back as an error instead.
    pub fn trigger_erased(
        &self,
        event_id: UnsafeEventID,
        caller_id: CallerID,
        payload: &dyn Any,
    ) -> Response {
        let (response, mismatches) = self.dispatch(event_id, Some(caller_id), payload);
        if let Some(first) = mismatches.first() {
            for err in &mismatches {
                error!("[bus] {}", err);
            }
            if self.inner.config.panic_on_payload_mismatch {
                panic!("event payload type mismatch: {first}");
            }
        }
        response
    }

    /// Like [`trigger_erased`](Self::trigger_erased), but reports a payload
    /// mismatch as an error instead of panicking. The whole pass still runs.
    pub fn try_trigger_erased(
        &self,
        event_id: UnsafeEventID,
        caller_id: CallerID,
        payload: &dyn Any,
    ) -> Result<Response, EventError> {
        let (response, mismatches) = self.dispatch(event_id, Some(caller_id), payload);
        match mismatches.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }

    /// Trigger `event_id` for every caller that has bindings for it.
    ///
    /// Each caller's list runs in registration order; the order between
    /// callers is unspecified.
    pub fn broadcast_erased(&self, event_id: UnsafeEventID, payload: &dyn Any) -> Response {
        let (response, mismatches) = self.dispatch(event_id, None, payload);
        if let Some(first) = mismatches.first() {
            for err in &mismatches {
                error!("[bus] {}", err);
            }
            if self.inner.config.panic_on_payload_mismatch {
                panic!("event payload type mismatch: {first}");
            }
        }
        response
    }

    /// One trigger pass. `None` as caller means every caller bound to the event.
    fn dispatch(
        &self,
        event_id: UnsafeEventID,
        caller_id: Option<CallerID>,
        payload: &dyn Any,
    ) -> (Response, Vec<EventError>) {
        let _guard = DispatchGuard::enter(self.key());
        let mut aggregate = Response::NONE;
        let mut unbind: SmallVec<[(CallerID, BindID); 4]> = SmallVec::new();
        let mut unbind_callers: SmallVec<[CallerID; 2]> = SmallVec::new();
        let mut mismatches = Vec::new();

        {
            // Recursive read so a callback can trigger nested events even when
            // the worker is already waiting for the write lock.
            let tables = self.inner.state.tables.read_recursive();
            let Some(callers) = tables.lists.get(&event_id) else {
                return (aggregate, mismatches);
            };
            let targets: SmallVec<[(CallerID, &BindableList); 4]> = match caller_id {
                Some(cid) => callers.get(&cid).map(|list| (cid, list)).into_iter().collect(),
                None => callers.iter().map(|(cid, list)| (*cid, list)).collect(),
            };
            for (cid, list) in targets {
                let mut caller_response = Response::NONE;
                for (bind_id, bindable) in list.iter() {
                    match (**bindable)(cid, payload) {
                        Ok(response) => {
                            if response.contains(Response::UNBIND_THIS_BINDING) {
                                unbind.push((cid, *bind_id));
                            }
                            caller_response |= response;
                        }
                        Err(mismatch) => mismatches.push(EventError::PayloadMismatch {
                            event: event_id,
                            caller: cid,
                            bind_id: *bind_id,
                            expected: mismatch.expected,
                        }),
                    }
                }
                if caller_response.contains(Response::UNBIND_THIS_CALLER) {
                    unbind_callers.push(cid);
                }
                aggregate |= caller_response;
            }
        }

        for (caller_id, bind_id) in unbind {
            self.send(Command::Unbind {
                event_id,
                caller_id,
                bind_id,
            });
        }
        for caller_id in unbind_callers {
            self.send(Command::UnbindCaller {
                event_id,
                caller_id,
            });
        }
        (aggregate, mismatches)
    }

    /// Snapshot of the bus contents.
    pub fn stats(&self) -> BusStats {
        let tables = self.inner.state.tables.read_recursive();
        BusStats {
            bindings: tables.binding_count(),
            lists: tables.lists.values().map(|callers| callers.len()).sum(),
            persistent: tables.persistent.len(),
            last_bind_id: self.inner.state.next_bind_id.load(Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("worker", &self.inner.config.worker_name)
            .field("stats", &self.stats())
            .finish()
    }
}

fn erase<F>(f: F) -> Bindable
where
    F: Fn(CallerID, &dyn Any) -> Response + Send + Sync + 'static,
{
    Arc::new(move |caller_id: CallerID, payload: &dyn Any| Ok(f(caller_id, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const EVT_A: UnsafeEventID = UnsafeEventID(9001);
    const EVT_B: UnsafeEventID = UnsafeEventID(9002);

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, Arc<Mutex<Vec<&'static str>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (Arc::clone(&log), log)
    }

    #[test]
    fn test_bind_ids_increase() {
        let bus = Bus::new();
        let a = bus.bind_erased(EVT_A, CallerID(1), |_, _| Response::NONE);
        let b = bus.bind_erased(EVT_A, CallerID(1), |_, _| Response::NONE);
        let c = bus.bind_erased(EVT_B, CallerID(2), |_, _| Response::NONE);
        assert_eq!(a.bind_id, BindID(1));
        assert!(a.bind_id < b.bind_id);
        assert!(b.bind_id < c.bind_id);
    }

    #[test]
    fn test_trigger_without_bindings_is_empty() {
        let bus = Bus::new();
        assert_eq!(bus.trigger_erased(EVT_A, CallerID(1), &5u32), Response::NONE);
        assert_eq!(bus.broadcast_erased(EVT_A, &5u32), Response::NONE);
    }

    #[test]
    fn test_trigger_only_reaches_its_caller() {
        let bus = Bus::new();
        let (log, sink) = recorder();
        bus.bind_erased(EVT_A, CallerID(1), move |_, _| {
            sink.lock().unwrap().push("one");
            Response::NONE
        });
        let sink = Arc::clone(&log);
        bus.bind_erased(EVT_A, CallerID(2), move |_, _| {
            sink.lock().unwrap().push("two");
            Response::NONE
        });
        assert!(bus.flush());

        bus.trigger_erased(EVT_A, CallerID(1), &());
        assert_eq!(*log.lock().unwrap(), vec!["one"]);
        bus.trigger_erased(EVT_B, CallerID(1), &());
        assert_eq!(*log.lock().unwrap(), vec!["one"]);
    }

    #[test]
    fn test_broadcast_reaches_every_caller() {
        let bus = Bus::new();
        let (log, sink) = recorder();
        bus.bind_erased(EVT_A, CallerID(1), move |_, _| {
            sink.lock().unwrap().push("one");
            Response::NONE
        });
        let sink = Arc::clone(&log);
        bus.bind_erased(EVT_A, CallerID::GLOBAL, move |_, _| {
            sink.lock().unwrap().push("global");
            Response::NONE
        });
        bus.flush();

        bus.broadcast_erased(EVT_A, &());
        let mut seen = log.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["global", "one"]);
    }

    #[test]
    fn test_aggregate_response_is_or() {
        let bus = Bus::new();
        bus.bind_erased(EVT_A, CallerID(1), |_, _| Response::NONE);
        bus.bind_erased(EVT_A, CallerID(1), |_, _| Response::UNBIND_THIS_BINDING);
        bus.flush();
        let r = bus.trigger_erased(EVT_A, CallerID(1), &());
        assert_eq!(r, Response::UNBIND_THIS_BINDING);
    }

    #[test]
    fn test_unbind_caller_response_drops_whole_list() {
        let bus = Bus::new();
        bus.bind_erased(EVT_A, CallerID(1), |_, _| Response::UNBIND_THIS_CALLER);
        bus.bind_erased(EVT_A, CallerID(1), |_, _| Response::NONE);
        bus.bind_erased(EVT_B, CallerID(1), |_, _| Response::NONE);
        bus.flush();
        assert_eq!(bus.stats().bindings, 3);

        bus.trigger_erased(EVT_A, CallerID(1), &());
        bus.flush();
        let stats = bus.stats();
        assert_eq!(stats.bindings, 1);
        assert_eq!(stats.lists, 1);
    }

    #[test]
    fn test_unbind_all_from() {
        let bus = Bus::new();
        bus.bind_erased(EVT_A, CallerID(4), |_, _| Response::NONE);
        bus.bind_erased(EVT_B, CallerID(4), |_, _| Response::NONE);
        bus.bind_erased(EVT_B, CallerID(5), |_, _| Response::NONE);
        bus.unbind_all_from(CallerID(4));
        bus.flush();
        assert_eq!(bus.stats().bindings, 1);
    }

    #[test]
    fn test_unbind_twice_is_noop() {
        let bus = Bus::new();
        let b = bus.bind_erased(EVT_A, CallerID(1), |_, _| Response::NONE);
        let keep = bus.bind_erased(EVT_A, CallerID(1), |_, _| Response::NONE);
        bus.unbind(&b);
        b.unbind();
        bus.flush();
        assert_eq!(bus.stats().bindings, 1);
        keep.unbind();
        bus.flush();
        assert_eq!(bus.stats().bindings, 0);
        assert_eq!(bus.stats().lists, 0);
    }

    #[test]
    fn test_unbind_before_bind_applied() {
        let bus = Bus::new();
        let b = bus.bind_erased(EVT_A, CallerID(1), |_, _| Response::NONE);
        b.unbind();
        bus.flush();
        assert_eq!(bus.stats().bindings, 0);
    }

    #[test]
    fn test_unbind_forwards_foreign_binding() {
        let first = Bus::new();
        let second = Bus::new();
        let b = first.bind_erased(EVT_A, CallerID(1), |_, _| Response::NONE);
        let other = second.bind_erased(EVT_A, CallerID(1), |_, _| Response::NONE);
        assert_eq!(b.bind_id, other.bind_id);
        second.unbind(&b);
        first.flush();
        second.flush();
        assert_eq!(first.stats().bindings, 0);
        assert_eq!(second.stats().bindings, 1);
    }

    #[test]
    fn test_flush_inside_trigger_returns_false() {
        let bus = Bus::new();
        let weak = bus.downgrade();
        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        bus.bind_erased(EVT_A, CallerID(1), move |_, _| {
            if let Some(bus) = weak.upgrade() {
                *sink.lock().unwrap() = Some(bus.flush());
            }
            Response::NONE
        });
        bus.flush();
        bus.trigger_erased(EVT_A, CallerID(1), &());
        assert_eq!(*result.lock().unwrap(), Some(false));
        assert!(!in_dispatch());
    }

    #[test]
    fn test_flush_other_bus_inside_trigger_waits() {
        let outer = Bus::new();
        let other = Bus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        other.bind_erased(EVT_B, CallerID(2), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Response::NONE
        });

        let target = other.clone();
        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        outer.bind_erased(EVT_A, CallerID(1), move |_, _| {
            // The bind above is only visible once flushed.
            let flushed = target.flush();
            target.trigger_erased(EVT_B, CallerID(2), &());
            *sink.lock().unwrap() = Some(flushed);
            Response::NONE
        });
        outer.flush();
        outer.trigger_erased(EVT_A, CallerID(1), &());

        assert_eq!(*result.lock().unwrap(), Some(true));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!in_dispatch());
    }

    #[test]
    fn test_empty_binding_ignores_payload() {
        let bus = Bus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        bus.bind_erased(
            EVT_A,
            CallerID(1),
            empty_binding(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.flush();
        bus.trigger_erased(EVT_A, CallerID(1), &"anything");
        bus.trigger_erased(EVT_A, CallerID(1), &42u8);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clear_persistent_keeps_active() {
        let bus = Bus::new();
        bus.persistent_bind_erased(EVT_A, CallerID(1), |_, _| Response::NONE);
        bus.clear_persistent_bindings();
        bus.flush();
        let stats = bus.stats();
        assert_eq!(stats.persistent, 0);
        assert_eq!(stats.bindings, 1);
        bus.reset();
        bus.flush();
        assert_eq!(bus.stats().bindings, 0);
    }

    #[test]
    fn test_same_bus() {
        let bus = Bus::new();
        let clone = bus.clone();
        assert!(bus.same_bus(&clone));
        assert!(!bus.same_bus(&Bus::new()));
        assert!(bus.downgrade().upgrade().is_some());
    }

    #[test]
    fn test_weak_bus_dies_with_last_handle() {
        let bus = Bus::new();
        let weak = bus.downgrade();
        drop(bus);
        assert!(weak.upgrade().is_none());
    }
}
