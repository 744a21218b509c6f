//! Caller identities and the caller registry.
//!
//! Every participant on a [`Bus`](crate::event::bus::Bus) is addressed by a
//! [`CallerID`]. Entities obtain one by registering with a [`CallerMap`],
//! which hands out fresh ids and resolves them back to the registrant later.
//!
//! The map only keeps [`Weak`] references. Registrants are owned by whoever
//! created them (a scene, a subsystem, a test), so an id whose registrant has
//! been dropped simply resolves to `None`. Such dead entries need no explicit
//! removal: they are pruned as the map grows.
//!
//! # Usage
//!
//! ```ignore
//! let map = CallerMap::new();
//! let player = map.register_with(|cid| Player::new(cid));
//! assert!(map.has_entity(player.cid()));
//!
//! // Later, from a callback that only knows the id:
//! if let Some(p) = map.get::<Player>(cid) { p.hurt(1); }
//! ```

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

/// Identifier naming a participant on the bus.
///
/// [`CallerID::GLOBAL`] (zero) is reserved for bindings that are not tied to
/// any entity. Ids handed out by a [`CallerMap`] start at one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct CallerID(pub u64);

impl CallerID {
    /// The caller used by global bindings and global triggers.
    pub const GLOBAL: CallerID = CallerID(0);

    /// Returns `true` for [`CallerID::GLOBAL`].
    pub fn is_global(self) -> bool {
        self == Self::GLOBAL
    }
}

impl fmt::Display for CallerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "caller#{}", self.0)
    }
}

/// Anything that can be bound to and targeted on a bus.
///
/// Entities store the id they were registered under and return it here.
pub trait Caller {
    fn cid(&self) -> CallerID;
}

impl Caller for CallerID {
    fn cid(&self) -> CallerID {
        *self
    }
}

impl<C: Caller + ?Sized> Caller for &C {
    fn cid(&self) -> CallerID {
        (**self).cid()
    }
}

impl<C: Caller + ?Sized> Caller for Arc<C> {
    fn cid(&self) -> CallerID {
        (**self).cid()
    }
}

/// Type-erased registrant as stored by a [`CallerMap`].
pub type Registrant = dyn Any + Send + Sync;

/// Entry count below which dead entries are left alone.
const MIN_PRUNE_AT: usize = 64;

#[derive(Default)]
struct CallerTable {
    /// Last id handed out. Ids are never reused, so a removed id stays absent.
    highest_id: u64,
    callers: FxHashMap<CallerID, Weak<Registrant>>,
    /// Size at which the next insert drops entries whose registrant is gone.
    prune_at: usize,
}

impl CallerTable {
    fn next_id(&mut self) -> CallerID {
        self.highest_id += 1;
        CallerID(self.highest_id)
    }

    fn insert(&mut self, id: CallerID, weak: Weak<Registrant>) {
        if self.callers.len() >= self.prune_at.max(MIN_PRUNE_AT) {
            self.callers.retain(|_, weak| weak.strong_count() > 0);
            self.prune_at = self.callers.len() * 2;
        }
        self.callers.insert(id, weak);
    }
}

/// Registry resolving generated [`CallerID`]s to registrants.
///
/// Safe to share between threads; all methods take `&self`.
#[derive(Default)]
pub struct CallerMap {
    table: RwLock<CallerTable>,
}

impl CallerMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `registrant` under a freshly allocated id and return it.
    pub fn register<T: Any + Send + Sync>(&self, registrant: &Arc<T>) -> CallerID {
        let weak = Arc::downgrade(registrant);
        let weak: Weak<Registrant> = weak;
        let mut table = self.table.write();
        let id = table.next_id();
        table.insert(id, weak);
        id
    }

    /// Allocate an id, build the registrant with it and register the result.
    ///
    /// This is the usual way to create an entity that has to know its own id.
    /// The returned [`Arc`] is the only strong reference.
    pub fn register_with<T, F>(&self, build: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce(CallerID) -> T,
    {
        let id = self.table.write().next_id();
        let registrant = Arc::new(build(id));
        let weak = Arc::downgrade(&registrant);
        let weak: Weak<Registrant> = weak;
        self.table.write().insert(id, weak);
        registrant
    }

    /// Look up the registrant behind `id`.
    ///
    /// Returns `None` for unknown, removed or already dropped registrants.
    pub fn get_entity(&self, id: CallerID) -> Option<Arc<Registrant>> {
        self.table.read().callers.get(&id).and_then(Weak::upgrade)
    }

    /// Look up the registrant behind `id` as a concrete type.
    pub fn get<T: Any + Send + Sync>(&self, id: CallerID) -> Option<Arc<T>> {
        self.get_entity(id)?.downcast::<T>().ok()
    }

    /// Returns `true` if `id` is registered and its registrant is still alive.
    pub fn has_entity(&self, id: CallerID) -> bool {
        self.table
            .read()
            .callers
            .get(&id)
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Forget `id`. Returns `true` if it was registered.
    pub fn remove_entity(&self, id: CallerID) -> bool {
        self.table.write().callers.remove(&id).is_some()
    }

    /// Forget every registrant. Ids already handed out stay retired.
    pub fn clear(&self) {
        self.table.write().callers.clear();
    }

    /// Number of registered ids whose registrant is still alive.
    pub fn len(&self) -> usize {
        self.table
            .read()
            .callers
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for CallerMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.read();
        f.debug_struct("CallerMap")
            .field("highest_id", &table.highest_id)
            .field("len", &table.callers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        cid: CallerID,
        hp: i32,
    }

    impl Caller for Dummy {
        fn cid(&self) -> CallerID {
            self.cid
        }
    }

    #[test]
    fn test_caller_id_identity() {
        let c = CallerID(fastrand::u64(..100_000));
        assert_eq!(c, c.cid());
    }

    #[test]
    fn test_global_is_zero() {
        assert!(CallerID::GLOBAL.is_global());
        assert!(!CallerID(7).is_global());
        assert_eq!(CallerID::default(), CallerID::GLOBAL);
    }

    #[test]
    fn test_caller_through_references() {
        let d = Arc::new(Dummy {
            cid: CallerID(3),
            hp: 1,
        });
        assert_eq!(d.cid(), CallerID(3));
        assert_eq!((&d).cid(), CallerID(3));
        assert_eq!(d.hp, 1);
    }

    #[test]
    fn test_register_allocates_distinct_ids() {
        let map = CallerMap::new();
        let a = Arc::new(1u32);
        let b = Arc::new(2u32);
        let id_a = map.register(&a);
        let id_b = map.register(&b);
        let id_a2 = map.register(&a);
        assert_ne!(id_a, id_b);
        assert_ne!(id_a, id_a2);
        assert!(!id_a.is_global());
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_register_with_knows_own_id() {
        let map = CallerMap::new();
        let d = map.register_with(|cid| Dummy { cid, hp: 10 });
        let found = map.get::<Dummy>(d.cid()).unwrap();
        assert!(Arc::ptr_eq(&d, &found));
        assert_eq!(found.hp, 10);
    }

    #[test]
    fn test_get_wrong_type_is_none() {
        let map = CallerMap::new();
        let value = Arc::new(5u8);
        let id = map.register(&value);
        assert!(map.get::<String>(id).is_none());
        assert!(map.get_entity(id).is_some());
    }

    #[test]
    fn test_dropped_registrant_is_absent() {
        let map = CallerMap::new();
        let value = Arc::new(String::from("gone soon"));
        let id = map.register(&value);
        drop(value);
        assert!(!map.has_entity(id));
        assert!(map.get_entity(id).is_none());
    }

    #[test]
    fn test_dropped_registrants_are_pruned() {
        let map = CallerMap::new();
        let kept = Arc::new(0u32);
        let kept_id = map.register(&kept);
        for n in 0..MIN_PRUNE_AT as u32 {
            let value = Arc::new(n);
            map.register(&value);
        }
        assert_eq!(map.len(), 1);

        let late = Arc::new(7u32);
        let late_id = map.register(&late);
        assert_eq!(map.len(), 2);
        // The dead entries from the loop are gone.
        assert!(map.table.read().callers.len() < MIN_PRUNE_AT);
        assert!(map.has_entity(kept_id));
        assert!(map.has_entity(late_id));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let map = CallerMap::new();
        let value = Arc::new(1i64);
        let id = map.register(&value);
        assert!(map.remove_entity(id));
        assert!(!map.remove_entity(id));
        assert!(!map.has_entity(id));
    }

    #[test]
    fn test_ids_not_reused_after_clear() {
        let map = CallerMap::new();
        let value = Arc::new(1i64);
        let first = map.register(&value);
        map.clear();
        assert!(map.is_empty());
        let second = map.register(&value);
        assert_ne!(first, second);
        assert!(map.get_entity(first).is_none());
    }
}
