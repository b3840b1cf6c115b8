//! Session-scoped arena pool
//!
//! Slots live in a `Vec<Option<Slot>>` with a free list. A [`SlotId`] carries
//! the slot's generation, so a stale id (slot discarded and reused) is a
//! no-op instead of touching someone else's connection.
//!
//! A slot discarded while other callers still hold it is poisoned: it takes
//! no new callers and leaves the pool when its last holder checks in.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::transport::Transport;
use crate::{Error, Result};

/// Pool key: one logical client session talking to one backend
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// `{user_id}:{session_id}`
    pub session: String,
    /// Backend id
    pub backend_id: String,
}

impl PoolKey {
    /// Key for a user's session and a backend
    #[must_use]
    pub fn new(user_id: &str, session_id: &str, backend_id: &str) -> Self {
        Self {
            session: format!("{user_id}:{session_id}"),
            backend_id: backend_id.to_string(),
        }
    }
}

/// Generational slot handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: usize,
    generation: u64,
}

/// Result of a non-blocking checkout
pub enum Checkout {
    /// An existing connection with spare caller capacity
    Shared {
        /// Slot
        slot: SlotId,
        /// Connection
        transport: Arc<dyn Transport>,
    },
    /// A reserved slot; the caller must connect and [`ConnectionPool::install`]
    /// or [`ConnectionPool::abandon`]
    Reserved {
        /// Slot
        slot: SlotId,
    },
}

/// Pool limits
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    /// Slots per session
    pub max_per_session: usize,
    /// Slots per backend across sessions
    pub max_per_backend: usize,
    /// Concurrent callers per connection
    pub max_callers_per_connection: usize,
}

/// Pool occupancy snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Occupied slots (connecting or ready)
    pub slots: usize,
    /// Slots still connecting
    pub connecting: usize,
    /// Ready slots with no callers
    pub idle: usize,
    /// Callers currently holding a connection
    pub active_callers: usize,
}

/// Connection pool contract
///
/// All methods are synchronous: implementations hold their lock only for
/// bookkeeping, and callers close returned transports after the call.
pub trait ConnectionPool: Send + Sync {
    /// Share an existing connection or reserve a slot. Never blocks: a full
    /// pool is `CapacityExceeded`.
    fn try_checkout(&self, key: &PoolKey) -> Result<Checkout>;

    /// Fill a reserved slot; the reserving caller holds it.
    fn install(&self, slot: SlotId, transport: Arc<dyn Transport>);

    /// Release a reserved slot whose connect failed
    fn abandon(&self, slot: SlotId);

    /// A caller is done with the slot's connection. Returns the connection
    /// for closing when this was the last holder of a poisoned slot.
    fn check_in(&self, slot: SlotId) -> Option<Arc<dyn Transport>>;

    /// The caller's connection failed. Removes the slot and returns its
    /// connection for closing, or poisons it while other callers hold it.
    fn discard(&self, slot: SlotId) -> Option<Arc<dyn Transport>>;

    /// Remove idle (or disconnected) slots with no callers
    fn take_idle(&self, idle_for: Duration) -> Vec<Arc<dyn Transport>>;

    /// Remove every slot
    fn drain(&self) -> Vec<Arc<dyn Transport>>;

    /// Occupancy snapshot
    fn stats(&self) -> PoolStats;
}

enum SlotState {
    Connecting,
    Ready(Arc<dyn Transport>),
}

struct Slot {
    key: PoolKey,
    generation: u64,
    state: SlotState,
    callers: usize,
    poisoned: bool,
    last_used: Instant,
}

impl Slot {
    fn into_transport(self) -> Option<Arc<dyn Transport>> {
        match self.state {
            SlotState::Ready(transport) => Some(transport),
            SlotState::Connecting => None,
        }
    }
}

#[derive(Default)]
struct Arena {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    next_generation: u64,
}

impl Arena {
    fn get_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index)
            .and_then(Option::as_mut)
            .filter(|s| s.generation == id.generation)
    }

    fn remove(&mut self, id: SlotId) -> Option<Slot> {
        let entry = self.slots.get_mut(id.index)?;
        if entry.as_ref().is_some_and(|s| s.generation == id.generation) {
            self.free.push(id.index);
            entry.take()
        } else {
            None
        }
    }

    fn allocate(&mut self, key: PoolKey) -> SlotId {
        self.next_generation += 1;
        let generation = self.next_generation;
        let slot = Slot {
            key,
            generation,
            state: SlotState::Connecting,
            callers: 1,
            poisoned: false,
            last_used: Instant::now(),
        };
        let index = if let Some(index) = self.free.pop() {
            self.slots[index] = Some(slot);
            index
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        };
        SlotId { index, generation }
    }

    fn occupied(&self) -> impl Iterator<Item = (usize, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    fn remove_where(&mut self, pred: impl Fn(&Slot) -> bool) -> Vec<Arc<dyn Transport>> {
        let ids: Vec<SlotId> = self
            .occupied()
            .filter(|(_, s)| pred(s))
            .map(|(index, s)| SlotId {
                index,
                generation: s.generation,
            })
            .collect();
        ids.into_iter()
            .filter_map(|id| self.remove(id))
            .filter_map(Slot::into_transport)
            .collect()
    }
}

/// Default [`ConnectionPool`]
pub struct ArenaPool {
    arena: Mutex<Arena>,
    limits: PoolLimits,
}

impl ArenaPool {
    /// Empty pool with the given limits
    #[must_use]
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            arena: Mutex::new(Arena::default()),
            limits,
        }
    }
}

impl ConnectionPool for ArenaPool {
    fn try_checkout(&self, key: &PoolKey) -> Result<Checkout> {
        let mut arena = self.arena.lock();
        let max_callers = self.limits.max_callers_per_connection;

        let shared = arena.slots.iter_mut().enumerate().find_map(|(index, slot)| {
            let slot = slot.as_mut()?;
            let SlotState::Ready(transport) = &slot.state else {
                return None;
            };
            if slot.key != *key
                || slot.poisoned
                || slot.callers >= max_callers
                || !transport.is_connected()
            {
                return None;
            }
            let transport = Arc::clone(transport);
            slot.callers += 1;
            slot.last_used = Instant::now();
            Some(Checkout::Shared {
                slot: SlotId {
                    index,
                    generation: slot.generation,
                },
                transport,
            })
        });
        if let Some(checkout) = shared {
            return Ok(checkout);
        }

        let (per_session, per_backend) =
            arena
                .occupied()
                .fold((0, 0), |(session, backend), (_, slot)| {
                    (
                        session + usize::from(slot.key.session == key.session),
                        backend + usize::from(slot.key.backend_id == key.backend_id),
                    )
                });
        if per_session >= self.limits.max_per_session {
            return Err(Error::CapacityExceeded(format!(
                "session connection limit ({}) reached",
                self.limits.max_per_session
            )));
        }
        if per_backend >= self.limits.max_per_backend {
            return Err(Error::CapacityExceeded(format!(
                "connection limit ({}) reached for backend {}",
                self.limits.max_per_backend, key.backend_id
            )));
        }

        Ok(Checkout::Reserved {
            slot: arena.allocate(key.clone()),
        })
    }

    fn install(&self, slot: SlotId, transport: Arc<dyn Transport>) {
        if let Some(s) = self.arena.lock().get_mut(slot) {
            s.state = SlotState::Ready(transport);
            s.last_used = Instant::now();
        }
    }

    fn abandon(&self, slot: SlotId) {
        let mut arena = self.arena.lock();
        if arena
            .get_mut(slot)
            .is_some_and(|s| matches!(s.state, SlotState::Connecting))
        {
            arena.remove(slot);
        }
    }

    fn check_in(&self, slot: SlotId) -> Option<Arc<dyn Transport>> {
        let mut arena = self.arena.lock();
        let s = arena.get_mut(slot)?;
        s.callers = s.callers.saturating_sub(1);
        s.last_used = Instant::now();
        if s.poisoned && s.callers == 0 {
            return arena.remove(slot).and_then(Slot::into_transport);
        }
        None
    }

    fn discard(&self, slot: SlotId) -> Option<Arc<dyn Transport>> {
        let mut arena = self.arena.lock();
        let s = arena.get_mut(slot)?;
        if s.callers > 1 {
            s.callers -= 1;
            s.poisoned = true;
            return None;
        }
        arena.remove(slot).and_then(Slot::into_transport)
    }

    fn take_idle(&self, idle_for: Duration) -> Vec<Arc<dyn Transport>> {
        let now = Instant::now();
        self.arena.lock().remove_where(|slot| match &slot.state {
            SlotState::Ready(t) => {
                slot.callers == 0
                    && (!t.is_connected() || now.duration_since(slot.last_used) >= idle_for)
            }
            SlotState::Connecting => false,
        })
    }

    fn drain(&self) -> Vec<Arc<dyn Transport>> {
        self.arena.lock().remove_where(|_| true)
    }

    fn stats(&self) -> PoolStats {
        let arena = self.arena.lock();
        arena
            .occupied()
            .fold(PoolStats::default(), |mut stats, (_, slot)| {
                stats.slots += 1;
                stats.active_callers += slot.callers;
                match slot.state {
                    SlotState::Connecting => stats.connecting += 1,
                    SlotState::Ready(_) if slot.callers == 0 => stats.idle += 1,
                    SlotState::Ready(_) => {}
                }
                stats
            })
    }
}
