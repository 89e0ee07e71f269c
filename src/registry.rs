//! Fixed-capacity table of live connections.
//!
//! This is the only structure shared between reactor threads; every access
//! goes through one mutex.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::connection::{Connection, ConnectionId};
use crate::error::CapacityError;

struct Slot {
    generation: u32,
    entry: Option<Connection>,
}

struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

/// Arena of connection slots addressed by [`ConnectionId`].
pub struct Registry {
    capacity: usize,
    inner: Mutex<Slots>,
}

impl Registry {
    /// Registry holding at most `capacity` connections.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
                len: 0,
            }),
        }
    }

    /// Store a connection and assign its id.
    ///
    /// Refuses without blocking when every slot is taken; the rejected
    /// connection is dropped, which closes its socket.
    pub fn insert(&self, mut connection: Connection) -> Result<ConnectionId, CapacityError> {
        let mut inner = self.inner.lock();
        if inner.len >= self.capacity {
            return Err(CapacityError {
                capacity: self.capacity,
            });
        }

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (inner.slots.len() - 1) as u32
            }
        };

        let slot = &mut inner.slots[index as usize];
        let id = ConnectionId::new(index, slot.generation);
        connection.id = id;
        slot.entry = Some(connection);
        inner.len += 1;
        Ok(id)
    }

    /// Run `f` against the connection, if `id` is still live.
    pub fn with<R>(&self, id: ConnectionId, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        inner
            .slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.entry.as_mut())
            .map(f)
    }

    /// Take the connection out and free its slot.
    pub fn remove(&self, id: ConnectionId) -> Option<Connection> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())?;
        let connection = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(id.index());
        inner.len -= 1;
        Some(connection)
    }

    /// Whether `id` refers to a live connection.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.with(id, |_| ()).is_some()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    /// True when no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of live connections.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ids of every live connection.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.collect(|_| true)
    }

    /// Ids of the connections owned by reactor `shard`.
    pub fn ids_for_shard(&self, shard: usize) -> Vec<ConnectionId> {
        self.collect(|c| c.shard == shard)
    }

    /// Connections of `shard` with no traffic for longer than `timeout`.
    pub fn idle(&self, shard: usize, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.collect(|c| c.shard == shard && c.idle_for(now) > timeout)
    }

    fn collect(&self, mut keep: impl FnMut(&Connection) -> bool) -> Vec<ConnectionId> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .filter(|c| keep(c))
            .map(|c| c.id)
            .collect()
    }
}
