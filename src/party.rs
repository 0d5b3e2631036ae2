//! Parties, their object stores and pointers to objects living at a party.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// The tensors held by parties are field elements.
pub type Tensor = ArrayD<u64>;

/// The name of a party, unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartyId(pub String);

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The id of an object, unique within the store of its party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct Inner {
    id: PartyId,
    next_id: AtomicU64,
    objects: Mutex<HashMap<ObjectId, Tensor>>,
}

/// A compute participant holding its own store of objects.
///
/// Cloning a party clones the handle, not the store.
#[derive(Debug, Clone)]
pub struct Party(Arc<Inner>);

impl PartialEq for Party {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Party {}

impl Party {
    /// Creates a party with an empty store.
    pub fn new(id: impl Into<String>) -> Self {
        Party(Arc::new(Inner {
            id: PartyId(id.into()),
            next_id: AtomicU64::new(0),
            objects: Mutex::new(HashMap::new()),
        }))
    }

    /// The name of the party.
    pub fn id(&self) -> &PartyId {
        &self.0.id
    }

    fn objects(&self) -> MutexGuard<'_, HashMap<ObjectId, Tensor>> {
        // a panic while holding the lock cannot leave the map half-updated
        self.0
            .objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn not_found(&self, id: ObjectId) -> Error {
        Error::ObjectNotFound {
            party: self.id().clone(),
            id,
        }
    }

    /// Allocates a fresh object id.
    pub fn fresh_id(&self) -> ObjectId {
        ObjectId(self.0.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Stores `value` under `id`, replacing any previous object.
    pub fn put(&self, id: ObjectId, value: Tensor) {
        self.objects().insert(id, value);
    }

    /// Stores `value` under a fresh id and returns a pointer to it.
    pub fn store(&self, value: Tensor) -> Pointer {
        let id = self.fresh_id();
        let shape = value.shape().to_vec();
        self.put(id, value);
        Pointer {
            owner: self.clone(),
            id,
            shape,
        }
    }

    /// Removes and returns the object.
    pub fn take(&self, id: ObjectId) -> Result<Tensor> {
        self.objects().remove(&id).ok_or_else(|| self.not_found(id))
    }

    /// Returns a copy of the object, leaving it in the store.
    pub fn peek(&self, id: ObjectId) -> Result<Tensor> {
        self.objects()
            .get(&id)
            .cloned()
            .ok_or_else(|| self.not_found(id))
    }

    /// Removes the object if present.
    pub fn remove(&self, id: ObjectId) {
        self.objects().remove(&id);
    }

    /// Whether the store holds an object with this id.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects().contains_key(&id)
    }

    /// The number of objects in the store.
    pub fn len(&self) -> usize {
        self.objects().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }
}

/// A reference to an object stored at a party. It never holds the data itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    owner: Party,
    id: ObjectId,
    shape: Vec<usize>,
}

impl Pointer {
    /// The party holding the object.
    pub fn owner(&self) -> &Party {
        &self.owner
    }

    /// The id of the object at its owner.
    pub fn id_at_location(&self) -> ObjectId {
        self.id
    }

    /// The shape of the referenced tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Reads the object without removing it.
    pub fn peek(&self) -> Result<Tensor> {
        self.owner.peek(self.id)
    }

    /// Retrieves the object, removing it from its owner. A second `get` fails.
    pub fn get(&self) -> Result<Tensor> {
        self.owner.take(self.id)
    }

    /// Removes the object from its owner.
    pub fn discard(&self) {
        self.owner.remove(self.id)
    }

    /// Moves the object to `new_owner`, invalidating this pointer.
    pub fn send(&self, new_owner: &Party) -> Result<Pointer> {
        let value = self.owner.peek(self.id)?;
        let bytes = bincode::serialize(&value)?;
        let value: Tensor = bincode::deserialize(&bytes)?;
        self.owner.remove(self.id);
        debug!(
            "Moved object {} from {} to {} ({} bytes)",
            self.id,
            self.owner.id(),
            new_owner.id(),
            bytes.len()
        );
        Ok(new_owner.store(value))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;

    #[test]
    fn take_consumes_and_peek_does_not() -> Result<()> {
        let alice = Party::new("alice");
        let ptr = alice.store(arr1(&[1u64, 2, 3]).into_dyn());
        assert_eq!(ptr.peek()?, arr1(&[1u64, 2, 3]).into_dyn());
        assert!(alice.contains(ptr.id_at_location()));
        ptr.get()?;
        assert!(matches!(ptr.get(), Err(Error::ObjectNotFound { .. })));
        assert!(alice.is_empty());
        Ok(())
    }

    #[test]
    fn send_moves_ownership() -> Result<()> {
        let alice = Party::new("alice");
        let james = Party::new("james");
        let ptr = alice.store(arr1(&[3u64, 4]).into_dyn());
        let moved = ptr.send(&james)?;
        assert!(!alice.contains(ptr.id_at_location()));
        assert!(james.contains(moved.id_at_location()));
        assert_eq!(moved.owner().id(), james.id());
        assert_eq!(moved.get()?, arr1(&[3u64, 4]).into_dyn());
        assert!(james.is_empty());
        Ok(())
    }

    #[test]
    fn ids_are_unique_per_party() {
        let bob = Party::new("bob");
        let a = bob.fresh_id();
        let b = bob.fresh_id();
        assert_ne!(a, b);
    }
}
