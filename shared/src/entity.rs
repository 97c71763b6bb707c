//! Sparse-set entity registry shared by the server and every client
//!
//! Each component type lives in its own densely packed storage indexed by
//! entity id, so lookups, inserts and removals are O(1) expected. Ids are
//! plain integers that travel over the wire unchanged: the server allocates
//! them with [`EntityRegistry::create`], clients only ever adopt ids they were
//! handed through [`EntityRegistry::create_with_id`].
//!
//! Destruction that happens while a tick is walking the registry goes through
//! [`EntityRegistry::queue_destroy`] and is applied by
//! [`EntityRegistry::flush_destroyed`] once iteration is over.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Identifier of an entity, identical on the server and on every client.
pub type EntityId = u32;

/// Marker for types that can be attached to an entity.
pub trait Component: Any + Send {}

impl<T: Any + Send> Component for T {}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Entity {0} is already in use")]
    IdInUse(EntityId),

    #[error("Entity {0} does not exist")]
    NotFound(EntityId),

    #[error("Entity id {0} is outside the allocatable range")]
    OutOfRange(EntityId),
}

/// Densely packed storage for one component type.
struct SparseSet<T> {
    index: HashMap<EntityId, usize>,
    ids: Vec<EntityId>,
    values: Vec<T>,
}

impl<T> SparseSet<T> {
    fn new() -> Self {
        Self {
            index: HashMap::new(),
            ids: Vec::new(),
            values: Vec::new(),
        }
    }

    fn insert(&mut self, id: EntityId, value: T) {
        if let Some(&slot) = self.index.get(&id) {
            self.values[slot] = value;
            return;
        }
        self.index.insert(id, self.values.len());
        self.ids.push(id);
        self.values.push(value);
    }

    fn get(&self, id: EntityId) -> Option<&T> {
        self.index.get(&id).map(|&slot| &self.values[slot])
    }

    fn get_mut(&mut self, id: EntityId) -> Option<&mut T> {
        self.index.get(&id).map(|&slot| &mut self.values[slot])
    }

    fn remove(&mut self, id: EntityId) -> Option<T> {
        let slot = self.index.remove(&id)?;
        self.ids.swap_remove(slot);
        let value = self.values.swap_remove(slot);
        // The last element moved into the freed slot.
        if let Some(&moved) = self.ids.get(slot) {
            self.index.insert(moved, slot);
        }
        Some(value)
    }
}

trait ErasedStorage: Send {
    fn remove_entity(&mut self, id: EntityId);
    fn contains(&self, id: EntityId) -> bool;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Component> ErasedStorage for SparseSet<T> {
    fn remove_entity(&mut self, id: EntityId) {
        self.remove(id);
    }

    fn contains(&self, id: EntityId) -> bool {
        self.index.contains_key(&id)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Store mapping entity ids to heterogeneous component records.
pub struct EntityRegistry {
    alive: HashSet<EntityId>,
    next_id: EntityId,
    storages: HashMap<TypeId, Box<dyn ErasedStorage>>,
    pending_destroy: Vec<EntityId>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self {
            alive: HashSet::new(),
            next_id: 0,
            storages: HashMap::new(),
            pending_destroy: Vec::new(),
        }
    }

    /// Allocates a fresh id.
    ///
    /// Ids are handed out monotonically and never reused, so a late message
    /// naming a destroyed entity can never be mistaken for a new one.
    pub fn create(&mut self) -> EntityId {
        while self.alive.contains(&self.next_id) {
            self.next_id += 1;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.alive.insert(id);
        id
    }

    /// Adopts an id chosen elsewhere (by the authoritative server).
    ///
    /// `EntityId::MAX` is never handed out, so the allocator always has a
    /// successor for every adopted id.
    pub fn create_with_id(&mut self, id: EntityId) -> Result<EntityId, RegistryError> {
        let successor = id.checked_add(1).ok_or(RegistryError::OutOfRange(id))?;
        if !self.alive.insert(id) {
            return Err(RegistryError::IdInUse(id));
        }
        if id >= self.next_id {
            self.next_id = successor;
        }
        Ok(id)
    }

    /// Removes the entity and all of its components.
    ///
    /// Returns false if the id was not alive; destroying twice is a no-op.
    pub fn destroy(&mut self, id: EntityId) -> bool {
        if !self.alive.remove(&id) {
            return false;
        }
        for storage in self.storages.values_mut() {
            storage.remove_entity(id);
        }
        true
    }

    /// Marks the entity for removal at the next [`flush_destroyed`](Self::flush_destroyed).
    pub fn queue_destroy(&mut self, id: EntityId) {
        if self.alive.contains(&id) && !self.pending_destroy.contains(&id) {
            self.pending_destroy.push(id);
        }
    }

    pub fn is_queued_for_destroy(&self, id: EntityId) -> bool {
        self.pending_destroy.contains(&id)
    }

    /// Destroys every queued entity, returning the ids actually removed.
    pub fn flush_destroyed(&mut self) -> Vec<EntityId> {
        let pending = std::mem::take(&mut self.pending_destroy);
        pending
            .into_iter()
            .filter(|id| self.destroy(*id))
            .collect()
    }

    pub fn valid(&self, id: EntityId) -> bool {
        self.alive.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.alive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alive.is_empty()
    }

    /// Attaches (or replaces) a component on a live entity.
    pub fn attach<T: Component>(&mut self, id: EntityId, value: T) -> Result<(), RegistryError> {
        if !self.valid(id) {
            return Err(RegistryError::NotFound(id));
        }
        self.storage_mut::<T>().insert(id, value);
        Ok(())
    }

    /// Detaches a component, returning it if present.
    pub fn detach<T: Component>(&mut self, id: EntityId) -> Option<T> {
        self.storages
            .get_mut(&TypeId::of::<T>())
            .and_then(|s| s.as_any_mut().downcast_mut::<SparseSet<T>>())
            .and_then(|s| s.remove(id))
    }

    pub fn get<T: Component>(&self, id: EntityId) -> Option<&T> {
        self.storage::<T>().and_then(|s| s.get(id))
    }

    pub fn has<T: Component>(&self, id: EntityId) -> bool {
        self.storages
            .get(&TypeId::of::<T>())
            .is_some_and(|s| s.contains(id))
    }

    /// Mutates a component in place. Returns false if the entity or component is missing.
    pub fn patch<T: Component>(&mut self, id: EntityId, mutator: impl FnOnce(&mut T)) -> bool {
        let component = self
            .storages
            .get_mut(&TypeId::of::<T>())
            .and_then(|s| s.as_any_mut().downcast_mut::<SparseSet<T>>())
            .and_then(|s| s.get_mut(id));

        match component {
            Some(value) => {
                mutator(value);
                true
            }
            None => false,
        }
    }

    /// Iterates over every entity carrying component `T`.
    pub fn iter<T: Component>(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.storage::<T>()
            .into_iter()
            .flat_map(|s| s.ids.iter().copied().zip(s.values.iter()))
    }

    /// Iterates over every entity carrying both `A` and `B`.
    pub fn iter_with<A: Component, B: Component>(
        &self,
    ) -> impl Iterator<Item = (EntityId, &A, &B)> {
        let others = self.storage::<B>();
        self.iter::<A>()
            .filter_map(move |(id, a)| others.and_then(|s| s.get(id)).map(|b| (id, a, b)))
    }

    /// Snapshot of the ids carrying component `T`.
    ///
    /// The returned list is detached from the registry, so the caller may
    /// patch or queue destruction while walking it.
    pub fn ids_with<T: Component>(&self) -> Vec<EntityId> {
        self.storage::<T>()
            .map(|s| s.ids.clone())
            .unwrap_or_default()
    }

    fn storage<T: Component>(&self) -> Option<&SparseSet<T>> {
        self.storages
            .get(&TypeId::of::<T>())
            .and_then(|s| s.as_any().downcast_ref::<SparseSet<T>>())
    }

    fn storage_mut<T: Component>(&mut self) -> &mut SparseSet<T> {
        self.storages
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(SparseSet::<T>::new()))
            .as_any_mut()
            .downcast_mut::<SparseSet<T>>()
            .expect("storage registered under its own TypeId")
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
