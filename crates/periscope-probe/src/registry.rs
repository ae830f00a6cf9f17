//! The canonical object registry.
//!
//! Entries are created when the host creates a reflectable object and are
//! never removed on destruction: a destroyed entry becomes a tombstone with
//! frozen data, still resolvable by identity but excluded from traversals.
//! A tombstone is reclaimed (its payload dropped) only after every
//! connection that observed the object has acknowledged the destruction.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use uuid::Uuid;

use periscope_core::{ModelPath, ObjectId, Value};

use crate::reflect::ObjectData;

/// Identity of one accepted client connection.
pub type ConnectionId = Uuid;

/// Registry mutation error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("object {0} is not registered")]
    UnknownObject(ObjectId),
    #[error("object {0} is already registered")]
    DuplicateObject(ObjectId),
    #[error("object {0} is dead")]
    Dead(ObjectId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryState {
    Alive,
    /// Data frozen, waiting for destruction acks from these connections.
    Tombstone { pending_acks: HashSet<ConnectionId> },
    /// All observers acked; payload dropped, identity still reserved.
    Reclaimed,
}

/// One registry entry.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub id: ObjectId,
    pub type_name: String,
    pub parent: Option<ObjectId>,
    /// Ordered identities of alive children. Tombstones are removed here on
    /// destruction, so traversals never see them.
    pub children: Vec<ObjectId>,
    pub attributes: Vec<(String, Value)>,
    /// A reflection error occurred while capturing this entry.
    pub inconsistent: bool,
    state: EntryState,
}

impl RegistryEntry {
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state == EntryState::Alive
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        !self.is_alive()
    }

    #[must_use]
    pub fn is_reclaimed(&self) -> bool {
        self.state == EntryState::Reclaimed
    }
}

/// What [`ObjectRegistry::destroy`] did to the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyOutcome {
    pub parent: Option<ObjectId>,
    /// Row the destroyed object vacated under `parent`.
    pub row: u32,
    /// Children that outlived their parent, now attached at the root.
    pub reparented: Vec<(ObjectId, u32)>,
}

/// Process-scoped registry of reflected objects.
///
/// Exclusively owned and mutated by the agent's serving task; clients only
/// ever see consistent snapshots through the message protocol.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    entries: HashMap<ObjectId, RegistryEntry>,
    roots: Vec<ObjectId>,
}

impl ObjectRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created object under `parent` (`None` for a root).
    ///
    /// A missing or dead parent does not fail the insertion: the entry is
    /// attached at the root and flagged inconsistent, so one bad hook never
    /// hides an object from observation.
    ///
    /// Returns the row index the object occupies under its parent.
    ///
    /// # Errors
    /// `DuplicateObject` if `id` was seen before. Identities are never
    /// reused, so this indicates a broken hook installation.
    pub fn insert(
        &mut self,
        id: ObjectId,
        parent: Option<ObjectId>,
        data: ObjectData,
    ) -> Result<(Option<ObjectId>, u32), RegistryError> {
        if self.entries.contains_key(&id) {
            return Err(RegistryError::DuplicateObject(id));
        }

        let mut inconsistent = data.inconsistent;
        let parent = match parent {
            Some(pid) if self.entries.get(&pid).is_some_and(RegistryEntry::is_alive) => Some(pid),
            Some(pid) => {
                tracing::warn!(object = %id, parent = %pid, "parent unknown or dead, attaching at root");
                inconsistent = true;
                None
            }
            None => None,
        };

        let row = match parent {
            Some(pid) => {
                let siblings = &mut self
                    .entries
                    .get_mut(&pid)
                    .expect("parent checked above")
                    .children;
                siblings.push(id);
                (siblings.len() - 1) as u32
            }
            None => {
                self.roots.push(id);
                (self.roots.len() - 1) as u32
            }
        };

        self.entries.insert(
            id,
            RegistryEntry {
                id,
                type_name: data.type_name,
                parent,
                children: Vec::new(),
                attributes: data.attributes,
                inconsistent,
                state: EntryState::Alive,
            },
        );
        Ok((parent, row))
    }

    /// Tombstone a destroyed object.
    ///
    /// The entry's data freezes, it leaves its parent's child list (so new
    /// traversals skip it), and it stays resolvable by identity until every
    /// connection in `observers` has acknowledged the destruction. Children
    /// that are still alive are reparented nowhere; the host destroys
    /// subtrees bottom-up, so this only matters for broken hook orderings
    /// and is flagged inconsistent on the children.
    ///
    /// Returns the parent identity, the row the object vacated, and any
    /// reparented children with their new root rows (so callers can emit
    /// the corresponding structural notifications).
    ///
    /// # Errors
    /// `UnknownObject` / `Dead` for bad identities.
    pub fn destroy(
        &mut self,
        id: ObjectId,
        observers: HashSet<ConnectionId>,
    ) -> Result<DestroyOutcome, RegistryError> {
        let entry = self
            .entries
            .get(&id)
            .ok_or(RegistryError::UnknownObject(id))?;
        if entry.is_dead() {
            return Err(RegistryError::Dead(id));
        }
        let parent = entry.parent;
        let orphans = entry.children.clone();

        let row = self
            .detach(id, parent)
            .ok_or(RegistryError::UnknownObject(id))?;

        let mut reparented = Vec::new();
        for child in orphans {
            if let Some(c) = self.entries.get_mut(&child) {
                tracing::warn!(object = %child, destroyed_parent = %id, "child outlived its parent");
                c.parent = None;
                c.inconsistent = true;
                self.roots.push(child);
                reparented.push((child, (self.roots.len() - 1) as u32));
            }
        }

        let entry = self.entries.get_mut(&id).expect("entry checked above");
        entry.children.clear();
        entry.state = EntryState::Tombstone {
            pending_acks: observers,
        };
        Ok(DestroyOutcome {
            parent,
            row,
            reparented,
        })
    }

    fn detach(&mut self, id: ObjectId, parent: Option<ObjectId>) -> Option<u32> {
        let siblings = match parent {
            Some(pid) => &mut self.entries.get_mut(&pid)?.children,
            None => &mut self.roots,
        };
        let row = siblings.iter().position(|&c| c == id)?;
        siblings.remove(row);
        Some(row as u32)
    }

    /// Record that `conn` observed the destruction of `id`.
    pub fn acknowledge(&mut self, conn: ConnectionId, id: ObjectId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if let EntryState::Tombstone { pending_acks } = &mut entry.state {
                pending_acks.remove(&conn);
            }
        }
    }

    /// A connection went away; it can no longer ack anything.
    pub fn connection_closed(&mut self, conn: ConnectionId) {
        for entry in self.entries.values_mut() {
            if let EntryState::Tombstone { pending_acks } = &mut entry.state {
                pending_acks.remove(&conn);
            }
        }
    }

    /// Drop the payload of every fully acknowledged tombstone.
    ///
    /// Identities stay reserved forever; only the frozen data is released.
    /// Returns the identities reclaimed in this pass.
    pub fn reclaim_acknowledged(&mut self) -> Vec<ObjectId> {
        let mut reclaimed = Vec::new();
        for entry in self.entries.values_mut() {
            if matches!(&entry.state, EntryState::Tombstone { pending_acks } if pending_acks.is_empty())
            {
                entry.attributes = Vec::new();
                entry.type_name.clear();
                entry.state = EntryState::Reclaimed;
                reclaimed.push(entry.id);
            }
        }
        reclaimed
    }

    /// Look up an entry by identity. Tombstones resolve to their frozen
    /// data; reclaimed entries resolve to an empty stub.
    #[must_use]
    pub fn entry(&self, id: ObjectId) -> Option<&RegistryEntry> {
        self.entries.get(&id)
    }

    /// Replace one attribute of an alive object.
    ///
    /// # Errors
    /// `UnknownObject` / `Dead` for bad identities.
    pub fn set_attribute(
        &mut self,
        id: ObjectId,
        name: &str,
        value: Value,
    ) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(RegistryError::UnknownObject(id))?;
        if entry.is_dead() {
            return Err(RegistryError::Dead(id));
        }
        match entry.attributes.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => entry.attributes.push((name.to_string(), value)),
        }
        Ok(())
    }

    /// Replace the whole attribute bag of an alive object.
    ///
    /// # Errors
    /// `UnknownObject` / `Dead` for bad identities.
    pub fn set_attributes(
        &mut self,
        id: ObjectId,
        attributes: Vec<(String, Value)>,
    ) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(RegistryError::UnknownObject(id))?;
        if entry.is_dead() {
            return Err(RegistryError::Dead(id));
        }
        entry.attributes = attributes;
        Ok(())
    }

    /// Alive root objects, in registration order.
    #[must_use]
    pub fn roots(&self) -> &[ObjectId] {
        &self.roots
    }

    /// Row index of an alive object under its parent.
    #[must_use]
    pub fn row_of(&self, id: ObjectId) -> Option<u32> {
        let entry = self.entries.get(&id)?;
        if entry.is_dead() {
            return None;
        }
        let siblings = match entry.parent {
            Some(pid) => &self.entries.get(&pid)?.children,
            None => &self.roots,
        };
        siblings.iter().position(|&c| c == id).map(|r| r as u32)
    }

    /// Model path of an alive object (column 0 steps).
    #[must_use]
    pub fn path_of(&self, id: ObjectId) -> Option<ModelPath> {
        let entry = self.entries.get(&id)?;
        if entry.is_dead() {
            return None;
        }
        let row = self.row_of(id)?;
        let parent_path = match entry.parent {
            Some(pid) => self.path_of(pid)?,
            None => ModelPath::root(),
        };
        Some(parent_path.child(row, 0))
    }

    /// Resolve a path to the alive object it addresses; `None` for the root
    /// path itself.
    ///
    /// # Errors
    /// `UnknownObject` with a placeholder id when any step is out of range.
    pub fn resolve(&self, path: &ModelPath) -> Result<Option<ObjectId>, RegistryError> {
        let mut current: Option<ObjectId> = None;
        for step in path.steps() {
            let siblings = match current {
                Some(id) => {
                    &self
                        .entries
                        .get(&id)
                        .ok_or(RegistryError::UnknownObject(id))?
                        .children
                }
                None => &self.roots,
            };
            current = Some(
                *siblings
                    .get(step.row as usize)
                    .ok_or(RegistryError::UnknownObject(ObjectId::INVALID))?,
            );
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_core::IdentityAllocator;

    fn data(name: &str) -> ObjectData {
        ObjectData {
            type_name: name.to_string(),
            attributes: vec![("visible".into(), Value::from(true))],
            inconsistent: false,
        }
    }

    fn registry_with_tree() -> (ObjectRegistry, ObjectId, ObjectId, ObjectId) {
        let mut reg = ObjectRegistry::new();
        let mut ids = IdentityAllocator::new();
        let root = ids.allocate();
        let child_a = ids.allocate();
        let child_b = ids.allocate();
        reg.insert(root, None, data("Window")).unwrap();
        reg.insert(child_a, Some(root), data("Button")).unwrap();
        reg.insert(child_b, Some(root), data("Label")).unwrap();
        (reg, root, child_a, child_b)
    }

    #[test]
    fn insert_assigns_rows_in_order() {
        let (reg, root, a, b) = registry_with_tree();
        assert_eq!(reg.row_of(root), Some(0));
        assert_eq!(reg.row_of(a), Some(0));
        assert_eq!(reg.row_of(b), Some(1));
        assert_eq!(
            reg.path_of(b),
            Some(ModelPath::root().child(0, 0).child(1, 0))
        );
    }

    #[test]
    fn destroyed_entry_stays_resolvable_with_frozen_data() {
        let (mut reg, _root, a, b) = registry_with_tree();
        let conn = Uuid::new_v4();

        let outcome = reg.destroy(a, HashSet::from([conn])).unwrap();
        assert_eq!(outcome.row, 0);
        assert!(outcome.reparented.is_empty());

        // Frozen data is still there, but traversals skip the tombstone.
        let entry = reg.entry(a).unwrap();
        assert!(entry.is_dead());
        assert_eq!(entry.type_name, "Button");
        assert_eq!(entry.attributes.len(), 1);
        assert_eq!(reg.row_of(a), None);
        assert_eq!(reg.row_of(b), Some(0));
    }

    #[test]
    fn tombstone_reclaimed_only_after_all_acks() {
        let (mut reg, _root, a, _b) = registry_with_tree();
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());

        reg.destroy(a, HashSet::from([c1, c2])).unwrap();
        assert!(reg.reclaim_acknowledged().is_empty());

        reg.acknowledge(c1, a);
        assert!(reg.reclaim_acknowledged().is_empty());

        reg.acknowledge(c2, a);
        assert_eq!(reg.reclaim_acknowledged(), vec![a]);
        assert!(reg.entry(a).unwrap().is_reclaimed());
        assert!(reg.entry(a).unwrap().attributes.is_empty());
    }

    #[test]
    fn disconnect_counts_as_ack() {
        let (mut reg, _root, a, _b) = registry_with_tree();
        let conn = Uuid::new_v4();

        reg.destroy(a, HashSet::from([conn])).unwrap();
        reg.connection_closed(conn);
        assert_eq!(reg.reclaim_acknowledged(), vec![a]);
    }

    #[test]
    fn identity_never_reused_after_reclaim() {
        let (mut reg, _root, a, _b) = registry_with_tree();
        reg.destroy(a, HashSet::new()).unwrap();
        reg.reclaim_acknowledged();
        assert_eq!(
            reg.insert(a, None, data("Imposter")),
            Err(RegistryError::DuplicateObject(a))
        );
    }

    #[test]
    fn missing_parent_attaches_at_root_as_inconsistent() {
        let mut reg = ObjectRegistry::new();
        let mut ids = IdentityAllocator::new();
        let orphan = ids.allocate();
        let ghost_parent = ids.allocate();

        let (parent, row) = reg.insert(orphan, Some(ghost_parent), data("Floating")).unwrap();
        assert_eq!(parent, None);
        assert_eq!(row, 0);
        assert!(reg.entry(orphan).unwrap().inconsistent);
    }

    #[test]
    fn resolve_walks_rows() {
        let (reg, root, _a, b) = registry_with_tree();
        assert_eq!(reg.resolve(&ModelPath::root()).unwrap(), None);
        assert_eq!(
            reg.resolve(&ModelPath::root().child(0, 0)).unwrap(),
            Some(root)
        );
        assert_eq!(
            reg.resolve(&ModelPath::root().child(0, 0).child(1, 0))
                .unwrap(),
            Some(b)
        );
        assert!(reg.resolve(&ModelPath::root().child(5, 0)).is_err());
    }
}
