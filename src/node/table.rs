//! The fixed-size node table.
//!
//! Node ids are an 8-bit address space with 1..=232 assignable, so the
//! table is a directly indexed array of optional records rather than a map.
//! The table is guarded by a single reader/writer lock in the driver; no
//! holder may keep it across I/O.

use crate::core::constants::NODE_TABLE_SLOTS;
use crate::node::Node;

#[derive(Debug)]
pub(crate) struct NodeTable {
    slots: Box<[Option<Node>; NODE_TABLE_SLOTS]>,
}

impl NodeTable {
    pub fn new() -> Self {
        let slots: Vec<Option<Node>> = (0..NODE_TABLE_SLOTS).map(|_| None).collect();
        Self {
            slots: slots
                .into_boxed_slice()
                .try_into()
                .unwrap_or_else(|_| unreachable!("slot count is fixed")),
        }
    }

    pub fn get(&self, node_id: u8) -> Option<&Node> {
        self.slots[node_id as usize].as_ref()
    }

    pub fn get_mut(&mut self, node_id: u8) -> Option<&mut Node> {
        self.slots[node_id as usize].as_mut()
    }

    /// Install a record, replacing any previous occupant of the slot.
    pub fn insert(&mut self, node: Node) -> Option<Node> {
        self.slots[node.node_id() as usize].replace(node)
    }

    pub fn remove(&mut self, node_id: u8) -> Option<Node> {
        self.slots[node_id as usize].take()
    }

    pub fn contains(&self, node_id: u8) -> bool {
        self.slots[node_id as usize].is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// Ids of all present nodes, ascending.
    pub fn ids(&self) -> Vec<u8> {
        self.iter().map(Node::node_id).collect()
    }

    /// Remove every record, returning them for teardown notifications.
    pub fn drain(&mut self) -> Vec<Node> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut table = NodeTable::new();
        assert!(table.get(5).is_none());

        table.insert(Node::new(0, 5));
        assert!(table.contains(5));
        assert_eq!(table.get(5).unwrap().node_id(), 5);

        let removed = table.remove(5).unwrap();
        assert_eq!(removed.node_id(), 5);
        assert!(!table.contains(5));
    }

    #[test]
    fn test_insert_replaces() {
        let mut table = NodeTable::new();
        table.insert(Node::new(0, 9));
        let previous = table.insert(Node::new(1, 9));
        assert!(previous.is_some());
        assert_eq!(table.ids(), vec![9]);
    }

    #[test]
    fn test_drain_empties_table() {
        let mut table = NodeTable::new();
        table.insert(Node::new(0, 1));
        table.insert(Node::new(0, 2));
        table.insert(Node::new(0, 200));

        let drained = table.drain();
        assert_eq!(drained.len(), 3);
        assert!(table.ids().is_empty());
    }
}
