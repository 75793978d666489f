//! Bridge graph between client devices
//!
//! An undirected multigraph over MACs. An edge means the two devices may
//! exchange traffic; absence isolates them. Edge operations are commutative
//! and idempotent.

use std::collections::HashMap;

use super::MacAddr;

#[derive(Debug, Default)]
pub struct BridgeGraph {
    adjacency: HashMap<MacAddr, Vec<MacAddr>>,
}

impl BridgeGraph {
    /// Add an edge between two devices. Returns `true` if the edge was new.
    /// Self-edges are ignored.
    pub fn add(&mut self, a: MacAddr, b: MacAddr) -> bool {
        if a == b || self.contains(&a, &b) {
            return false;
        }
        self.adjacency.entry(a).or_default().push(b);
        self.adjacency.entry(b).or_default().push(a);
        true
    }

    /// Remove an edge. Returns `true` if the edge existed.
    pub fn remove(&mut self, a: MacAddr, b: MacAddr) -> bool {
        if !self.contains(&a, &b) {
            return false;
        }
        if let Some(peers) = self.adjacency.get_mut(&a) {
            peers.retain(|p| p != &b);
        }
        if let Some(peers) = self.adjacency.get_mut(&b) {
            peers.retain(|p| p != &a);
        }
        true
    }

    pub fn contains(&self, a: &MacAddr, b: &MacAddr) -> bool {
        self.adjacency
            .get(a)
            .map(|peers| peers.contains(b))
            .unwrap_or(false)
    }

    /// All devices bridged with `mac`.
    pub fn peers(&self, mac: &MacAddr) -> Vec<MacAddr> {
        self.adjacency.get(mac).cloned().unwrap_or_default()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(Vec::len).sum::<usize>() / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([0x00, 0x11, 0x22, 0x33, 0x44, last])
    }

    #[test]
    fn test_add_is_commutative() {
        let mut left = BridgeGraph::default();
        let mut right = BridgeGraph::default();

        assert!(left.add(mac(1), mac(2)));
        assert!(right.add(mac(2), mac(1)));

        assert!(left.contains(&mac(1), &mac(2)));
        assert!(left.contains(&mac(2), &mac(1)));
        assert_eq!(left.edge_count(), right.edge_count());
    }

    #[test]
    fn test_duplicate_add_is_idempotent() {
        let mut graph = BridgeGraph::default();

        assert!(graph.add(mac(1), mac(2)));
        assert!(!graph.add(mac(1), mac(2)));
        assert!(!graph.add(mac(2), mac(1)));
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.peers(&mac(1)), vec![mac(2)]);
    }

    #[test]
    fn test_remove_either_direction() {
        let mut graph = BridgeGraph::default();
        graph.add(mac(1), mac(2));

        assert!(graph.remove(mac(2), mac(1)));
        assert!(!graph.contains(&mac(1), &mac(2)));
        // Removing an absent edge is a no-op.
        assert!(!graph.remove(mac(1), mac(2)));
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_peers_of_hub() {
        let mut graph = BridgeGraph::default();
        graph.add(mac(1), mac(2));
        graph.add(mac(1), mac(3));
        graph.add(mac(1), mac(4));

        let mut peers = graph.peers(&mac(1));
        peers.sort();
        assert_eq!(peers, vec![mac(2), mac(3), mac(4)]);
        assert_eq!(graph.peers(&mac(2)), vec![mac(1)]);
        assert!(graph.peers(&mac(9)).is_empty());
    }

    #[test]
    fn test_self_edge_rejected() {
        let mut graph = BridgeGraph::default();
        assert!(!graph.add(mac(1), mac(1)));
        assert_eq!(graph.edge_count(), 0);
    }
}
