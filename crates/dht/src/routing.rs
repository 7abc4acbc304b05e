//! Kademlia routing table
//!
//! 160 buckets of at most k contacts, indexed by the most significant
//! differing bit of the XOR distance to the local id. A bucket keeps its
//! most recently seen contact at the front; a full bucket unconditionally
//! drops the least recently seen tail.

use std::collections::VecDeque;
use std::net::SocketAddr;

use veilnet_core::{Contact, NodeId, ID_BITS};

pub struct RoutingTable {
    local: NodeId,
    k: usize,
    buckets: Vec<VecDeque<Contact>>,
}

impl RoutingTable {
    pub fn new(local: NodeId, k: usize) -> Self {
        Self {
            local,
            k,
            buckets: (0..ID_BITS).map(|_| VecDeque::new()).collect(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    /// Record traffic from a peer.
    ///
    /// A known id moves to the front of its bucket, a fresh one is pushed
    /// there. Observations of the local id are ignored.
    pub fn observe(&mut self, id: NodeId, addr: SocketAddr) {
        if id == self.local {
            return;
        }
        let index = self.local.distance(&id).bucket_index();
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.iter().position(|c| c.id == id) {
            bucket.remove(pos);
        }
        bucket.push_front(Contact::new(id, addr));
        if bucket.len() > self.k {
            bucket.pop_back();
        }
    }

    /// The `count` contacts closest to `target`, ascending by XOR
    /// distance, ties broken by the lexicographic endpoint string.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut all: Vec<Contact> = self.buckets.iter().flatten().cloned().collect();
        all.sort_by(|a, b| {
            target
                .distance(&a.id)
                .cmp(&target.distance(&b.id))
                .then_with(|| a.addr.to_string().cmp(&b.addr.to_string()))
        });
        all.truncate(count);
        all
    }

    pub fn contact_count(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.contact_count() == 0
    }

    #[cfg(test)]
    fn bucket(&self, index: usize) -> &VecDeque<Contact> {
        &self.buckets[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(hex40: &str) -> NodeId {
        NodeId::from_hex(hex40).unwrap()
    }

    fn zero_id() -> NodeId {
        id(&"00".repeat(20))
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    /// Ids landing in bucket 0 of a zero-valued local id
    fn top_bucket_id(suffix: u8) -> NodeId {
        id(&format!("8{suffix:01x}{}", "00".repeat(19)))
    }

    #[test]
    fn test_bucket_indexing() {
        let mut table = RoutingTable::new(zero_id(), 20);

        table.observe(id(&format!("80{}", "00".repeat(19))), addr(1));
        table.observe(id(&format!("{}01", "00".repeat(19))), addr(2));

        assert_eq!(table.bucket(0).len(), 1);
        assert_eq!(table.bucket(159).len(), 1);
        assert_eq!(table.contact_count(), 2);
    }

    #[test]
    fn test_bucket_index_matches_msb_invariant() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, 20);
        for port in 0..100u16 {
            table.observe(NodeId::random(), addr(10000 + port));
        }
        for index in 0..ID_BITS {
            for contact in table.bucket(index) {
                assert_eq!(local.distance(&contact.id).bucket_index(), index);
            }
        }
    }

    #[test]
    fn test_local_id_is_ignored() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, 20);
        table.observe(local, addr(1));
        assert!(table.is_empty());
    }

    #[test]
    fn test_reobserve_moves_to_front() {
        let mut table = RoutingTable::new(zero_id(), 20);
        let (a, b, c) = (top_bucket_id(1), top_bucket_id(2), top_bucket_id(3));

        table.observe(a, addr(1));
        table.observe(b, addr(2));
        table.observe(c, addr(3));
        table.observe(a, addr(1));

        let order: Vec<NodeId> = table.bucket(0).iter().map(|contact| contact.id).collect();
        assert_eq!(order, vec![a, c, b]);
    }

    #[test]
    fn test_full_bucket_evicts_tail() {
        let mut table = RoutingTable::new(zero_id(), 2);
        let (a, b, c) = (top_bucket_id(1), top_bucket_id(2), top_bucket_id(3));

        table.observe(a, addr(1));
        table.observe(b, addr(2));
        table.observe(c, addr(3));

        let order: Vec<NodeId> = table.bucket(0).iter().map(|contact| contact.id).collect();
        assert_eq!(order, vec![c, b]);
    }

    #[test]
    fn test_no_duplicates_and_size_cap() {
        let mut table = RoutingTable::new(zero_id(), 5);
        for _ in 0..3 {
            for suffix in 0..8u8 {
                table.observe(top_bucket_id(suffix), addr(100 + suffix as u16));
            }
        }
        let bucket = table.bucket(0);
        assert_eq!(bucket.len(), 5);
        let mut ids: Vec<NodeId> = bucket.iter().map(|c| c.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn test_closest_zero_count_is_empty() {
        let mut table = RoutingTable::new(zero_id(), 20);
        table.observe(NodeId::random(), addr(1));
        assert!(table.closest(&NodeId::random(), 0).is_empty());
    }

    #[test]
    fn test_closest_overlong_count_returns_all_sorted() {
        let mut table = RoutingTable::new(zero_id(), 20);
        for port in 0..10u16 {
            table.observe(NodeId::random(), addr(5000 + port));
        }

        let target = NodeId::random();
        let closest = table.closest(&target, 100);
        assert_eq!(closest.len(), 10);
        for pair in closest.windows(2) {
            assert!(target.distance(&pair[0].id) <= target.distance(&pair[1].id));
        }
    }

    #[test]
    fn test_closest_prefers_near_ids() {
        let target = zero_id();
        let mut table = RoutingTable::new(id(&format!("ff{}", "00".repeat(19))), 20);

        let near = id(&format!("{}01", "00".repeat(19)));
        let far = id(&format!("70{}", "00".repeat(19)));
        table.observe(far, addr(1));
        table.observe(near, addr(2));

        let closest = table.closest(&target, 1);
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].id, near);
    }
}
