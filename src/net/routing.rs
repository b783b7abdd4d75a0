//! XOR-distance routing table.
//!
//! 256 buckets anchored on the local sign key. The "ideal id" of bucket `i`
//! is the local key with bit `i` flipped; a peer lives in the bucket whose
//! ideal id it is XOR-closest to. Buckets hold at most 20 entries sorted by
//! ascending distance to their ideal id.
//!
//! Short ids are 32 raw bytes treated as 256-bit big-endian integers, so a
//! plain byte-array comparison on the XOR is the numeric distance order.

use super::identity::Peer;
use crate::crypto::KEY_SIZE;
use std::time::{Duration, Instant};

pub const BUCKET_COUNT: usize = 256;
pub const BUCKET_CAPACITY: usize = 20;

/// Entries unseen for this long are swept by the pinger.
pub const PEER_STALE: Duration = Duration::from_secs(60);

pub type ShortId = [u8; KEY_SIZE];

fn xor(a: &ShortId, b: &ShortId) -> ShortId {
    let mut out = [0u8; KEY_SIZE];
    for i in 0..KEY_SIZE {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Flip bit `i` of a 256-bit big-endian integer (bit 0 = least significant).
fn flip_bit(id: &ShortId, i: usize) -> ShortId {
    let mut out = *id;
    out[KEY_SIZE - 1 - i / 8] ^= 1 << (i % 8);
    out
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer: Peer,
    /// XOR distance to the owning bucket's ideal id.
    pub distance: ShortId,
    pub seen: Instant,
}

pub struct RoutingTable {
    ideal: Vec<ShortId>,
    buckets: Vec<Vec<PeerEntry>>,
}

impl RoutingTable {
    pub fn new(self_sign_pub: &ShortId) -> Self {
        let ideal = (0..BUCKET_COUNT)
            .map(|i| flip_bit(self_sign_pub, i))
            .collect();
        Self {
            ideal,
            buckets: vec![Vec::new(); BUCKET_COUNT],
        }
    }

    /// Index of the bucket whose ideal id is XOR-closest to `id`.
    fn closest_index(&self, id: &ShortId) -> usize {
        let mut best = 0;
        let mut best_dist = xor(&self.ideal[0], id);
        for (i, ideal) in self.ideal.iter().enumerate().skip(1) {
            let dist = xor(ideal, id);
            if dist < best_dist {
                best = i;
                best_dist = dist;
            }
        }
        best
    }

    /// Whether `peer` would make it into its bucket: room left, or closer to
    /// the ideal id than the current tail.
    pub fn would_add(&self, peer: &Peer) -> bool {
        let id = peer.sign_pub;
        let idx = self.closest_index(&id);
        let bucket = &self.buckets[idx];
        if bucket.len() < BUCKET_CAPACITY {
            return true;
        }
        let dist = xor(&self.ideal[idx], &id);
        dist < bucket[bucket.len() - 1].distance
    }

    /// Insert `peer` at its sorted position, evicting the tail past capacity.
    /// Equal distances keep insertion order. Returns false if the peer fell
    /// off the end of a full bucket.
    pub fn add(&mut self, peer: Peer) -> bool {
        let id = peer.sign_pub;
        let idx = self.closest_index(&id);
        let distance = xor(&self.ideal[idx], &id);
        let bucket = &mut self.buckets[idx];

        // One entry per id and bucket; a re-add replaces the old entry.
        bucket.retain(|entry| entry.peer.sign_pub != id);

        let pos = bucket
            .iter()
            .position(|entry| distance < entry.distance)
            .unwrap_or(bucket.len());
        bucket.insert(
            pos,
            PeerEntry {
                peer,
                distance,
                seen: Instant::now(),
            },
        );
        if bucket.len() > BUCKET_CAPACITY {
            bucket.truncate(BUCKET_CAPACITY);
        }
        pos < BUCKET_CAPACITY
    }

    /// Remove all entries for `short_id` from the one bucket it maps to.
    pub fn remove(&mut self, short_id: &ShortId) {
        let idx = self.closest_index(short_id);
        self.buckets[idx].retain(|entry| entry.peer.sign_pub != *short_id);
    }

    /// Drop entries not seen within [`PEER_STALE`]. Returns how many went.
    pub fn remove_stale(&mut self) -> usize {
        let cutoff = Instant::now();
        let mut removed = 0;
        for bucket in &mut self.buckets {
            let before = bucket.len();
            bucket.retain(|entry| cutoff.duration_since(entry.seen) <= PEER_STALE);
            removed += before - bucket.len();
        }
        removed
    }

    /// Update `seen` on every entry matching `short_id`, across all buckets.
    pub fn refresh(&mut self, short_id: &ShortId) {
        let now = Instant::now();
        for bucket in &mut self.buckets {
            for entry in bucket.iter_mut() {
                if entry.peer.sign_pub == *short_id {
                    entry.seen = now;
                }
            }
        }
    }

    /// The `n` entries in `target`'s bucket closest to `target` itself,
    /// ascending by distance.
    pub fn find_closest_n(&self, target: &ShortId, n: usize) -> Vec<PeerEntry> {
        let idx = self.closest_index(target);
        let mut entries: Vec<(ShortId, &PeerEntry)> = self.buckets[idx]
            .iter()
            .map(|entry| (xor(&entry.peer.sign_pub, target), entry))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.truncate(n);
        entries.into_iter().map(|(_, entry)| entry.clone()).collect()
    }

    pub fn find_closest(&self, target: &ShortId) -> Option<PeerEntry> {
        self.find_closest_n(target, 1).into_iter().next()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Every distinct peer in the table, deduplicated by id. Flood and ping
    /// iterate this.
    pub fn unique_peers(&self) -> Vec<Peer> {
        let mut seen = std::collections::HashSet::new();
        let mut peers = Vec::new();
        for bucket in &self.buckets {
            for entry in bucket {
                if seen.insert(entry.peer.id()) {
                    peers.push(entry.peer.clone());
                }
            }
        }
        peers
    }
}

/// Ideal-id table for an arbitrary key; the suggestion responder computes
/// this for the requester.
pub fn ideal_table(sign_pub: &ShortId) -> Vec<ShortId> {
    (0..BUCKET_COUNT).map(|i| flip_bit(sign_pub, i)).collect()
}

/// Numeric XOR distance between two short ids, comparable with `<`.
pub fn distance(a: &ShortId, b: &ShortId) -> ShortId {
    xor(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_with_key(sign: [u8; KEY_SIZE]) -> Peer {
        Peer {
            sign_pub: sign,
            enc_pub: [7u8; KEY_SIZE],
            address: "127.0.0.1:1".into(),
        }
    }

    fn key(byte: u8) -> ShortId {
        let mut k = [0u8; KEY_SIZE];
        k[KEY_SIZE - 1] = byte;
        k
    }

    #[test]
    fn flip_bit_matches_xor_with_power_of_two() {
        let zero = [0u8; KEY_SIZE];
        let b0 = flip_bit(&zero, 0);
        assert_eq!(b0[KEY_SIZE - 1], 1);
        let b9 = flip_bit(&zero, 9);
        assert_eq!(b9[KEY_SIZE - 2], 2);
        let b255 = flip_bit(&zero, 255);
        assert_eq!(b255[0], 0x80);
    }

    #[test]
    fn self_never_lands_in_a_bucket() {
        // Adding self is prevented by the caller; the table itself only
        // guarantees that find_closest of self's id returns real peers.
        let table = RoutingTable::new(&key(1));
        assert!(table.is_empty());
        assert!(table.find_closest(&key(1)).is_none());
    }

    /// Keys with the top bit set and only the low byte varying all land in
    /// bucket 255 of an all-zero anchor, so capacity is actually exercised.
    fn top_bucket_key(byte: u8) -> ShortId {
        let mut k = key(byte);
        k[0] = 0x80;
        k
    }

    #[test]
    fn buckets_stay_sorted_and_bounded() {
        let mut table = RoutingTable::new(&[0u8; KEY_SIZE]);
        for byte in 1..=60u8 {
            table.add(peer_with_key(top_bucket_key(byte)));
        }
        for bucket in &table.buckets {
            assert!(bucket.len() <= BUCKET_CAPACITY);
            for pair in bucket.windows(2) {
                assert!(pair[0].distance <= pair[1].distance);
            }
        }
        // The shared bucket kept the 20 closest (low bytes 1..=20).
        let idx = table.closest_index(&top_bucket_key(1));
        let bucket = &table.buckets[idx];
        assert_eq!(bucket.len(), BUCKET_CAPACITY);
        assert_eq!(bucket[0].peer.sign_pub, top_bucket_key(1));
        assert_eq!(
            bucket[BUCKET_CAPACITY - 1].peer.sign_pub,
            top_bucket_key(BUCKET_CAPACITY as u8)
        );
    }

    #[test]
    fn would_add_rejects_far_peer_when_full() {
        let mut table = RoutingTable::new(&[0u8; KEY_SIZE]);
        // Fill bucket 255 with low bytes 1..=20.
        for byte in 1..=BUCKET_CAPACITY as u8 {
            table.add(peer_with_key(top_bucket_key(byte)));
        }
        // Farther than the current tail: refused.
        assert!(!table.would_add(&peer_with_key(top_bucket_key(200))));
        // The anchor itself (distance 0 from the ideal): accepted.
        let mut closest = [0u8; KEY_SIZE];
        closest[0] = 0x80;
        assert!(table.would_add(&peer_with_key(closest)));
    }

    #[test]
    fn remove_clears_the_peer() {
        let mut table = RoutingTable::new(&[0u8; KEY_SIZE]);
        let peer = peer_with_key(key(9));
        table.add(peer.clone());
        assert!(!table.is_empty());
        table.remove(&peer.sign_pub);
        assert!(table.is_empty());
    }

    #[test]
    fn find_closest_orders_by_distance_to_target() {
        let mut table = RoutingTable::new(&[0u8; KEY_SIZE]);
        table.add(peer_with_key(key(8)));
        table.add(peer_with_key(key(9)));
        table.add(peer_with_key(key(12)));

        let target = key(9);
        let closest = table.find_closest_n(&target, 3);
        assert!(!closest.is_empty());
        assert_eq!(closest[0].peer.sign_pub, key(9));
        for pair in closest.windows(2) {
            assert!(xor(&pair[0].peer.sign_pub, &target) <= xor(&pair[1].peer.sign_pub, &target));
        }
    }

    #[test]
    fn unique_peers_dedups_by_id() {
        let mut table = RoutingTable::new(&[0u8; KEY_SIZE]);
        let peer = peer_with_key(key(5));
        table.add(peer.clone());
        table.add(peer.clone());
        let peers = table.unique_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id(), peer.id());
    }

    #[test]
    fn refresh_updates_seen() {
        let mut table = RoutingTable::new(&[0u8; KEY_SIZE]);
        let peer = peer_with_key(key(5));
        table.add(peer.clone());
        let before = table.buckets[table.closest_index(&peer.sign_pub)][0].seen;
        std::thread::sleep(Duration::from_millis(5));
        table.refresh(&peer.sign_pub);
        let after = table.buckets[table.closest_index(&peer.sign_pub)][0].seen;
        assert!(after > before);
    }
}
