//! The request-driven block transfer engine.
//!
//! Downloaders broadcast signed requests carrying their coverage bitmap on a
//! 5-second cadence. Holders answer with blocks the requester can verify
//! right now: successors (`b+1`) and skip-tree children (`2b+1`, `2b+2`) of
//! blocks it already has. One request entitles the requester to a short
//! stream of blocks (the request expires after 6 seconds); senders pick
//! uniformly among eligible blocks so concurrent holders interleave instead
//! of colliding.

use super::wire::{PartyEnvelope, PartyFulfillment, PartyKind, PartyRequest};
use super::Party;
use crate::files::{
    block_count, has_bit, is_empty_coverage, is_full_coverage, left_child, read_verified_block,
    right_child, set_bit, sha256_block, tree_parent, Block, BlockInfo, Pack, PackState, BLOCK_SIZE,
};
use crate::crypto::sha256_hex;
use crate::node::{Node, Since};
use crate::types::now;
use chrono::Duration as ChronoDuration;
use rand::Rng;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Repeat requests from the same flow are ignored for this long.
const REQUEST_RATELIMIT: Duration = Duration::from_secs(5);

/// Queued requests entitle the requester to blocks for this long.
const REQUEST_EXPIRY_SECS: i64 = 6;

/// Downloaders re-broadcast requests for uncovered files at this cadence.
const REQUEST_INTERVAL: Duration = Duration::from_secs(5);

/// Complete packs are re-advertised at this cadence.
const ADVERTISE_INTERVAL: Duration = Duration::from_secs(60);

/// Pause between blocks served to one requester; bounds the outbound rate to
/// roughly BLOCK_SIZE / 2ms ≈ 5 MB/s.
const SEND_PAUSE: Duration = Duration::from_millis(2);

/// A block that passed chain/tree verification, on its way to disk.
pub struct VerifiedBlock {
    pub party_id: String,
    pub pack_hash: String,
    pub file_hash: String,
    /// sha256_block of `block`, becoming its BlockLookup entry.
    pub hash: String,
    pub block: Block,
}

impl Party {
    // =========================================================================
    // REQUESTS
    // =========================================================================

    /// Broadcast one signed request for the uncovered parts of a file.
    pub(crate) async fn send_request(
        &self,
        node: &Node,
        pack_hash: &str,
        file_hash: &str,
        coverage: Vec<u64>,
    ) {
        let request = PartyRequest {
            peer_id: node.id(),
            pack_hash: pack_hash.to_string(),
            file_hash: file_hash.to_string(),
            coverage,
            time: now(),
            party_id: self.id.clone(),
        };
        let json = serde_json::to_vec(&request).expect("party request encodes");
        self.send_to_neighbors(node, PartyKind::Request, node.sign(&json))
            .await;
    }

    pub(crate) async fn process_request(&self, node: &Node, party_env: &PartyEnvelope) {
        let Some(mut request) = self.verify_signed::<PartyRequest>(
            node,
            &party_env.data,
            |r| r.peer_id.clone(),
            "request",
        ) else {
            return;
        };

        if request.party_id != self.id {
            node.set_status("error invalid party id (party:request)");
            return;
        }

        // One entry per (requester, party, pack, file) flow: stale stamps and
        // repeats inside the ratelimit window are dropped before any work.
        let dedup_id = sha256_hex(
            format!(
                "{}{}{}{}",
                request.peer_id, self.id, request.pack_hash, request.file_hash
            )
            .as_bytes(),
        );
        {
            let fresh = node.fresh_requests.lock().unwrap();
            if let Some(since) = fresh.get(&dedup_id) {
                if since.reported >= request.time
                    || since.received.elapsed() < REQUEST_RATELIMIT
                {
                    return;
                }
            }
        }

        self.send_to_neighbors(node, PartyKind::Request, party_env.data.clone())
            .await;

        node.fresh_requests.lock().unwrap().insert(
            dedup_id,
            Since {
                reported: request.time,
                received: Instant::now(),
            },
        );

        // Only queue flows we can actually serve.
        let Some(pack_arc) = self.pack(&request.pack_hash) else {
            return;
        };
        let holds = {
            let pack = pack_arc.lock().unwrap();
            pack.state != PackState::Available && pack.file(&request.file_hash).is_some()
        };
        if !holds {
            return;
        }

        // The wire stamp has served its purpose; from here the field is the
        // local service expiry.
        request.time = now() + ChronoDuration::seconds(REQUEST_EXPIRY_SECS);
        let _ = node.request_tx.try_send(request);
    }

    // =========================================================================
    // FULFILLMENTS
    // =========================================================================

    pub(crate) async fn send_fulfillment(&self, node: &Node, request: &PartyRequest, block: Block) {
        let fulfillment = PartyFulfillment {
            peer_id: node.id(),
            pack_hash: request.pack_hash.clone(),
            file_hash: request.file_hash.clone(),
            party_id: self.id.clone(),
            block,
        };
        let json = serde_json::to_vec(&fulfillment).expect("party fulfillment encodes");
        let party_env = PartyEnvelope::new(
            PartyKind::Fulfillment,
            node.id(),
            self.id.clone(),
            node.sign(&json),
        );
        self.send_sealed(node, &request.peer_id, &party_env).await;
    }

    /// Verify a received block against what we already hold and queue it for
    /// the writer. A block verifies through the forward chain (predecessor's
    /// next-hash) or the skip tree (parent's child-hash); when both paths
    /// exist they must agree. With neither, the block is dropped; a later
    /// fulfillment has to supply a parent first.
    pub(crate) async fn process_fulfillment(&self, node: &Node, party_env: &PartyEnvelope) {
        let Some(fulfillment) = self.verify_signed::<PartyFulfillment>(
            node,
            &party_env.data,
            |f| f.peer_id.clone(),
            "fulfillment",
        ) else {
            return;
        };

        if fulfillment.party_id != self.id {
            return;
        }
        let Some(pack_arc) = self.pack(&fulfillment.pack_hash) else {
            return;
        };

        let verified = {
            let pack = pack_arc.lock().unwrap();
            if pack.state != PackState::Active {
                return;
            }
            let Some(file) = pack.file(&fulfillment.file_hash) else {
                return;
            };

            let block = fulfillment.block;
            if sha256_hex(&block.data) != block.data_hash {
                return;
            }

            let hash = sha256_block(&block);
            if block.index == 0 {
                if hash != file.first_block_hash {
                    return;
                }
            } else {
                let mut check: Option<String> = None;
                if let Some(prev_hash) = file.block_lookup.get(&(block.index - 1)) {
                    if let Some(prev) = file.block_map.get(prev_hash) {
                        check = Some(prev.next_block_hash.clone());
                    }
                }
                if let Some(parent_hash) = file.block_lookup.get(&tree_parent(block.index)) {
                    if let Some(parent) = file.block_map.get(parent_hash) {
                        let tree_check = if block.index % 2 == 1 {
                            parent.left_block_hash.clone()
                        } else {
                            parent.right_block_hash.clone()
                        };
                        if check.as_ref().is_some_and(|c| *c != tree_check) {
                            // The chain and the tree disagree; someone lied.
                            return;
                        }
                        check = Some(tree_check);
                    }
                }
                match check {
                    None => return,
                    Some(check) if check != hash => return,
                    Some(_) => {}
                }
            }

            VerifiedBlock {
                party_id: self.id.clone(),
                pack_hash: fulfillment.pack_hash,
                file_hash: fulfillment.file_hash,
                hash,
                block,
            }
        };

        let _ = node.verified_tx.try_send(verified);
    }

    // =========================================================================
    // BLOCK CHOICE
    // =========================================================================

    /// Pick a block for `request` and load it from disk, re-verified. None
    /// when nothing we hold is verifiable by the requester right now.
    pub(crate) fn choose_block(&self, request: &PartyRequest) -> Option<Block> {
        let pack_arc = self.pack(&request.pack_hash)?;
        let (path, info) = {
            let pack = pack_arc.lock().unwrap();
            pick_block(&pack, request)?
        };
        match read_verified_block(Path::new(&path), &info) {
            Ok(block) => Some(block),
            Err(err) => {
                warn!("could not load block {}: {}", info.index, err);
                None
            }
        }
    }
}

/// The candidate walk: every set bit `b` in the requester's coverage
/// sponsors `b+1`, `2b+1` and `2b+2`; keep the ones the requester lacks and
/// we hold, then pick uniformly. An all-zero requester coverage can only
/// verify block 0.
fn pick_block(pack: &Pack, request: &PartyRequest) -> Option<(String, BlockInfo)> {
    let file = pack.file(&request.file_hash)?;
    if is_empty_coverage(&file.coverage) {
        return None;
    }

    let blocks = block_count(file.size);
    let words = file.coverage.len();
    let mut candidates = vec![0u64; words];
    for (word_idx, word) in request.coverage.iter().enumerate().take(words) {
        if *word == 0 {
            continue;
        }
        for bit in 0..64 {
            if (word >> bit) & 1 == 0 {
                continue;
            }
            let base = word_idx as u64 * 64 + bit;
            for next in [base + 1, left_child(base), right_child(base)] {
                if next < blocks && !has_bit(&request.coverage, next) {
                    set_bit(&mut candidates, next);
                }
            }
        }
    }
    for (word_idx, word) in candidates.iter_mut().enumerate() {
        *word &= file.coverage[word_idx];
    }

    let mut indices = Vec::new();
    for (word_idx, word) in candidates.iter().enumerate() {
        for bit in 0..64 {
            if (word >> bit) & 1 == 1 {
                indices.push(word_idx as u64 * 64 + bit);
            }
        }
    }

    let index = if indices.is_empty() {
        if is_empty_coverage(&request.coverage) && blocks > 0 && has_bit(&file.coverage, 0) {
            0
        } else {
            return None;
        }
    } else {
        indices[rand::thread_rng().gen_range(0..indices.len())]
    };

    let hash = file.block_lookup.get(&index)?;
    let info = file.block_map.get(hash)?.clone();
    Some((file.path.clone(), info))
}

// =============================================================================
// TASKS
// =============================================================================

/// Every 5 seconds, request the uncovered parts of every ACTIVE pack and
/// promote fully covered packs to COMPLETE.
pub(crate) async fn file_requester(node: Arc<Node>) {
    let mut interval = tokio::time::interval(REQUEST_INTERVAL);
    loop {
        interval.tick().await;
        for party in node.parties_snapshot() {
            for (pack_hash, pack_arc) in party.packs_snapshot() {
                let pending = {
                    let mut pack = pack_arc.lock().unwrap();
                    if pack.state != PackState::Active {
                        continue;
                    }
                    let pending: Vec<(String, Vec<u64>)> = pack
                        .files
                        .iter()
                        .filter(|file| !is_full_coverage(file.size, &file.coverage))
                        .map(|file| (file.hash.clone(), file.coverage.clone()))
                        .collect();
                    if pending.is_empty() {
                        pack.state = PackState::Complete;
                        node.chat_status(format!("pack {} complete", pack.name));
                        // The resume snapshot has served its purpose.
                        let pending_path = node
                            .shared_dir()
                            .join(&party.id)
                            .join(format!("{}.pending", pack.name));
                        let _ = std::fs::remove_file(pending_path);
                    }
                    pending
                };
                for (file_hash, coverage) in pending {
                    party
                        .send_request(&node, &pack_hash, &file_hash, coverage)
                        .await;
                }
            }
        }
    }
}

/// Drain the request queue: serve one verifiable block per pass and requeue
/// the request until it expires, so a single request yields a short stream.
pub(crate) async fn request_sender(node: Arc<Node>, mut requests: mpsc::Receiver<PartyRequest>) {
    while let Some(mut request) = requests.recv().await {
        if request.peer_id == node.id() {
            continue;
        }
        if now() > request.time {
            debug!("request expired");
            continue;
        }
        let Some(party) = node.party(&request.party_id) else {
            continue;
        };
        let Some(block) = party.choose_block(&request) else {
            continue;
        };
        let index = block.index;
        party.send_fulfillment(&node, &request, block).await;

        // Assume delivery; the requester's next request corrects us if not.
        set_bit(&mut request.coverage, index);
        // try_send: this task is the only consumer, a blocking send on a
        // full queue would deadlock it.
        let _ = node.request_tx.try_send(request);

        tokio::time::sleep(SEND_PAUSE).await;
    }
}

/// Persist verified blocks: write at the block offset, then publish the
/// coverage bit and map entries together. Write failures leave the bit
/// clear, so the request engine retries the block.
pub(crate) async fn block_writer(node: Arc<Node>, mut blocks: mpsc::Receiver<VerifiedBlock>) {
    while let Some(verified) = blocks.recv().await {
        let Some(party) = node.party(&verified.party_id) else {
            continue;
        };
        let Some(pack_arc) = party.pack(&verified.pack_hash) else {
            continue;
        };

        let path = {
            let pack = pack_arc.lock().unwrap();
            match pack.file(&verified.file_hash) {
                Some(file) if !has_bit(&file.coverage, verified.block.index) => {
                    PathBuf::from(&file.path)
                }
                _ => continue,
            }
        };

        let index = verified.block.index;
        let data = verified.block.data.clone();
        let write = tokio::task::spawn_blocking(move || write_block_at(&path, index, &data)).await;
        match write {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                node.set_status(format!("error writing to file for block: {}", err));
                continue;
            }
            Err(err) => {
                node.set_status(format!("error writing to file for block: {}", err));
                continue;
            }
        }

        let mut pack = pack_arc.lock().unwrap();
        if let Some(file) = pack.file_mut(&verified.file_hash) {
            set_bit(&mut file.coverage, index);
            file.block_map.insert(verified.hash.clone(), verified.block.info());
            file.block_lookup.insert(index, verified.hash);
        }
    }
}

fn write_block_at(path: &Path, index: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
    file.seek(SeekFrom::Start(index * BLOCK_SIZE))?;
    file.write_all(data)?;
    Ok(())
}

/// Every 60 seconds, re-advertise every COMPLETE pack to party neighbors.
pub(crate) async fn advertiser(node: Arc<Node>) {
    let mut interval = tokio::time::interval(ADVERTISE_INTERVAL);
    loop {
        interval.tick().await;
        node.advertise_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::{empty_coverage, full_coverage};
    use std::collections::HashMap;

    fn served_file(blocks: u64) -> Pack {
        let size = blocks * BLOCK_SIZE;
        let mut block_map = HashMap::new();
        let mut block_lookup = HashMap::new();
        for i in 0..blocks {
            let hash = format!("hash{}", i);
            block_map.insert(
                hash.clone(),
                BlockInfo {
                    index: i,
                    next_block_hash: String::new(),
                    left_block_hash: String::new(),
                    right_block_hash: String::new(),
                    data_hash: String::new(),
                },
            );
            block_lookup.insert(i, hash);
        }
        Pack {
            name: "pack".into(),
            state: PackState::Complete,
            files: vec![crate::files::PackFileInfo {
                name: "file".into(),
                hash: "filehash".into(),
                first_block_hash: "hash0".into(),
                size,
                block_map,
                block_lookup,
                coverage: full_coverage(size),
                path: "/nonexistent".into(),
            }],
            peers: HashMap::new(),
        }
    }

    fn request_with_coverage(coverage: Vec<u64>) -> PartyRequest {
        PartyRequest {
            peer_id: "peer".into(),
            pack_hash: "packhash".into(),
            file_hash: "filehash".into(),
            coverage,
            time: now(),
            party_id: "party".into(),
        }
    }

    #[test]
    fn empty_requester_coverage_gets_block_zero() {
        let pack = served_file(10);
        let request = request_with_coverage(empty_coverage(10 * BLOCK_SIZE));
        let (_, info) = pick_block(&pack, &request).unwrap();
        assert_eq!(info.index, 0);
    }

    #[test]
    fn candidates_are_successor_and_children() {
        let pack = served_file(10);
        // Requester has exactly block 1: eligible are 2 (successor),
        // 3 (left child) and 4 (right child).
        let mut coverage = empty_coverage(10 * BLOCK_SIZE);
        set_bit(&mut coverage, 1);
        let request = request_with_coverage(coverage);
        for _ in 0..50 {
            let (_, info) = pick_block(&pack, &request).unwrap();
            assert!(
                [2, 3, 4].contains(&info.index),
                "unexpected index {}",
                info.index
            );
        }
    }

    #[test]
    fn candidates_respect_requester_holdings() {
        let pack = served_file(10);
        // Requester has blocks 0..=4: candidates are 5 (2·2+1), 6 (2·2+2),
        // 7 (2·3+1), 8, 9.
        let mut coverage = empty_coverage(10 * BLOCK_SIZE);
        for i in 0..=4 {
            set_bit(&mut coverage, i);
        }
        let request = request_with_coverage(coverage);
        for _ in 0..50 {
            let (_, info) = pick_block(&pack, &request).unwrap();
            assert!(info.index >= 5 && info.index <= 9);
        }
    }

    #[test]
    fn full_requester_coverage_yields_nothing() {
        let pack = served_file(10);
        let request = request_with_coverage(full_coverage(10 * BLOCK_SIZE));
        assert!(pick_block(&pack, &request).is_none());
    }

    #[test]
    fn holder_with_nothing_yields_nothing() {
        let mut pack = served_file(10);
        pack.files[0].coverage = empty_coverage(10 * BLOCK_SIZE);
        let request = request_with_coverage(empty_coverage(10 * BLOCK_SIZE));
        assert!(pick_block(&pack, &request).is_none());
    }

    #[test]
    fn candidate_indices_stay_in_range() {
        // A requester with the last block set must not sponsor children
        // beyond the file.
        let pack = served_file(3);
        let mut coverage = empty_coverage(3 * BLOCK_SIZE);
        set_bit(&mut coverage, 2);
        let request = request_with_coverage(coverage);
        // Children of 2 are 5 and 6: out of range. Successor 3: out of
        // range. No candidates, coverage non-empty: nothing to send.
        assert!(pick_block(&pack, &request).is_none());
    }
}
