//! Parties: private subgroups gossiping over a deterministic neighbor ring.
//!
//! Members are kept as a sorted id set. A node's neighbors are the ids at
//! ring positions `i-1`, `i+1` and `i+2` relative to its own sorted position;
//! party gossip goes only to neighbors, so propagation is O(log N) with
//! bounded fan-out and churn stays cheap.

pub mod transfer;
pub mod wire;

use crate::crypto;
use crate::files::{self, Pack, PackState};
use crate::net::envelope::{Envelope, EnvelopeKind};
use crate::net::identity::MinPeer;
use crate::node::{min_from_id, Node};
use crate::types::{now, Chat};
use chrono::{Duration as ChronoDuration, SecondsFormat};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use wire::{PartyAdvertisement, PartyChat, PartyDisconnect, PartyEnvelope, PartyInvite, PartyKind};

/// Invite snapshots carry at most this many member ids.
const INVITE_MEMBER_CAP: usize = 20;

/// Party disconnects older than this are replays; drop them.
const DISCONNECT_MAX_AGE_SECS: i64 = 200;

/// Ads from the same sender are only re-forwarded when newer by this much.
const AD_REFRESH_SECS: i64 = 30;

pub struct Party {
    pub id: String,
    members: Mutex<BTreeSet<String>>,
    seen_chats: Mutex<HashSet<String>>,
    packs: Mutex<HashMap<String, Arc<Mutex<Pack>>>>,
}

impl Party {
    pub fn new(id: String, members: impl IntoIterator<Item = String>) -> Self {
        Self {
            id,
            members: Mutex::new(members.into_iter().collect()),
            seen_chats: Mutex::new(HashSet::new()),
            packs: Mutex::new(HashMap::new()),
        }
    }

    // =========================================================================
    // MEMBERSHIP
    // =========================================================================

    pub fn members(&self) -> Vec<String> {
        self.members.lock().unwrap().iter().cloned().collect()
    }

    pub fn contains_member(&self, id: &str) -> bool {
        self.members.lock().unwrap().contains(id)
    }

    pub fn insert_member(&self, id: &str) -> bool {
        self.members.lock().unwrap().insert(id.to_string())
    }

    pub fn remove_member(&self, id: &str) -> bool {
        self.members.lock().unwrap().remove(id)
    }

    /// Ring neighbors of `self_id`: sorted positions i-1, i+1, i+2 mod N,
    /// deduplicated, never including `self_id` itself. Empty when we are not
    /// (yet) in the member list.
    fn neighbors(&self, self_id: &str) -> Vec<String> {
        let sorted = self.members();
        let Some(idx) = sorted.iter().position(|id| id == self_id) else {
            return Vec::new();
        };

        let n = sorted.len();
        let mut neighbors = Vec::new();
        for offset in [n - 1, 1, 2] {
            let id = &sorted[(idx + offset) % n];
            if id != self_id && !neighbors.contains(id) {
                neighbors.push(id.clone());
            }
        }
        neighbors
    }

    // =========================================================================
    // PACK TABLE
    // =========================================================================

    pub fn pack(&self, hash: &str) -> Option<Arc<Mutex<Pack>>> {
        self.packs.lock().unwrap().get(hash).cloned()
    }

    pub fn pack_hashes(&self) -> Vec<String> {
        self.packs.lock().unwrap().keys().cloned().collect()
    }

    pub fn pack_state(&self, hash: &str) -> Option<PackState> {
        let pack = self.pack(hash)?;
        let state = pack.lock().unwrap().state;
        Some(state)
    }

    pub(crate) fn insert_pack(&self, hash: String, pack: Pack) {
        self.packs
            .lock()
            .unwrap()
            .insert(hash, Arc::new(Mutex::new(pack)));
    }

    pub(crate) fn clear_packs(&self) {
        self.packs.lock().unwrap().clear();
    }

    pub(crate) fn packs_snapshot(&self) -> Vec<(String, Arc<Mutex<Pack>>)> {
        self.packs
            .lock()
            .unwrap()
            .iter()
            .map(|(hash, pack)| (hash.clone(), pack.clone()))
            .collect()
    }

    // =========================================================================
    // SENDERS
    // =========================================================================

    /// Seal a party envelope to one member and route it.
    async fn send_sealed(&self, node: &Node, member_id: &str, party_env: &PartyEnvelope) {
        let Some(min) = min_from_id(node, member_id, "party send") else {
            return;
        };
        let json = serde_json::to_vec(party_env).expect("party envelope encodes");
        let mut env = Envelope::new(
            EnvelopeKind::Party,
            node.id(),
            member_id.to_string(),
            node.seal_for(&min, &json),
        );
        node.route(&mut env).await;
    }

    /// Wrap signed payload bytes and hand them to each ring neighbor.
    pub(crate) async fn send_to_neighbors(&self, node: &Node, kind: PartyKind, signed: Vec<u8>) {
        let party_env = PartyEnvelope::new(kind, node.id(), self.id.clone(), signed);
        for member_id in self.neighbors(&node.id()) {
            self.send_sealed(node, &member_id, &party_env).await;
        }
    }

    /// Invite a peer: seal a snapshot of the party straight to them.
    pub async fn send_invite(&self, node: &Node, min: &MinPeer) {
        let mut members = self.members();
        members.truncate(INVITE_MEMBER_CAP);
        let invite = PartyInvite {
            id: self.id.clone(),
            members,
        };
        let json = serde_json::to_vec(&invite).expect("invite encodes");
        let mut env = Envelope::new(
            EnvelopeKind::Invite,
            node.id(),
            min.id(),
            node.seal_for(min, &json),
        );
        node.route(&mut env).await;
        node.set_status("invite sent");
    }

    /// Tell every member we joined. Sent on accept, before self appears in
    /// the local member list.
    pub(crate) async fn send_announce(&self, node: &Node) {
        let announce = wire::PartyAnnounce {
            peer_id: node.id(),
            party_id: self.id.clone(),
        };
        let json = serde_json::to_vec(&announce).expect("party announce encodes");
        let signed = node.sign(&json);
        let party_env = PartyEnvelope::new(
            PartyKind::Announce,
            node.id(),
            self.id.clone(),
            signed,
        );

        for member_id in self.members() {
            if member_id == node.id() {
                continue;
            }
            self.send_sealed(node, &member_id, &party_env).await;
        }
    }

    pub async fn send_chat(&self, node: &Node, message: &str) {
        let chat = PartyChat {
            peer_id: node.id(),
            party_id: self.id.clone(),
            message: message.to_string(),
            time: now(),
        };
        let json = serde_json::to_vec(&chat).expect("party chat encodes");
        self.send_to_neighbors(node, PartyKind::Chat, node.sign(&json))
            .await;
    }

    pub(crate) async fn send_disconnect(&self, node: &Node) {
        let disconnect = PartyDisconnect {
            peer_id: node.id(),
            party_id: self.id.clone(),
            time: now(),
        };
        let json = serde_json::to_vec(&disconnect).expect("party disconnect encodes");
        self.send_to_neighbors(node, PartyKind::Disconnect, node.sign(&json))
            .await;
    }

    pub(crate) async fn send_advertisement(&self, node: &Node, hash: &str, pack: &Pack) {
        let ad = PartyAdvertisement {
            peer_id: node.id(),
            party_id: self.id.clone(),
            time: now(),
            hash: hash.to_string(),
            pack: pack.summary(),
        };
        let json = serde_json::to_vec(&ad).expect("party ad encodes");
        self.send_to_neighbors(node, PartyKind::Advertisement, node.sign(&json))
            .await;
    }

    /// Advertise every COMPLETE pack to the neighbors.
    pub(crate) async fn advertise_packs(&self, node: &Node) {
        for (hash, pack) in self.packs_snapshot() {
            let snapshot = {
                let pack = pack.lock().unwrap();
                (pack.state == PackState::Complete).then(|| pack.clone())
            };
            if let Some(pack) = snapshot {
                self.send_advertisement(node, &hash, &pack).await;
            }
        }
    }

    // =========================================================================
    // PROCESSORS
    // =========================================================================

    /// Verify a signed party payload against the key of the id inside it and
    /// decode it. The signer is the payload's author, not necessarily the
    /// forwarding envelope sender.
    fn verify_signed<T: serde::de::DeserializeOwned>(
        &self,
        node: &Node,
        signed: &[u8],
        peer_id_of: impl Fn(&T) -> String,
        caller: &str,
    ) -> Option<T> {
        if signed.len() < crypto::SIGNATURE_SIZE {
            node.set_status(format!("error truncated payload (party:{})", caller));
            return None;
        }
        let payload: T = match serde_json::from_slice(&signed[crypto::SIGNATURE_SIZE..]) {
            Ok(payload) => payload,
            Err(_) => {
                node.set_status(format!("error invalid json (party:{})", caller));
                return None;
            }
        };
        let peer_id = peer_id_of(&payload);
        let Some(min) = min_from_id(node, &peer_id, caller) else {
            return None;
        };
        if crypto::verify(signed, &min.sign_pub).is_err() {
            node.set_status(format!(
                "error questionable message integrity (party:{})",
                caller
            ));
            return None;
        }
        Some(payload)
    }

    pub(crate) async fn process_announce(&self, node: &Node, party_env: &PartyEnvelope) {
        let Some(announce) = self.verify_signed::<wire::PartyAnnounce>(
            node,
            &party_env.data,
            |a| a.peer_id.clone(),
            "announce",
        ) else {
            return;
        };

        if announce.party_id != self.id {
            node.set_status("error invalid party (party:announce)");
            return;
        }

        if self.insert_member(&announce.peer_id) {
            self.send_to_neighbors(node, PartyKind::Announce, party_env.data.clone())
                .await;
        }
    }

    pub(crate) async fn process_chat(&self, node: &Node, party_env: &PartyEnvelope) {
        let Some(chat) = self.verify_signed::<PartyChat>(
            node,
            &party_env.data,
            |c| c.peer_id.clone(),
            "chat",
        ) else {
            return;
        };

        if chat.party_id != self.id {
            node.set_status("error invalid party (party:chat)");
            return;
        }

        let chat_id = format!(
            "{}.{}",
            chat.peer_id,
            chat.time.to_rfc3339_opts(SecondsFormat::Nanos, true)
        );
        let first_sight = self.seen_chats.lock().unwrap().insert(chat_id);
        if first_sight {
            node.deliver_chat(Chat {
                time: now(),
                id: chat.peer_id,
                channel: self.id.clone(),
                message: chat.message,
            });
            self.send_to_neighbors(node, PartyKind::Chat, party_env.data.clone())
                .await;
        }
    }

    pub(crate) async fn process_disconnect(&self, node: &Node, party_env: &PartyEnvelope) {
        let Some(disconnect) = self.verify_signed::<PartyDisconnect>(
            node,
            &party_env.data,
            |d| d.peer_id.clone(),
            "disconnect",
        ) else {
            return;
        };

        if disconnect.party_id != self.id {
            node.set_status("error invalid party (party:disconnect)");
            return;
        }

        if now() - disconnect.time > ChronoDuration::seconds(DISCONNECT_MAX_AGE_SECS) {
            node.set_status("error time exceeds max allowable (party:disconnect)");
            return;
        }

        if self.remove_member(&disconnect.peer_id) {
            self.send_to_neighbors(node, PartyKind::Disconnect, party_env.data.clone())
                .await;
        }
    }

    pub(crate) async fn process_advertisement(&self, node: &Node, party_env: &PartyEnvelope) {
        let Some(ad) = self.verify_signed::<PartyAdvertisement>(
            node,
            &party_env.data,
            |a| a.peer_id.clone(),
            "ad",
        ) else {
            return;
        };

        if ad.party_id != self.id {
            node.set_status("error invalid party id (party:ad)");
            return;
        }

        // The hash must be reproducible from the advertised summary alone;
        // the ad is not evidence of anything else.
        if ad.hash != files::sha256_pack(&ad.pack) {
            node.set_status("error bad pack hash (party:ad)");
            return;
        }

        let pack_arc = {
            let mut packs = self.packs.lock().unwrap();
            packs
                .entry(ad.hash.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Pack::from_summary(&ad.pack))))
                .clone()
        };

        let sender = match min_from_id(node, &ad.peer_id, "ad") {
            Some(min) => min.id(),
            None => return,
        };

        let forward = {
            let mut pack = pack_arc.lock().unwrap();
            let prev = pack.peers.get(&sender).copied();
            let newer = prev.is_none_or(|prev| prev < ad.time);
            if newer {
                pack.peers.insert(sender, ad.time);
            }
            // Forward only ads clearly fresher than what this sender last
            // showed us; damps churn, preserves freshness.
            newer
                && prev.is_none_or(|prev| ad.time - prev > ChronoDuration::seconds(AD_REFRESH_SECS))
        };
        if forward {
            self.send_to_neighbors(node, PartyKind::Advertisement, party_env.data.clone())
                .await;
        }
    }

    // =========================================================================
    // DOWNLOADS
    // =========================================================================

    /// Start downloading an AVAILABLE pack: bind paths under the party
    /// directory, persist the pending snapshot, pre-extend every file and go
    /// ACTIVE.
    pub async fn start_pack(&self, node: &Node, pack_hash: &str) {
        let Some(pack_arc) = self.pack(pack_hash) else {
            node.set_status("error unknown pack (start)");
            return;
        };

        let party_dir = node.shared_dir().join(&self.id);

        let work = {
            let mut pack = pack_arc.lock().unwrap();
            if pack.name.contains("..") {
                node.set_status("error pack name potential directory traversal");
                return;
            }
            if let Err(err) = std::fs::create_dir_all(&party_dir) {
                node.set_status(format!("error could not create destination dir: {}", err));
                return;
            }

            pack.set_paths(&party_dir);
            for file in &mut pack.files {
                file.coverage = files::empty_coverage(file.size);
            }

            if let Err(err) = files::write_pending(&party_dir, pack_hash, &pack) {
                node.set_status(format!("error writing pending pack to file: {}", err));
                return;
            }

            let work: Vec<(String, u64)> = pack
                .files
                .iter()
                .map(|file| (file.path.clone(), file.size))
                .collect();
            work
        };

        // Pre-extension is the slow part; do it off the lock. The pack only
        // goes ACTIVE afterwards so no block can land before its file exists
        // at full size.
        for (path, size) in work {
            let path_buf = std::path::PathBuf::from(&path);
            let result =
                tokio::task::spawn_blocking(move || files::write_zero_file(&path_buf, size)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => node.set_status(format!("error writing empty file: {}", err)),
                Err(err) => node.set_status(format!("error writing empty file: {}", err)),
            }
        }

        pack_arc.lock().unwrap().state = PackState::Active;
    }
}
