//! The node: one value owning the routing table, peer cache, parties,
//! channels and configuration. Long-running tasks share it behind an `Arc`;
//! the embedding client talks to it through the public methods and drains the
//! chat/status sinks.

use crate::config::NodeConfig;
use crate::crypto::CryptoError;
use crate::files;
use crate::net::identity::{parse_id, short_id_bytes, Identity, MinPeer, Peer};
use crate::net::peer_cache::{PeerCache, PeerFlags};
use crate::net::routing::RoutingTable;
use crate::net::transport::{Transport, RECV_BUFFER_SIZE};
use crate::party::transfer::{self, VerifiedBlock};
use crate::party::wire::{valid_party_id, PartyInvite, PartyRequest};
use crate::party::Party;
use crate::types::{Chat, Status};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Entries in the reroute and fresh-request sets older than this are pruned
/// on the pinger tick.
pub(crate) const DEDUP_TTL: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("file: {0}")]
    File(#[from] files::FileError),
    #[error("invalid bootstrap url")]
    InvalidBootstrapUrl,
    #[error("invalid party name")]
    InvalidPartyName,
}

/// Ratelimit bookkeeping for one block request flow.
pub(crate) struct Since {
    pub reported: DateTime<Utc>,
    pub received: Instant,
}

/// Receiving ends of the outbound sinks.
pub struct NodeEvents {
    pub chat: mpsc::Receiver<Chat>,
    pub status: mpsc::Receiver<Status>,
}

pub struct Node {
    identity: Identity,
    shared_dir: PathBuf,
    pub(crate) transport: Transport,

    pub(crate) table: Mutex<RoutingTable>,
    pub(crate) cache: Mutex<PeerCache>,
    /// True between "all friends gone" and the next successful add; gates the
    /// one-shot chatter in both directions.
    pub(crate) table_empty: Mutex<bool>,

    parties: Mutex<HashMap<String, Arc<Party>>>,
    pending_invites: Mutex<HashMap<String, PartyInvite>>,

    pub(crate) seen_chats: Mutex<HashSet<String>>,
    pub(crate) no_reroute: Mutex<HashMap<String, Instant>>,
    pub(crate) fresh_requests: Mutex<HashMap<String, Since>>,

    pub(crate) request_tx: mpsc::Sender<PartyRequest>,
    pub(crate) verified_tx: mpsc::Sender<VerifiedBlock>,
    chat_tx: mpsc::Sender<Chat>,
    status_tx: mpsc::Sender<Status>,
}

impl Node {
    /// Build a node from `config`, bind its UDP port and spawn the
    /// long-running tasks. Returns the shared handle and the sink receivers.
    pub async fn start(config: NodeConfig) -> Result<(Arc<Self>, NodeEvents), NodeError> {
        let shared_dir = files::init_shared_dir(config.shared_dir.as_deref())?;
        let identity = match config.keys {
            Some(keys) => Identity::from_secrets(
                keys.sign_secret,
                keys.enc_secret,
                config.external_address.clone(),
            ),
            None => Identity::generate(config.external_address.clone()),
        };

        let transport = Transport::bind(config.port).await?;
        let table = RoutingTable::new(&identity.sign_pub());

        let (chat_tx, chat_rx) = mpsc::channel(100);
        let (status_tx, status_rx) = mpsc::channel(1024);
        let (request_tx, request_rx) = mpsc::channel(1024);
        let (verified_tx, verified_rx) = mpsc::channel(1024);

        let node = Arc::new(Self {
            identity,
            shared_dir,
            transport,
            table: Mutex::new(table),
            cache: Mutex::new(PeerCache::new()),
            table_empty: Mutex::new(true),
            parties: Mutex::new(HashMap::new()),
            pending_invites: Mutex::new(HashMap::new()),
            seen_chats: Mutex::new(HashSet::new()),
            no_reroute: Mutex::new(HashMap::new()),
            fresh_requests: Mutex::new(HashMap::new()),
            request_tx,
            verified_tx,
            chat_tx,
            status_tx,
        });

        info!("node id {}", node.id());
        info!("bootstrap url {}", node.bootstrap_url());

        tokio::spawn(receiver(node.clone()));
        tokio::spawn(crate::net::senders::pinger(node.clone()));
        tokio::spawn(transfer::file_requester(node.clone()));
        tokio::spawn(transfer::request_sender(node.clone(), request_rx));
        tokio::spawn(transfer::block_writer(node.clone(), verified_rx));
        tokio::spawn(transfer::advertiser(node.clone()));

        Ok((
            node,
            NodeEvents {
                chat: chat_rx,
                status: status_rx,
            },
        ))
    }

    // =========================================================================
    // IDENTITY
    // =========================================================================

    pub fn id(&self) -> String {
        self.identity.id()
    }

    pub fn short_id(&self) -> String {
        self.identity.short_id()
    }

    pub fn min(&self) -> MinPeer {
        self.identity.min()
    }

    pub fn peer_self(&self) -> Peer {
        self.identity.peer()
    }

    /// `ip/port/short_id`: what the operator hands to the other side.
    pub fn bootstrap_url(&self) -> String {
        let peer = self.identity.peer();
        let (host, port) = peer.address.rsplit_once(':').unwrap_or((peer.address.as_str(), ""));
        format!("{}/{}/{}", host, port, peer.short_id())
    }

    /// The UDP port actually bound (useful when configured as 0).
    pub fn local_port(&self) -> u16 {
        self.transport
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    pub fn shared_dir(&self) -> &PathBuf {
        &self.shared_dir
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.identity.sign(message)
    }

    pub(crate) fn seal_for(&self, min: &MinPeer, plain: &[u8]) -> Vec<u8> {
        self.identity.seal(plain, &min.enc_pub)
    }

    pub(crate) fn open_from(&self, min: &MinPeer, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.identity.open(sealed, &min.enc_pub)
    }

    // =========================================================================
    // SINKS
    // =========================================================================

    /// Low-priority status: drop reasons, diagnostics.
    pub(crate) fn set_status(&self, text: impl Into<String>) {
        let status = Status::low(text);
        debug!("{}", status.text);
        let _ = self.status_tx.try_send(status);
    }

    /// High-priority status: operator-visible transitions.
    pub(crate) fn chat_status(&self, text: impl Into<String>) {
        let status = Status::high(text);
        info!("{}", status.text);
        let _ = self.status_tx.try_send(status);
    }

    pub(crate) fn deliver_chat(&self, chat: Chat) {
        let _ = self.chat_tx.try_send(chat);
    }

    // =========================================================================
    // PEERS
    // =========================================================================

    /// Flags recorded for a peer id, defaulted if never seen.
    pub fn peer_flags(&self, id: &str) -> PeerFlags {
        self.cache.lock().unwrap().get(id)
    }

    pub fn have_peers(&self) -> bool {
        !self.table.lock().unwrap().is_empty()
    }

    /// Idempotent add with the reconnect rule: a peer already added is only
    /// re-admitted when it was disconnected and `event_time` is newer than
    /// its last recorded event.
    pub(crate) fn add_peer(&self, peer: Peer, event_time: DateTime<Utc>) {
        let id = peer.id();
        {
            let mut cache = self.cache.lock().unwrap();
            let flags = cache.get(&id);
            if flags.added && !flags.reconnecting(event_time) {
                return;
            }
            cache.mark_added(&id, event_time);
        }

        self.table.lock().unwrap().add(peer);

        let mut empty = self.table_empty.lock().unwrap();
        if *empty {
            *empty = false;
            drop(empty);
            self.chat_status("peer added, happy chatting!");
        }
    }

    pub(crate) fn would_add(&self, peer: &Peer) -> bool {
        self.table.lock().unwrap().would_add(peer)
    }

    pub(crate) fn remove_peer(&self, short_id: &str) {
        let Ok(bytes) = short_id_bytes(short_id) else {
            return;
        };
        let now_empty = {
            let mut table = self.table.lock().unwrap();
            table.remove(&bytes);
            table.is_empty()
        };
        if now_empty {
            self.note_table_empty();
        }
    }

    pub(crate) fn refresh_peer(&self, short_id: &str) {
        if let Ok(bytes) = short_id_bytes(short_id) {
            self.table.lock().unwrap().refresh(&bytes);
        }
    }

    /// One-shot "all friends gone" chatter when the table drains.
    pub(crate) fn note_table_empty(&self) {
        let mut empty = self.table_empty.lock().unwrap();
        if !*empty {
            *empty = true;
            drop(empty);
            self.chat_status("all friends gone, bootstrap some new ones");
        }
    }

    // =========================================================================
    // PARTIES
    // =========================================================================

    pub fn party(&self, party_id: &str) -> Option<Arc<Party>> {
        self.parties.lock().unwrap().get(party_id).cloned()
    }

    pub fn party_ids(&self) -> Vec<String> {
        self.parties.lock().unwrap().keys().cloned().collect()
    }

    pub(crate) fn parties_snapshot(&self) -> Vec<Arc<Party>> {
        self.parties.lock().unwrap().values().cloned().collect()
    }

    pub fn pending_invite_ids(&self) -> Vec<String> {
        self.pending_invites.lock().unwrap().keys().cloned().collect()
    }

    pub(crate) fn record_pending_invite(&self, invite: PartyInvite) -> bool {
        let id = invite.id.clone();
        if self.parties.lock().unwrap().contains_key(&id) {
            return false;
        }
        let mut pending = self.pending_invites.lock().unwrap();
        if pending.contains_key(&id) {
            return false;
        }
        pending.insert(id, invite);
        true
    }

    /// Start a new party. The id is the (sanitized, ≤8 char) name padded to
    /// 32 alphanumerics with random hex; it must not be guessable from the
    /// name alone.
    pub fn party_start(&self, name: &str) -> Result<String, NodeError> {
        let clean: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect();

        let mut random = [0u8; 16];
        rand::thread_rng().fill(&mut random);
        let suffix = hex::encode(random);
        let id = format!("{}{}", clean, &suffix[..32 - clean.len()]);
        if !valid_party_id(&id) {
            return Err(NodeError::InvalidPartyName);
        }

        let party = Arc::new(Party::new(id.clone(), [self.id()]));
        self.parties.lock().unwrap().insert(id.clone(), party);
        Ok(id)
    }

    /// Move a pending invite to the joined set and announce into the party.
    pub async fn accept_invite(&self, party_id: &str) {
        let invite = {
            let mut pending = self.pending_invites.lock().unwrap();
            pending.remove(party_id)
        };
        let Some(invite) = invite else {
            self.set_status("error no pending invite with id");
            return;
        };
        if self.parties.lock().unwrap().contains_key(party_id) {
            self.set_status("error already joined party with id");
            return;
        }

        let party = Arc::new(Party::new(invite.id.clone(), invite.members.clone()));
        party.send_announce(self).await;
        party.insert_member(&self.id());
        self.parties
            .lock()
            .unwrap()
            .insert(invite.id.clone(), party);
        self.chat_status(format!("accepted invite {}", party_id));
    }

    /// Rebuild every joined party's pack table from the share tree, then
    /// advertise what is complete.
    pub async fn rescan_packs(&self) {
        let self_id = self.id();
        for party in self.parties_snapshot() {
            party.clear_packs();
            for (hash, pack) in files::scan_party(&self.shared_dir, &party.id, &self_id) {
                party.insert_pack(hash, pack);
            }
        }
        self.advertise_all().await;
    }

    pub(crate) async fn advertise_all(&self) {
        for party in self.parties_snapshot() {
            party.advertise_packs(self).await;
        }
    }

    /// Leave every party, telling each one's neighbors.
    pub async fn disconnect_parties(&self) {
        let parties: Vec<Arc<Party>> = {
            let mut map = self.parties.lock().unwrap();
            map.drain().map(|(_, party)| party).collect()
        };
        for party in parties {
            party.send_disconnect(self).await;
        }
    }

    // =========================================================================
    // DEDUP SET GC
    // =========================================================================

    pub(crate) fn prune_dedup_sets(&self) {
        let cutoff = Instant::now();
        self.no_reroute
            .lock()
            .unwrap()
            .retain(|_, seen| cutoff.duration_since(*seen) <= DEDUP_TTL);
        self.fresh_requests
            .lock()
            .unwrap()
            .retain(|_, since| cutoff.duration_since(since.received) <= DEDUP_TTL);
    }
}

/// Parse a MinPeer out of an id, surfacing the standard status on failure.
pub(crate) fn min_from_id(node: &Node, id: &str, caller: &str) -> Option<MinPeer> {
    match parse_id(id) {
        Ok(min) => Some(min),
        Err(_) => {
            node.set_status(format!("error bad id ({})", caller));
            None
        }
    }
}

/// Receiver task: one datagram, one envelope, dispatched synchronously.
async fn receiver(node: Arc<Node>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        match node.transport.recv(&mut buf).await {
            Ok(len) => {
                crate::net::processors::process_datagram(&node, &buf[..len]).await;
            }
            Err(err) => {
                node.set_status(format!("error reading: {}", err));
            }
        }
    }
}
