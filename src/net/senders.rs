//! Routing primitives and mainline senders.
//!
//! `route` is a greedy XOR forwarder: stamp the envelope, pick up to three
//! bucket entries near the target, and hand the envelope only to peers
//! strictly closer to it than we are. `flood` sends to every distinct peer in
//! the table once; per-kind dedup at the receivers keeps floods at-most-once
//! per id.

use super::envelope::{
    Envelope, EnvelopeKind, MessageChat, MessagePing, MessageSuggestionRequest,
    MessageSuggestions, MessageTime, MessageTimePeer, MESSAGE_TYPE_DISCONNECT, MESSAGE_TYPE_PING,
    MESSAGE_TYPE_PULSE,
};
use super::identity::{id_front, short_id_bytes, MinPeer, Peer};
use super::routing::{distance, ideal_table};
use crate::node::{Node, NodeError};
use crate::types::now;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Fan-out of the greedy forwarder.
const ROUTE_FANOUT: usize = 3;

/// Suggestion responses are capped here; ~300 bytes per encoded peer keeps
/// the envelope well under the UDP ceiling.
const MAX_SUGGESTED_PEERS: usize = 128;

const PING_INTERVAL: Duration = Duration::from_secs(30);

impl Node {
    /// Forward `env` toward `env.to`, stamping the routing time on first
    /// touch. Only peers that make XOR progress receive a copy.
    pub(crate) async fn route(&self, env: &mut Envelope) {
        if env.time.is_none() {
            env.time = Some(now());
        }

        let Ok(short) = id_front(&env.to) else {
            self.set_status("error bad id (route)");
            return;
        };
        let Ok(target) = short_id_bytes(&short) else {
            return;
        };
        let Ok(self_short) = short_id_bytes(&self.short_id()) else {
            return;
        };
        let self_dist = distance(&self_short, &target);

        let closest = {
            let table = self.table.lock().unwrap();
            table.find_closest_n(&target, ROUTE_FANOUT)
        };
        for entry in closest {
            if distance(&entry.peer.sign_pub, &target) < self_dist {
                self.transport.send_to_peer(&entry.peer, env).await;
            }
        }
    }

    /// Send `env` to every distinct peer in the table once.
    pub(crate) async fn flood(&self, env: &Envelope) {
        let peers = self.table.lock().unwrap().unique_peers();
        for peer in peers {
            self.transport.send_to_peer(&peer, env).await;
        }
    }

    /// Dial a bootstrap target from an `ip/port/short_id` url.
    pub async fn send_bootstrap(&self, url: &str) -> Result<(), NodeError> {
        let mut parts = url.split('/');
        let (Some(host), Some(port), Some(short_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(NodeError::InvalidBootstrapUrl);
        };
        if parts.next().is_some() || port.parse::<u16>().is_err() {
            return Err(NodeError::InvalidBootstrapUrl);
        }
        short_id_bytes(short_id).map_err(|_| NodeError::InvalidBootstrapUrl)?;

        let payload = MessageTimePeer {
            peer: self.peer_self(),
            time: now(),
        };
        let json = serde_json::to_vec(&payload).expect("bootstrap payload encodes");
        let env = Envelope::new(
            EnvelopeKind::Bootstrap,
            self.id(),
            // Only the short id is known at bootstrap time.
            short_id.to_string(),
            self.sign(&json),
        );
        self.transport
            .send_to_address(&format!("{}:{}", host, port), &env)
            .await;
        self.set_status("bs sent");
        Ok(())
    }

    /// Symmetric half of the bootstrap handshake, straight back to the peer.
    pub(crate) async fn send_verify(&self, peer: &Peer) {
        let payload = MessageTimePeer {
            peer: self.peer_self(),
            time: now(),
        };
        let json = serde_json::to_vec(&payload).expect("verify payload encodes");
        let env = Envelope::new(
            EnvelopeKind::VerifyBootstrap,
            self.id(),
            peer.id(),
            self.sign(&json),
        );
        self.transport.send_to_peer(peer, &env).await;
        self.set_status("verify sent");
    }

    /// Tell one peer about ourselves; it floods the announce onward.
    pub(crate) async fn send_announce(&self, peer: &Peer) {
        let payload = MessageTimePeer {
            peer: self.peer_self(),
            time: now(),
        };
        let json = serde_json::to_vec(&payload).expect("announce payload encodes");
        let env = Envelope::new(
            EnvelopeKind::Announce,
            self.id(),
            String::new(),
            self.sign(&json),
        );
        self.transport.send_to_peer(peer, &env).await;
        self.set_status("announce sent");
    }

    /// Ask `peer` for peers close to our ideal bucket slots.
    pub(crate) async fn send_suggestion_request(&self, peer: &Peer) {
        let request = MessageSuggestionRequest {
            peer: self.peer_self(),
            to: peer.id(),
            time: now(),
        };
        let json = serde_json::to_vec(&request).expect("suggestion request encodes");
        let env = Envelope::new(
            EnvelopeKind::SuggestionRequest,
            self.id(),
            peer.id(),
            self.sign(&json),
        );
        self.transport.send_to_peer(peer, &env).await;
        self.set_status("suggestion request sent");
    }

    /// Answer a suggestion request: for each of the requester's 256 ideal
    /// slots, offer our closest entry. The original signed request rides
    /// along so the requester can prove it asked.
    pub(crate) async fn send_suggestions(&self, peer: &Peer, request_data: &[u8]) {
        let ideals = ideal_table(&peer.sign_pub);
        let mut seen = HashSet::new();
        let mut suggested = Vec::new();
        {
            let table = self.table.lock().unwrap();
            for ideal in &ideals {
                let Some(entry) = table.find_closest(ideal) else {
                    continue;
                };
                if entry.peer.sign_pub == peer.sign_pub {
                    continue;
                }
                if seen.insert(entry.peer.id()) {
                    suggested.push(entry.peer.clone());
                }
                if suggested.len() >= MAX_SUGGESTED_PEERS {
                    break;
                }
            }
        }

        let suggestions = MessageSuggestions {
            peer: self.peer_self(),
            request_data: request_data.to_vec(),
            suggested_peers: suggested,
            time: now(),
        };
        let json = serde_json::to_vec(&suggestions).expect("suggestions encode");
        let env = Envelope::new(
            EnvelopeKind::Suggestions,
            self.id(),
            peer.id(),
            self.sign(&json),
        );
        self.transport.send_to_peer(peer, &env).await;
    }

    /// Flood a signed chat line on the mainline channel.
    pub async fn send_chat(&self, message: &str) {
        if !self.have_peers() {
            self.chat_status("you have no friends, bootstrap to a peer to get started");
            return;
        }

        let chat = MessageChat {
            min: self.min(),
            message: message.to_string(),
            time: now(),
        };
        let json = serde_json::to_vec(&chat).expect("chat payload encodes");
        let env = Envelope::new(
            EnvelopeKind::Chat,
            self.id(),
            String::new(),
            self.sign(&json),
        );
        self.flood(&env).await;
        self.set_status("chat sent");
    }

    /// Flood a signed goodbye; receivers drop us from their tables.
    pub async fn send_disconnect(&self) {
        let disconnect = MessageTime {
            message_type: MESSAGE_TYPE_DISCONNECT,
            time: now(),
        };
        let json = serde_json::to_vec(&disconnect).expect("disconnect payload encodes");
        let env = Envelope::new(
            EnvelopeKind::Disconnect,
            self.id(),
            String::new(),
            self.sign(&json),
        );
        self.flood(&env).await;
        self.set_status("disconnect sent");
    }

    /// Answer a ping, routed back to its sender.
    pub(crate) async fn send_pulse(&self, min: &MinPeer) {
        let pulse = MessageTime {
            message_type: MESSAGE_TYPE_PULSE,
            time: now(),
        };
        let json = serde_json::to_vec(&pulse).expect("pulse payload encodes");
        let mut env = Envelope::new(
            EnvelopeKind::Pulse,
            self.id(),
            min.id(),
            self.sign(&json),
        );
        self.route(&mut env).await;
    }
}

/// Pinger task: every 30 seconds sweep stale table entries, prune the dedup
/// sets, and broadcast a signed liveness ping.
pub(crate) async fn pinger(node: Arc<Node>) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;

        let (removed, now_empty) = {
            let mut table = node.table.lock().unwrap();
            let removed = table.remove_stale();
            (removed, table.is_empty())
        };
        if removed > 0 {
            node.set_status("removed stale peer");
            if now_empty {
                node.note_table_empty();
            }
        }

        node.prune_dedup_sets();

        let ping = MessagePing {
            min: node.min(),
            message_type: MESSAGE_TYPE_PING,
            time: now(),
        };
        let json = serde_json::to_vec(&ping).expect("ping payload encodes");
        let env = Envelope::new(
            EnvelopeKind::Ping,
            node.id(),
            String::new(),
            node.sign(&json),
        );
        node.flood(&env).await;
    }
}
