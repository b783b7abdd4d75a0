//! Envelope validation and dispatch.
//!
//! Every received datagram lands here. Envelopes with a routing stamp that
//! are not addressed to us get re-routed (once). Everything else is verified
//! against the sender's sign key before any other work, then dispatched by
//! tag. Failures drop the envelope with a low-priority status; nothing here
//! is fatal.

use super::envelope::{
    Envelope, EnvelopeKind, MessageChat, MessagePing, MessageSuggestionRequest,
    MessageSuggestions, MessageTime, MessageTimePeer, MESSAGE_TYPE_DISCONNECT, MESSAGE_TYPE_PING,
    MESSAGE_TYPE_PULSE,
};
use super::transport::trim_frame;
use crate::crypto;
use crate::node::{min_from_id, Node};
use crate::party::wire::{valid_party_id, PartyEnvelope, PartyInvite, PartyKind};
use crate::types::{now, Chat};
use chrono::SecondsFormat;
use std::sync::Arc;
use std::time::Instant;

/// Entry point for one received datagram.
pub(crate) async fn process_datagram(node: &Arc<Node>, raw: &[u8]) {
    let payload = trim_frame(raw);
    let mut env: Envelope = match serde_json::from_slice(payload) {
        Ok(env) => env,
        Err(_) => {
            node.set_status("invalid json message received");
            return;
        }
    };

    // Routed envelope not addressed to us: we are a relay for it. The stamp
    // set by the first router doubles as the loop-suppression key.
    if let Some(time) = env.time {
        if env.to != node.id() {
            let key = time.to_rfc3339_opts(SecondsFormat::Nanos, true);
            {
                let mut no_reroute = node.no_reroute.lock().unwrap();
                if no_reroute.contains_key(&key) {
                    return;
                }
                no_reroute.insert(key, Instant::now());
            }
            node.route(&mut env).await;
            return;
        }
    }

    match EnvelopeKind::parse(&env.kind) {
        Some(EnvelopeKind::Bootstrap) => process_bootstrap(node, &env).await,
        Some(EnvelopeKind::VerifyBootstrap) => process_verify(node, &env).await,
        Some(EnvelopeKind::Announce) => process_announce(node, &env).await,
        Some(EnvelopeKind::Chat) => process_chat(node, &env).await,
        Some(EnvelopeKind::Disconnect) => process_disconnect(node, &env).await,
        Some(EnvelopeKind::SuggestionRequest) => process_suggestion_request(node, &env).await,
        Some(EnvelopeKind::Suggestions) => process_suggestions(node, &env).await,
        Some(EnvelopeKind::Ping) => process_ping(node, &env).await,
        Some(EnvelopeKind::Pulse) => process_pulse(node, &env).await,
        Some(EnvelopeKind::Party) => process_party(node, &env).await,
        Some(EnvelopeKind::Invite) => process_invite(node, &env).await,
        None => node.chat_status(format!("unknown msg type: {}", env.kind)),
    }
}

/// Check the envelope signature against the sign key embedded in `From`,
/// returning the inner payload bytes.
fn verify_envelope(node: &Node, env: &Envelope, caller: &str) -> Option<Vec<u8>> {
    let min = min_from_id(node, &env.from, caller)?;
    match crypto::verify(&env.data, &min.sign_pub) {
        Ok(inner) => Some(inner.to_vec()),
        Err(_) => {
            node.set_status(format!(
                "questionable message integrity discarding ({})",
                caller
            ));
            None
        }
    }
}

async fn process_bootstrap(node: &Arc<Node>, env: &Envelope) {
    let Some(json) = verify_envelope(node, env, "bs") else {
        return;
    };
    let Ok(payload) = serde_json::from_slice::<MessageTimePeer>(&json) else {
        node.set_status("error invalid json (bs)");
        return;
    };

    let peer = payload.peer;
    if env.from != peer.id() {
        node.set_status("id does not match from (bs)");
        return;
    }

    node.send_verify(&peer).await;
    node.add_peer(peer, payload.time);
}

async fn process_verify(node: &Arc<Node>, env: &Envelope) {
    let Some(json) = verify_envelope(node, env, "bsverify") else {
        return;
    };
    let Ok(payload) = serde_json::from_slice::<MessageTimePeer>(&json) else {
        node.set_status("error invalid json (bsverify)");
        return;
    };

    let peer = payload.peer;
    if env.from != peer.id() {
        node.set_status("id does not match from (bsverify)");
        return;
    }

    node.add_peer(peer.clone(), payload.time);
    node.set_status("verified");
    node.send_announce(&peer).await;
    node.send_suggestion_request(&peer).await;
}

async fn process_announce(node: &Arc<Node>, env: &Envelope) {
    let Some(json) = verify_envelope(node, env, "announce") else {
        return;
    };
    let Ok(payload) = serde_json::from_slice::<MessageTimePeer>(&json) else {
        node.set_status("error invalid json (announce)");
        return;
    };

    let peer = payload.peer;
    let id = peer.id();
    if id == node.id() {
        return;
    }

    // First sight of this id floods the announce onward; the announced flag
    // keeps the flood at-most-once per id, reconnects re-arm it.
    let flags = node.peer_flags(&id);
    let reconnecting = flags.reconnecting(payload.time);
    node.add_peer(peer, payload.time);

    if !flags.announced || reconnecting {
        node.flood(env).await;
        node.cache.lock().unwrap().mark_announced(&id);
    }
}

async fn process_suggestion_request(node: &Arc<Node>, env: &Envelope) {
    let Some(json) = verify_envelope(node, env, "request") else {
        return;
    };
    let Ok(request) = serde_json::from_slice::<MessageSuggestionRequest>(&json) else {
        node.set_status("error invalid json (request)");
        return;
    };

    if request.to != node.id() {
        return;
    }

    let peer = request.peer;
    node.send_suggestions(&peer, &env.data).await;
    node.add_peer(peer, request.time);
}

async fn process_suggestions(node: &Arc<Node>, env: &Envelope) {
    let Some(json) = verify_envelope(node, env, "suggestions") else {
        return;
    };
    let Ok(suggestions) = serde_json::from_slice::<MessageSuggestions>(&json) else {
        node.set_status("error invalid json (suggestions)");
        return;
    };

    // The response must carry a request we signed ourselves; anything else
    // is an amplification attempt.
    if crypto::verify(&suggestions.request_data, &node.min().sign_pub).is_err() {
        node.set_status("error originating req not signed self (suggestions)");
        return;
    }

    node.add_peer(suggestions.peer, suggestions.time);

    for peer in suggestions.suggested_peers {
        let id = peer.id();
        if id == node.id() {
            continue;
        }
        let flags = node.peer_flags(&id);
        if !flags.added && node.would_add(&peer) {
            node.send_suggestion_request(&peer).await;
        }
    }
}

async fn process_chat(node: &Arc<Node>, env: &Envelope) {
    let Some(json) = verify_envelope(node, env, "chat") else {
        return;
    };
    let Ok(chat) = serde_json::from_slice::<MessageChat>(&json) else {
        node.set_status("error invalid json (chat)");
        return;
    };

    if chat.min.id() != env.from {
        node.set_status("error invalid peer (chat)");
        return;
    }

    let unique_id = format!(
        "{}.{}",
        env.from,
        chat.time.to_rfc3339_opts(SecondsFormat::Nanos, true)
    );
    let first_sight = node.seen_chats.lock().unwrap().insert(unique_id);
    if first_sight {
        node.deliver_chat(Chat {
            time: now(),
            id: env.from.clone(),
            channel: String::new(),
            message: chat.message,
        });
        node.flood(env).await;
    }

    node.cache.lock().unwrap().touch(&env.from);
}

async fn process_disconnect(node: &Arc<Node>, env: &Envelope) {
    let Some(json) = verify_envelope(node, env, "disconnect") else {
        return;
    };
    let Ok(message) = serde_json::from_slice::<MessageTime>(&json) else {
        node.set_status("error invalid json (disconnect)");
        return;
    };

    if message.message_type != MESSAGE_TYPE_DISCONNECT {
        node.set_status("error invalid message type (disconnect)");
        return;
    }

    let Some(min) = min_from_id(node, &env.from, "disconnect") else {
        return;
    };
    node.remove_peer(&min.short_id());

    let fresh = node
        .cache
        .lock()
        .unwrap()
        .mark_disconnected(&env.from, message.time);
    if fresh {
        node.flood(env).await;
    }
}

async fn process_ping(node: &Arc<Node>, env: &Envelope) {
    let Some(json) = verify_envelope(node, env, "ping") else {
        return;
    };
    let Ok(ping) = serde_json::from_slice::<MessagePing>(&json) else {
        node.set_status("error invalid json (ping)");
        return;
    };

    if ping.message_type != MESSAGE_TYPE_PING {
        node.set_status("error invalid message type (ping)");
        return;
    }

    node.send_pulse(&ping.min).await;
}

async fn process_pulse(node: &Arc<Node>, env: &Envelope) {
    let Some(json) = verify_envelope(node, env, "pulse") else {
        return;
    };
    let Ok(pulse) = serde_json::from_slice::<MessageTime>(&json) else {
        node.set_status("error invalid json (pulse)");
        return;
    };

    if pulse.message_type != MESSAGE_TYPE_PULSE {
        node.set_status("error invalid message type (pulse)");
        return;
    }

    let Some(min) = min_from_id(node, &env.from, "pulse") else {
        return;
    };
    node.refresh_peer(&min.short_id());
}

async fn process_party(node: &Arc<Node>, env: &Envelope) {
    let Some(min) = min_from_id(node, &env.from, "party") else {
        return;
    };
    let Ok(json) = node.open_from(&min, &env.data) else {
        node.set_status("error invalid crypto (party)");
        return;
    };
    let Ok(party_env) = serde_json::from_slice::<PartyEnvelope>(&json) else {
        node.set_status("error invalid json (party)");
        return;
    };

    let Some(party) = node.party(&party_env.party_id) else {
        node.set_status("error invalid party (party)");
        return;
    };

    let Some(kind) = PartyKind::parse(&party_env.kind) else {
        node.set_status(format!("unknown message type {} (party)", party_env.kind));
        return;
    };

    match kind {
        PartyKind::Advertisement => party.process_advertisement(node, &party_env).await,
        PartyKind::Announce => party.process_announce(node, &party_env).await,
        PartyKind::Chat => party.process_chat(node, &party_env).await,
        PartyKind::Disconnect => party.process_disconnect(node, &party_env).await,
        PartyKind::Request => party.process_request(node, &party_env).await,
        PartyKind::Fulfillment => party.process_fulfillment(node, &party_env).await,
    }

    // Any valid party message from its own author keeps that member current.
    if env.from == party_env.from && kind != PartyKind::Disconnect {
        party.insert_member(&env.from);
    }
}

async fn process_invite(node: &Arc<Node>, env: &Envelope) {
    let Some(min) = min_from_id(node, &env.from, "invite") else {
        return;
    };
    let Ok(json) = node.open_from(&min, &env.data) else {
        node.set_status("error invalid crypto (invite)");
        return;
    };
    let Ok(invite) = serde_json::from_slice::<PartyInvite>(&json) else {
        node.set_status("error invalid json (invite)");
        return;
    };

    if !valid_party_id(&invite.id) {
        node.set_status("error invalid party id (invite)");
        return;
    }

    let id = invite.id.clone();
    if node.record_pending_invite(invite) {
        node.chat_status(format!("invite received for {}", id));
    } else {
        node.set_status(format!("reinvite ignored for {}", id));
    }
}
