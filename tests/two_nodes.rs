//! End-to-end tests: live nodes on localhost UDP ports.
//!
//! Run with: cargo test --test two_nodes -- --nocapture

use partyline::crypto::sha256_hex;
use partyline::files::{
    self, build_block_lookup, calculate_chain, has_bit, sha256_file, sha256_pack, FileSummary,
    PackState, PackSummary,
};
use partyline::net::envelope::{Envelope, EnvelopeKind};
use partyline::net::identity::{parse_id, Identity};
use partyline::party::wire::{
    PartyAdvertisement, PartyEnvelope, PartyFulfillment, PartyKind,
};
use partyline::types::now;
use partyline::{Node, NodeConfig, NodeEvents};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DEADLINE: Duration = Duration::from_secs(60);

const EICAR: &str = r"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

async fn start_node(port: u16) -> (Arc<Node>, NodeEvents, TempDir) {
    let share = tempfile::tempdir().unwrap();
    let config =
        NodeConfig::new(format!("127.0.0.1:{}", port), port).with_shared_dir(share.path());
    let (node, events) = Node::start(config).await.unwrap();
    (node, events, share)
}

async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < DEADLINE {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Bootstrap `b` into `a` and wait until both caches show the add.
async fn connect(a: &Arc<Node>, b: &Arc<Node>) {
    b.send_bootstrap(&a.bootstrap_url()).await.unwrap();
    let (a2, b2) = (a.clone(), b.clone());
    assert!(
        wait_for(move || {
            a2.peer_flags(&b2.id()).added && b2.peer_flags(&a2.id()).added
        })
        .await,
        "bootstrap did not converge"
    );
}

/// Create a party on `a`, invite `b`, accept, and wait for both member lists.
async fn form_party(a: &Arc<Node>, b: &Arc<Node>) -> String {
    let party_id = a.party_start("coolname").unwrap();
    assert_eq!(party_id.len(), 32);
    let party_a = a.party(&party_id).unwrap();
    party_a.send_invite(a, &b.min()).await;

    let (b2, id2) = (b.clone(), party_id.clone());
    assert!(
        wait_for(move || b2.pending_invite_ids().contains(&id2)).await,
        "invite never arrived"
    );

    b.accept_invite(&party_id).await;
    let (a2, b2, id2) = (a.clone(), b.clone(), party_id.clone());
    assert!(
        wait_for(move || {
            let Some(party) = a2.party(&id2) else {
                return false;
            };
            party.contains_member(&a2.id()) && party.contains_member(&b2.id())
        })
        .await,
        "membership did not converge"
    );
    party_id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bootstrap_and_mainline_chat() {
    let (a, mut events_a, _share_a) = start_node(42110).await;
    let (b, mut events_b, _share_b) = start_node(42111).await;
    connect(&a, &b).await;

    b.send_chat("你好").await;

    let chat_b = tokio::time::timeout(DEADLINE, events_b.chat.recv())
        .await
        .expect("sender sink timed out")
        .unwrap();
    assert_eq!(chat_b.message, "你好");
    assert_eq!(chat_b.channel, "");
    assert_eq!(chat_b.id, b.id());

    let chat_a = tokio::time::timeout(DEADLINE, events_a.chat.recv())
        .await
        .expect("receiver sink timed out")
        .unwrap();
    assert_eq!(chat_a.message, "你好");
    assert_eq!(chat_a.channel, "");
    assert_eq!(chat_a.id, b.id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn party_invite_accept_and_chat() {
    let (a, mut events_a, _share_a) = start_node(42120).await;
    let (b, mut events_b, _share_b) = start_node(42121).await;
    connect(&a, &b).await;

    let party_id = form_party(&a, &b).await;

    let party_b = b.party(&party_id).unwrap();
    party_b.send_chat(&b, "encrypted lol").await;

    let chat_a = tokio::time::timeout(DEADLINE, events_a.chat.recv())
        .await
        .expect("a sink timed out")
        .unwrap();
    assert_eq!(chat_a.message, "encrypted lol");
    assert_eq!(chat_a.channel, party_id);

    let chat_b = tokio::time::timeout(DEADLINE, events_b.chat.recv())
        .await
        .expect("b sink timed out")
        .unwrap();
    assert_eq!(chat_b.message, "encrypted lol");
    assert_eq!(chat_b.channel, party_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pack_advertisement_and_transfer() {
    let (a, _events_a, share_a) = start_node(42130).await;
    let (b, _events_b, share_b) = start_node(42131).await;
    connect(&a, &b).await;
    let party_id = form_party(&a, &b).await;

    // Author a pack on a: one small file, one spanning several blocks.
    let party_dir_a = share_a.path().join(&party_id);
    fs::create_dir_all(&party_dir_a).unwrap();
    fs::write(
        party_dir_a.join("test.pack"),
        br#"{"name":"test.pack","files":["test.file","big.file"]}"#,
    )
    .unwrap();
    fs::write(party_dir_a.join("test.file"), EICAR.as_bytes()).unwrap();
    let big: Vec<u8> = (0..(partyline::BLOCK_SIZE * 3 + 77))
        .map(|i| (i % 251) as u8)
        .collect();
    fs::write(party_dir_a.join("big.file"), &big).unwrap();

    a.rescan_packs().await;

    let party_a = a.party(&party_id).unwrap();
    let hashes = party_a.pack_hashes();
    assert_eq!(hashes.len(), 1, "a should hold exactly one pack");
    let pack_hash = hashes[0].clone();
    assert_eq!(party_a.pack_state(&pack_hash), Some(PackState::Complete));

    // The advertisement reaches b as AVAILABLE.
    let (b2, id2, hash2) = (b.clone(), party_id.clone(), pack_hash.clone());
    assert!(
        wait_for(move || {
            b2.party(&id2)
                .and_then(|party| party.pack_state(&hash2))
                .is_some_and(|state| state == PackState::Available)
        })
        .await,
        "advertisement never arrived"
    );

    let party_b = b.party(&party_id).unwrap();
    party_b.start_pack(&b, &pack_hash).await;
    assert_eq!(party_b.pack_state(&pack_hash), Some(PackState::Active));

    let (b2, id2, hash2) = (b.clone(), party_id.clone(), pack_hash.clone());
    assert!(
        wait_for(move || {
            b2.party(&id2)
                .and_then(|party| party.pack_state(&hash2))
                .is_some_and(|state| state == PackState::Complete)
        })
        .await,
        "transfer did not complete"
    );

    let got_small = fs::read(share_b.path().join(&party_id).join("test.file")).unwrap();
    assert_eq!(got_small, EICAR.as_bytes());
    let got_big = fs::read(share_b.path().join(&party_id).join("big.file")).unwrap();
    assert_eq!(got_big, big);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_propagation() {
    let (a, _events_a, _share_a) = start_node(42140).await;
    let (b, _events_b, _share_b) = start_node(42141).await;
    connect(&a, &b).await;
    let party_id = form_party(&a, &b).await;

    a.disconnect_parties().await;
    a.send_disconnect().await;

    let (b2, a_id) = (b.clone(), a.id());
    assert!(
        wait_for(move || b2.peer_flags(&a_id).disconnected).await,
        "disconnect flag never set"
    );
    let b2 = b.clone();
    assert!(
        wait_for(move || !b2.have_peers()).await,
        "a still present in b's table"
    );
    let (b2, id2, a_id) = (b.clone(), party_id.clone(), a.id());
    assert!(
        wait_for(move || {
            b2.party(&id2)
                .map(|party| !party.contains_member(&a_id))
                .unwrap_or(false)
        })
        .await,
        "a still in party member list"
    );
}

/// Forged fulfillments: right data hash with flipped bytes, and a bad
/// forward-chain link. Both must be dropped without touching disk.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forged_fulfillment_is_rejected() {
    let (b, _events_b, share_b) = start_node(42150).await;
    let party_id = b.party_start("forged").unwrap();
    let b_min = parse_id(&b.id()).unwrap();

    let attacker = Identity::generate("127.0.0.1:45999".into());
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target: std::net::SocketAddr = format!("127.0.0.1:{}", b.local_port())
        .parse()
        .unwrap();

    let send_party_env = |kind: PartyKind, signed: Vec<u8>| {
        let party_env = PartyEnvelope::new(kind, attacker.id(), party_id.clone(), signed);
        let sealed = attacker.seal(&serde_json::to_vec(&party_env).unwrap(), &b_min.enc_pub);
        let env = Envelope::new(EnvelopeKind::Party, attacker.id(), b.id(), sealed);
        let mut frame = serde_json::to_vec(&env).unwrap();
        frame.push(b'\n');
        frame
    };

    // The attacker authors a real file so the pack hash and chain are valid.
    let content = vec![0x5au8; 4096];
    let scratch = tempfile::tempdir().unwrap();
    let content_path = scratch.path().join("test.file");
    fs::write(&content_path, &content).unwrap();
    let mut content_file = fs::File::open(&content_path).unwrap();
    let file_hash = sha256_file(&mut content_file).unwrap();
    let (first_block_hash, block_map) =
        calculate_chain(&mut content_file, content.len() as u64).unwrap();
    let lookup = build_block_lookup(&block_map, &first_block_hash);

    let summary = PackSummary {
        name: "test.pack".into(),
        files: vec![FileSummary {
            name: "test.file".into(),
            hash: file_hash.clone(),
            first_block_hash: first_block_hash.clone(),
            size: content.len() as u64,
        }],
    };
    let pack_hash = sha256_pack(&summary);

    let ad = PartyAdvertisement {
        peer_id: attacker.id(),
        party_id: party_id.clone(),
        time: now(),
        hash: pack_hash.clone(),
        pack: summary,
    };
    let frame = send_party_env(
        PartyKind::Advertisement,
        attacker.sign(&serde_json::to_vec(&ad).unwrap()),
    );
    socket.send_to(&frame, target).await.unwrap();

    let (b2, id2, hash2) = (b.clone(), party_id.clone(), pack_hash.clone());
    assert!(
        wait_for(move || {
            b2.party(&id2)
                .and_then(|party| party.pack_state(&hash2))
                .is_some()
        })
        .await,
        "forged-party ad never landed"
    );

    let party_b = b.party(&party_id).unwrap();
    party_b.start_pack(&b, &pack_hash).await;
    let on_disk = share_b.path().join(&party_id).join("test.file");
    assert_eq!(fs::metadata(&on_disk).unwrap().len(), content.len() as u64);

    let legit_block = block_map[&lookup[&0]].with_data(content.clone());
    assert_eq!(sha256_hex(&legit_block.data), legit_block.data_hash);

    // Forgery 1: flipped data under the original data hash.
    let mut flipped = legit_block.clone();
    flipped.data[0] ^= 0xff;
    // Forgery 2: intact data, corrupted forward link (changes the block's
    // identity, so it no longer matches the first-block hash).
    let mut bad_link = legit_block.clone();
    bad_link.next_block_hash = sha256_hex(b"nope");

    for forged in [flipped, bad_link] {
        let fulfillment = PartyFulfillment {
            peer_id: attacker.id(),
            pack_hash: pack_hash.clone(),
            file_hash: file_hash.clone(),
            party_id: party_id.clone(),
            block: forged,
        };
        let frame = send_party_env(
            PartyKind::Fulfillment,
            attacker.sign(&serde_json::to_vec(&fulfillment).unwrap()),
        );
        socket.send_to(&frame, target).await.unwrap();
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    let pack_arc = party_b.pack(&pack_hash).unwrap();
    {
        let pack = pack_arc.lock().unwrap();
        assert!(
            !has_bit(&pack.files[0].coverage, 0),
            "forged block set the coverage bit"
        );
    }
    assert_eq!(
        fs::read(&on_disk).unwrap(),
        vec![0u8; content.len()],
        "forged block reached disk"
    );

    // The genuine block is accepted through the same path.
    let fulfillment = PartyFulfillment {
        peer_id: attacker.id(),
        pack_hash: pack_hash.clone(),
        file_hash: file_hash.clone(),
        party_id: party_id.clone(),
        block: legit_block,
    };
    let frame = send_party_env(
        PartyKind::Fulfillment,
        attacker.sign(&serde_json::to_vec(&fulfillment).unwrap()),
    );
    socket.send_to(&frame, target).await.unwrap();

    let pack_arc2 = pack_arc.clone();
    assert!(
        wait_for(move || has_bit(&pack_arc2.lock().unwrap().files[0].coverage, 0)).await,
        "genuine block was not accepted"
    );
    assert_eq!(fs::read(&on_disk).unwrap(), content);
}

/// A `.pending` snapshot left by an interrupted download is restored ACTIVE
/// on the next pack scan.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pending_pack_resumes_on_rescan() {
    let (node, _events, share) = start_node(42160).await;
    let party_id = node.party_start("resume").unwrap();

    let party_dir = share.path().join(&party_id);
    fs::create_dir_all(&party_dir).unwrap();

    let pending = files::PendingPack {
        name: "test.pack".into(),
        hash: "deadbeef".repeat(8),
        files: vec![files::PackFileInfo {
            name: "test.file".into(),
            hash: "f".repeat(64),
            first_block_hash: "b".repeat(64),
            size: partyline::BLOCK_SIZE * 2,
            block_map: Default::default(),
            block_lookup: Default::default(),
            coverage: files::empty_coverage(partyline::BLOCK_SIZE * 2),
            path: party_dir.join("test.file").to_string_lossy().into_owned(),
        }],
    };
    fs::write(
        party_dir.join("test.pack.pending"),
        serde_json::to_vec(&pending).unwrap(),
    )
    .unwrap();

    node.rescan_packs().await;

    let party = node.party(&party_id).unwrap();
    assert_eq!(
        party.pack_state(&"deadbeef".repeat(8)),
        Some(PackState::Active)
    );
}
