//! The content-addressed pack/block model.
//!
//! A pack is a set of files shared as a unit inside one party. Files are cut
//! into blocks of at most [`BLOCK_SIZE`] bytes. Each block names its
//! successor by hash (the forward chain) and its two skip-tree children
//! (`2i+1`, `2i+2`), so a downloader can verify a block the moment it holds
//! either the predecessor or the tree parent. Per-file coverage bitmaps track
//! which blocks have been verified and persisted.

use crate::crypto::sha256_hex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fixed transport unit. The last block of a file may be shorter.
pub const BLOCK_SIZE: u64 = 10240;

/// Zero pre-extension writes this many bytes per chunk.
const ZERO_CHUNK: u64 = 100 * 1024 * 1000;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest names no files")]
    EmptyManifest,
    #[error("path escapes the party directory")]
    Traversal,
    #[error("block chain failed forward verification at index {0}")]
    ChainVerify(u64),
    #[error("block {0} missing from lookup")]
    UnknownBlock(u64),
    #[error("block data does not match its recorded hash")]
    DataMismatch,
}

// =============================================================================
// MANIFESTS
// =============================================================================

/// A `<name>.pack` manifest: the unit the sharing user authors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DotPack {
    pub name: String,
    pub files: Vec<String>,
}

// =============================================================================
// BLOCKS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockInfo {
    pub index: u64,
    pub next_block_hash: String,
    pub left_block_hash: String,
    pub right_block_hash: String,
    pub data_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Block {
    pub index: u64,
    pub next_block_hash: String,
    pub left_block_hash: String,
    pub right_block_hash: String,
    #[serde(with = "crate::net::envelope::b64")]
    pub data: Vec<u8>,
    pub data_hash: String,
}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            index: self.index,
            next_block_hash: self.next_block_hash.clone(),
            left_block_hash: self.left_block_hash.clone(),
            right_block_hash: self.right_block_hash.clone(),
            data_hash: self.data_hash.clone(),
        }
    }
}

impl BlockInfo {
    pub fn with_data(&self, data: Vec<u8>) -> Block {
        Block {
            index: self.index,
            next_block_hash: self.next_block_hash.clone(),
            left_block_hash: self.left_block_hash.clone(),
            right_block_hash: self.right_block_hash.clone(),
            data_hash: self.data_hash.clone(),
            data,
        }
    }
}

/// A block's identity covers every header field plus the data itself.
pub fn sha256_block(block: &Block) -> String {
    sha256_block_fields(
        block.index,
        &block.next_block_hash,
        &block.left_block_hash,
        &block.right_block_hash,
        &block.data_hash,
        &block.data,
    )
}

fn sha256_block_fields(
    index: u64,
    next: &str,
    left: &str,
    right: &str,
    data_hash: &str,
    data: &[u8],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(index.to_string().as_bytes());
    hasher.update(next.as_bytes());
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hasher.update(data_hash.as_bytes());
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// =============================================================================
// SKIP TREE
// =============================================================================

pub fn left_child(i: u64) -> u64 {
    2 * i + 1
}

pub fn right_child(i: u64) -> u64 {
    2 * i + 2
}

/// Parent of `i` in the index tree; `i` must be non-zero.
pub fn tree_parent(i: u64) -> u64 {
    if i % 2 == 1 {
        (i - 1) / 2
    } else {
        (i - 2) / 2
    }
}

// =============================================================================
// COVERAGE BITMAPS
// =============================================================================

/// Blocks in a file of `size` bytes. A zero-size file has no transferable
/// blocks (its chain still defines one empty block for the first-block hash).
pub fn block_count(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE)
}

fn coverage_words(size: u64) -> usize {
    block_count(size).div_ceil(64) as usize
}

pub fn empty_coverage(size: u64) -> Vec<u64> {
    vec![0; coverage_words(size)]
}

pub fn full_coverage(size: u64) -> Vec<u64> {
    let blocks = block_count(size);
    let mut coverage = vec![0u64; coverage_words(size)];
    for i in 0..blocks {
        coverage[(i / 64) as usize] |= 1 << (i % 64);
    }
    coverage
}

pub fn is_empty_coverage(coverage: &[u64]) -> bool {
    coverage.iter().all(|word| *word == 0)
}

pub fn is_full_coverage(size: u64, coverage: &[u64]) -> bool {
    let full = full_coverage(size);
    coverage.len() == full.len() && coverage == full.as_slice()
}

pub fn has_bit(coverage: &[u64], i: u64) -> bool {
    coverage
        .get((i / 64) as usize)
        .is_some_and(|word| (word >> (i % 64)) & 1 == 1)
}

pub fn set_bit(coverage: &mut [u64], i: u64) {
    if let Some(word) = coverage.get_mut((i / 64) as usize) {
        *word |= 1 << (i % 64);
    }
}

// =============================================================================
// PACKS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackState {
    /// Advertised by a peer; nothing on disk yet.
    Available,
    /// Download in progress; on-disk file pre-extended.
    Active,
    /// Every file fully covered, or scanned from the local share tree.
    Complete,
}

/// One file inside a pack, with the runtime transfer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PackFileInfo {
    pub name: String,
    pub hash: String,
    pub first_block_hash: String,
    pub size: u64,
    #[serde(default)]
    pub block_map: HashMap<String, BlockInfo>,
    #[serde(default)]
    pub block_lookup: HashMap<u64, String>,
    #[serde(default)]
    pub coverage: Vec<u64>,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct Pack {
    pub name: String,
    pub state: PackState,
    pub files: Vec<PackFileInfo>,
    /// Last advertisement time per peer id, for churn damping.
    pub peers: HashMap<String, DateTime<Utc>>,
}

impl Pack {
    pub fn file(&self, file_hash: &str) -> Option<&PackFileInfo> {
        self.files.iter().find(|file| file.hash == file_hash)
    }

    pub fn file_mut(&mut self, file_hash: &str) -> Option<&mut PackFileInfo> {
        self.files.iter_mut().find(|file| file.hash == file_hash)
    }

    pub fn is_fully_covered(&self) -> bool {
        self.files
            .iter()
            .all(|file| is_full_coverage(file.size, &file.coverage))
    }

    /// The identity-bearing projection that travels in advertisements.
    pub fn summary(&self) -> PackSummary {
        PackSummary {
            name: self.name.clone(),
            files: self
                .files
                .iter()
                .map(|file| FileSummary {
                    name: file.name.clone(),
                    hash: file.hash.clone(),
                    first_block_hash: file.first_block_hash.clone(),
                    size: file.size,
                })
                .collect(),
        }
    }

    /// Build a fresh AVAILABLE pack from an advertisement. Runtime state the
    /// sender may have implied is discarded; an ad is not evidence of blocks.
    pub fn from_summary(summary: &PackSummary) -> Self {
        let mut files: Vec<PackFileInfo> = summary
            .files
            .iter()
            .map(|file| PackFileInfo {
                name: file.name.clone(),
                hash: file.hash.clone(),
                first_block_hash: file.first_block_hash.clone(),
                size: file.size,
                block_map: HashMap::new(),
                block_lookup: HashMap::new(),
                coverage: Vec::new(),
                path: String::new(),
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Pack {
            name: summary.name.clone(),
            state: PackState::Available,
            files,
            peers: HashMap::new(),
        }
    }

    /// Bind each file to its on-disk location under `base_dir`, skipping any
    /// name that escapes it.
    pub fn set_paths(&mut self, base_dir: &Path) {
        for file in &mut self.files {
            match normalize_within(&base_dir.join(&file.name), base_dir) {
                Some(path) => file.path = path.to_string_lossy().into_owned(),
                None => tracing::warn!(
                    "file {} in pack {} traverses directories",
                    file.name,
                    self.name
                ),
            }
        }
    }
}

/// Wire/identity form of a pack: name plus per-file summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PackSummary {
    pub name: String,
    pub files: Vec<FileSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileSummary {
    pub name: String,
    pub hash: String,
    pub first_block_hash: String,
    pub size: u64,
}

/// Content identifier of a pack. Stable under input ordering: files are
/// hashed sorted by name.
pub fn sha256_pack(summary: &PackSummary) -> String {
    let mut files: Vec<&FileSummary> = summary.files.iter().collect();
    files.sort_by(|a, b| a.name.cmp(&b.name));

    let mut hasher = Sha256::new();
    hasher.update(summary.name.as_bytes());
    for file in files {
        hasher.update(file.name.as_bytes());
        hasher.update(file.hash.as_bytes());
        hasher.update(file.first_block_hash.as_bytes());
        hasher.update(file.size.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// On-disk snapshot of an in-progress download, for resume after restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PendingPack {
    pub name: String,
    pub hash: String,
    pub files: Vec<PackFileInfo>,
}

// =============================================================================
// CHAIN CONSTRUCTION
// =============================================================================

/// Build the block chain for an on-disk file, reading backwards so every
/// block can name its successor and skip-tree children, then re-read forward
/// and confirm each recomputed hash. Returns the hash of block 0 and the
/// full block map.
pub fn calculate_chain(
    file: &mut File,
    size: u64,
) -> Result<(String, HashMap<String, BlockInfo>), FileError> {
    let mut block_map = HashMap::new();
    let mut hash_at: HashMap<u64, String> = HashMap::new();

    if size == 0 {
        // A single well-defined empty block anchors the first-block hash;
        // coverage for a zero-size file is zero-length and already full.
        let data_hash = sha256_hex(&[]);
        let hash = sha256_block_fields(0, "", "", "", &data_hash, &[]);
        block_map.insert(
            hash.clone(),
            BlockInfo {
                index: 0,
                next_block_hash: String::new(),
                left_block_hash: String::new(),
                right_block_hash: String::new(),
                data_hash,
            },
        );
        return Ok((hash, block_map));
    }

    let last_index = block_count(size) - 1;
    for index in (0..=last_index).rev() {
        let data = read_block_at(file, index, size)?;
        let data_hash = sha256_hex(&data);
        let next = hash_at.get(&(index + 1)).cloned().unwrap_or_default();
        let left = hash_at.get(&left_child(index)).cloned().unwrap_or_default();
        let right = hash_at.get(&right_child(index)).cloned().unwrap_or_default();
        let hash = sha256_block_fields(index, &next, &left, &right, &data_hash, &data);
        block_map.insert(
            hash.clone(),
            BlockInfo {
                index,
                next_block_hash: next,
                left_block_hash: left,
                right_block_hash: right,
                data_hash,
            },
        );
        hash_at.insert(index, hash);
    }

    let first_block_hash = hash_at.remove(&0).expect("block 0 built");

    // Forward verification: every link must reproduce the hash it was
    // reached by.
    let mut current = first_block_hash.clone();
    for index in 0..=last_index {
        let info = block_map
            .get(&current)
            .cloned()
            .ok_or(FileError::ChainVerify(index))?;
        let data = read_block_at(file, index, size)?;
        let data_hash = sha256_hex(&data);
        let recomputed = sha256_block_fields(
            index,
            &info.next_block_hash,
            &info.left_block_hash,
            &info.right_block_hash,
            &data_hash,
            &data,
        );
        if info.index != index || data_hash != info.data_hash || recomputed != current {
            return Err(FileError::ChainVerify(index));
        }
        current = info.next_block_hash;
    }
    if !current.is_empty() {
        return Err(FileError::ChainVerify(last_index));
    }

    Ok((first_block_hash, block_map))
}

fn read_block_at(file: &mut File, index: u64, size: u64) -> Result<Vec<u8>, FileError> {
    let offset = index * BLOCK_SIZE;
    let len = (size - offset).min(BLOCK_SIZE) as usize;
    file.seek(SeekFrom::Start(offset))?;
    let mut data = vec![0u8; len];
    file.read_exact(&mut data)?;
    Ok(data)
}

/// Walk the forward chain to index every block hash by position.
pub fn build_block_lookup(
    block_map: &HashMap<String, BlockInfo>,
    first_block_hash: &str,
) -> HashMap<u64, String> {
    let mut lookup = HashMap::new();
    let mut current = first_block_hash.to_string();
    let mut index = 0u64;
    while !current.is_empty() {
        let next = match block_map.get(&current) {
            Some(info) => info.next_block_hash.clone(),
            None => break,
        };
        lookup.insert(index, current);
        current = next;
        index += 1;
    }
    lookup
}

/// Streamed SHA-256 of a whole file.
pub fn sha256_file(file: &mut File) -> Result<String, FileError> {
    file.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Re-read a single held block from disk and re-check its data hash before
/// serving it to a peer.
pub fn read_verified_block(path: &Path, info: &BlockInfo) -> Result<Block, FileError> {
    let mut file = File::open(path)?;
    let mut data = vec![0u8; BLOCK_SIZE as usize];
    file.seek(SeekFrom::Start(info.index * BLOCK_SIZE))?;
    let mut filled = 0;
    while filled < data.len() {
        let n = file.read(&mut data[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    data.truncate(filled);

    if sha256_hex(&data) != info.data_hash {
        return Err(FileError::DataMismatch);
    }
    Ok(info.with_data(data))
}

// =============================================================================
// SHARE DIRECTORY
// =============================================================================

/// Resolve the share root, defaulting to `$HOME/party-line`, and make sure it
/// exists.
pub fn init_shared_dir(configured: Option<&Path>) -> Result<PathBuf, FileError> {
    let dir = match configured {
        Some(dir) => dir.to_path_buf(),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("party-line"),
    };
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Lexically normalize `candidate` (resolving `.` and `..`) and return it
/// only if it stays inside `base`.
fn normalize_within(candidate: &Path, base: &Path) -> Option<PathBuf> {
    let mut normal = PathBuf::new();
    for component in candidate.components() {
        match component {
            std::path::Component::ParentDir => {
                if !normal.pop() {
                    return None;
                }
            }
            std::path::Component::CurDir => {}
            other => normal.push(other),
        }
    }
    normal.starts_with(base).then_some(normal)
}

/// Build a COMPLETE pack from one `.pack` manifest: hash every referenced
/// file and construct its block chain.
pub fn build_pack(
    shared_dir: &Path,
    party_id: &str,
    manifest_path: &Path,
    self_id: &str,
) -> Result<(String, Pack), FileError> {
    let party_dir = shared_dir.join(party_id);

    let contents = fs::read(manifest_path)?;
    let dot_pack: DotPack = serde_json::from_slice(&contents)?;
    if dot_pack.files.is_empty() {
        return Err(FileError::EmptyManifest);
    }

    let manifest_dir = manifest_path.parent().unwrap_or(&party_dir).to_path_buf();

    let mut files = Vec::new();
    for short_path in &dot_pack.files {
        let shared_path = normalize_within(&manifest_dir.join(short_path), &party_dir)
            .ok_or(FileError::Traversal)?;

        let mut file = File::open(&shared_path)?;
        let size = file.metadata()?.len();
        let hash = sha256_file(&mut file)?;
        let (first_block_hash, block_map) = calculate_chain(&mut file, size)?;
        let block_lookup = build_block_lookup(&block_map, &first_block_hash);

        let relative = shared_path
            .strip_prefix(&party_dir)
            .map_err(|_| FileError::Traversal)?
            .to_string_lossy()
            .into_owned();

        files.push(PackFileInfo {
            name: relative,
            hash,
            first_block_hash,
            size,
            coverage: full_coverage(size),
            block_map,
            block_lookup,
            path: shared_path.to_string_lossy().into_owned(),
        });
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    let mut pack = Pack {
        name: dot_pack.name,
        state: PackState::Complete,
        files,
        peers: HashMap::new(),
    };
    pack.peers.insert(self_id.to_string(), Utc::now());

    let hash = sha256_pack(&pack.summary());
    Ok((hash, pack))
}

/// Walk one party's directory and rebuild every pack from its `.pack`
/// manifests; also restore `.pending` downloads that have not finished.
pub fn scan_party(shared_dir: &Path, party_id: &str, self_id: &str) -> Vec<(String, Pack)> {
    let party_dir = shared_dir.join(party_id);
    let mut found = Vec::new();
    let mut pending = Vec::new();
    walk_dir(&party_dir, &mut |path| {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("pack") => match build_pack(shared_dir, party_id, path, self_id) {
                Ok(entry) => found.push(entry),
                Err(err) => tracing::warn!("skipping pack {}: {}", path.display(), err),
            },
            Some("pending") => pending.push(path.to_path_buf()),
            _ => {}
        }
    });

    // Resume partial downloads unless a completed scan already produced the
    // same pack.
    for path in pending {
        match load_pending(&path) {
            Ok((hash, pack)) => {
                if !found.iter().any(|(existing, _)| *existing == hash) {
                    found.push((hash, pack));
                }
            }
            Err(err) => tracing::warn!("skipping pending {}: {}", path.display(), err),
        }
    }

    found
}

fn walk_dir(dir: &Path, visit: &mut impl FnMut(&Path)) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_dir(&path, visit);
        } else {
            visit(&path);
        }
    }
}

/// Serialize an ACTIVE pack to `<name>.pending` beside its files.
pub fn write_pending(party_dir: &Path, hash: &str, pack: &Pack) -> Result<(), FileError> {
    let pending = PendingPack {
        name: pack.name.clone(),
        hash: hash.to_string(),
        files: pack.files.clone(),
    };
    let path = party_dir.join(format!("{}.pending", pack.name));
    fs::write(path, serde_json::to_vec(&pending)?)?;
    Ok(())
}

/// Restore a pack from its `.pending` snapshot. Fully covered snapshots come
/// back COMPLETE, everything else ACTIVE.
pub fn load_pending(path: &Path) -> Result<(String, Pack), FileError> {
    let contents = fs::read(path)?;
    let pending: PendingPack = serde_json::from_slice(&contents)?;
    let mut pack = Pack {
        name: pending.name,
        state: PackState::Active,
        files: pending.files,
        peers: HashMap::new(),
    };
    pack.files.sort_by(|a, b| a.name.cmp(&b.name));
    if pack.is_fully_covered() {
        pack.state = PackState::Complete;
    }
    Ok((pending.hash, pack))
}

/// Pre-extend `path` to `size` bytes of zeros so blocks can be written at
/// their final offsets in any order.
pub fn write_zero_file(path: &Path, size: u64) -> Result<(), FileError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    let chunk = vec![0u8; ZERO_CHUNK.min(size) as usize];
    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(ZERO_CHUNK) as usize;
        file.write_all(&chunk[..n])?;
        remaining -= n as u64;
    }
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file_with(contents: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        (dir, path)
    }

    #[test]
    fn tree_math() {
        assert_eq!(left_child(0), 1);
        assert_eq!(right_child(0), 2);
        assert_eq!(tree_parent(1), 0);
        assert_eq!(tree_parent(2), 0);
        assert_eq!(tree_parent(5), 2);
        assert_eq!(tree_parent(6), 2);
        assert_eq!(left_child((1 << 32) - 1), (1 << 33) - 1);
    }

    #[test]
    fn coverage_boundaries() {
        // Zero-size file: no words, trivially full and empty.
        assert_eq!(empty_coverage(0).len(), 0);
        assert_eq!(full_coverage(0).len(), 0);
        assert!(is_full_coverage(0, &[]));
        assert!(is_empty_coverage(&[]));

        // Exactly one block.
        assert_eq!(full_coverage(BLOCK_SIZE), vec![1]);
        assert!(is_full_coverage(BLOCK_SIZE, &[1]));
        assert!(!is_full_coverage(BLOCK_SIZE, &[0]));

        // 65 blocks: low word all ones, high word bit 0.
        let cov = full_coverage(BLOCK_SIZE * 65);
        assert_eq!(cov, vec![u64::MAX, 1]);
        assert_eq!(empty_coverage(BLOCK_SIZE * 65), vec![0, 0]);
    }

    #[test]
    fn coverage_bit_ops() {
        let mut cov = empty_coverage(BLOCK_SIZE * 100);
        assert!(!has_bit(&cov, 70));
        set_bit(&mut cov, 70);
        assert!(has_bit(&cov, 70));
        assert!(!has_bit(&cov, 69));
        // Out of range reads are false, writes are ignored.
        assert!(!has_bit(&cov, 1_000_000));
        set_bit(&mut cov, 1_000_000);
    }

    #[test]
    fn chain_single_short_block() {
        let (_dir, path) = temp_file_with(b"hello blocks");
        let mut file = File::open(&path).unwrap();
        let (first, map) = calculate_chain(&mut file, 12).unwrap();
        assert_eq!(map.len(), 1);
        let info = &map[&first];
        assert_eq!(info.index, 0);
        assert_eq!(info.next_block_hash, "");
        assert_eq!(info.left_block_hash, "");
        assert_eq!(info.data_hash, sha256_hex(b"hello blocks"));
    }

    #[test]
    fn chain_exact_multiple_has_no_trailing_empty_block() {
        let contents = vec![0xa5u8; BLOCK_SIZE as usize];
        let (_dir, path) = temp_file_with(&contents);
        let mut file = File::open(&path).unwrap();
        let (first, map) = calculate_chain(&mut file, contents.len() as u64).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&first].next_block_hash, "");
    }

    #[test]
    fn chain_links_and_skip_parents() {
        // Five blocks: forward links 0->1->2->3->4, skips 0->{1,2}, 1->{3,4}.
        let mut contents = Vec::new();
        for i in 0..5u8 {
            contents.extend(vec![i; BLOCK_SIZE as usize]);
        }
        contents.truncate(contents.len() - 100);
        let (_dir, path) = temp_file_with(&contents);
        let mut file = File::open(&path).unwrap();
        let (first, map) = calculate_chain(&mut file, contents.len() as u64).unwrap();

        let lookup = build_block_lookup(&map, &first);
        assert_eq!(lookup.len(), 5);

        let b0 = &map[&lookup[&0]];
        assert_eq!(b0.next_block_hash, lookup[&1]);
        assert_eq!(b0.left_block_hash, lookup[&1]);
        assert_eq!(b0.right_block_hash, lookup[&2]);

        let b1 = &map[&lookup[&1]];
        assert_eq!(b1.left_block_hash, lookup[&3]);
        assert_eq!(b1.right_block_hash, lookup[&4]);

        let b4 = &map[&lookup[&4]];
        assert_eq!(b4.next_block_hash, "");
        assert_eq!(b4.left_block_hash, "");
        assert_eq!(b4.right_block_hash, "");
    }

    #[test]
    fn chain_empty_file() {
        let (_dir, path) = temp_file_with(b"");
        let mut file = File::open(&path).unwrap();
        let (first, map) = calculate_chain(&mut file, 0).unwrap();
        assert_eq!(map.len(), 1);
        assert!(!first.is_empty());
        assert_eq!(map[&first].data_hash, sha256_hex(b""));
    }

    #[test]
    fn chain_is_deterministic() {
        let contents = vec![1u8; (BLOCK_SIZE * 2 + 17) as usize];
        let (_dir, path) = temp_file_with(&contents);
        let mut file = File::open(&path).unwrap();
        let (first_a, _) = calculate_chain(&mut file, contents.len() as u64).unwrap();
        let (first_b, _) = calculate_chain(&mut file, contents.len() as u64).unwrap();
        assert_eq!(first_a, first_b);
    }

    #[test]
    fn pack_hash_stable_under_reordering() {
        let file_a = FileSummary {
            name: "a.txt".into(),
            hash: "h1".into(),
            first_block_hash: "f1".into(),
            size: 10,
        };
        let file_b = FileSummary {
            name: "b.txt".into(),
            hash: "h2".into(),
            first_block_hash: "f2".into(),
            size: 20,
        };
        let forward = PackSummary {
            name: "pack".into(),
            files: vec![file_a.clone(), file_b.clone()],
        };
        let reversed = PackSummary {
            name: "pack".into(),
            files: vec![file_b, file_a],
        };
        assert_eq!(sha256_pack(&forward), sha256_pack(&reversed));
    }

    #[test]
    fn from_summary_strips_runtime_state() {
        let summary = PackSummary {
            name: "pack".into(),
            files: vec![FileSummary {
                name: "x".into(),
                hash: "h".into(),
                first_block_hash: "f".into(),
                size: 5,
            }],
        };
        let pack = Pack::from_summary(&summary);
        assert_eq!(pack.state, PackState::Available);
        let file = &pack.files[0];
        assert!(file.block_map.is_empty());
        assert!(file.block_lookup.is_empty());
        assert!(file.coverage.is_empty());
        assert!(file.path.is_empty());
    }

    #[test]
    fn build_pack_from_manifest_and_read_blocks_back() {
        let shared = tempfile::tempdir().unwrap();
        let party_dir = shared.path().join("party0");
        fs::create_dir_all(&party_dir).unwrap();
        fs::write(
            party_dir.join("test.pack"),
            br#"{"name":"test.pack","files":["test.file"]}"#,
        )
        .unwrap();
        let contents = vec![0x42u8; (BLOCK_SIZE + 5) as usize];
        fs::write(party_dir.join("test.file"), &contents).unwrap();

        let (hash, pack) = build_pack(
            shared.path(),
            "party0",
            &party_dir.join("test.pack"),
            "self-id",
        )
        .unwrap();
        assert_eq!(pack.state, PackState::Complete);
        assert_eq!(pack.files.len(), 1);
        assert!(pack.is_fully_covered());
        assert_eq!(hash, sha256_pack(&pack.summary()));

        let file = &pack.files[0];
        assert_eq!(file.name, "test.file");
        assert_eq!(file.size, contents.len() as u64);

        let info = &file.block_map[&file.block_lookup[&1]];
        let block = read_verified_block(Path::new(&file.path), info).unwrap();
        assert_eq!(block.index, 1);
        assert_eq!(block.data, vec![0x42u8; 5]);
        assert_eq!(sha256_block(&block), file.block_lookup[&1]);
    }

    #[test]
    fn build_pack_rejects_traversal() {
        let shared = tempfile::tempdir().unwrap();
        let party_dir = shared.path().join("party0");
        fs::create_dir_all(&party_dir).unwrap();
        fs::write(
            party_dir.join("evil.pack"),
            br#"{"name":"evil.pack","files":["../../etc/passwd"]}"#,
        )
        .unwrap();
        let err = build_pack(
            shared.path(),
            "party0",
            &party_dir.join("evil.pack"),
            "self-id",
        )
        .unwrap_err();
        assert!(matches!(err, FileError::Traversal));
    }

    #[test]
    fn pending_roundtrip_restores_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let mut pack = Pack {
            name: "resume".into(),
            state: PackState::Active,
            files: vec![PackFileInfo {
                name: "big".into(),
                hash: "fh".into(),
                first_block_hash: "fb".into(),
                size: BLOCK_SIZE * 3,
                block_map: HashMap::new(),
                block_lookup: HashMap::new(),
                coverage: empty_coverage(BLOCK_SIZE * 3),
                path: "/tmp/big".into(),
            }],
            peers: HashMap::new(),
        };
        set_bit(&mut pack.files[0].coverage, 1);
        write_pending(dir.path(), "packhash", &pack).unwrap();

        let (hash, restored) = load_pending(&dir.path().join("resume.pending")).unwrap();
        assert_eq!(hash, "packhash");
        assert_eq!(restored.state, PackState::Active);
        assert!(has_bit(&restored.files[0].coverage, 1));
        assert!(!has_bit(&restored.files[0].coverage, 0));
        assert_eq!(restored.files[0].path, "/tmp/big");
    }

    #[test]
    fn zero_file_has_declared_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("zeros.bin");
        write_zero_file(&path, BLOCK_SIZE * 2 + 3).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), BLOCK_SIZE * 2 + 3);
    }
}
