//! SHA-256 tree hashing.
//!
//! Data is split into 1 MiB leaves, each leaf is hashed, and adjacent
//! digests are paired left to right and hashed together until a single
//! root remains. An unpaired digest at the end of a level moves up
//! unchanged. Part checksums combine into the archive checksum with the
//! same pairing rule, so the order of parts matters.

use std::io::Read;

use sha2::{Digest, Sha256};
use vaultpush_protocol::TreeHash;
use vaultpush_protocol::types::DIGEST_LEN;

use crate::TransferError;

/// Leaf chunk size: 1 MiB.
pub const LEAF_SIZE: usize = 1024 * 1024;

type Node = [u8; DIGEST_LEN];

fn leaf_digest(data: &[u8]) -> Node {
    Sha256::digest(data).into()
}

fn reduce(mut level: Vec<Node>) -> Node {
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => {
                    let mut hasher = Sha256::new();
                    hasher.update(left);
                    hasher.update(right);
                    hasher.finalize().into()
                }
                [single] => *single,
                _ => unreachable!("chunks(2) yields one or two nodes"),
            })
            .collect();
    }
    level[0]
}

/// Computes the tree hash of a byte slice.
///
/// Empty input hashes as a single empty leaf.
pub fn compute_tree_hash(data: &[u8]) -> TreeHash {
    if data.is_empty() {
        return TreeHash::from_bytes(leaf_digest(data));
    }
    let leaves = data.chunks(LEAF_SIZE).map(leaf_digest).collect();
    TreeHash::from_bytes(reduce(leaves))
}

/// Combines ordered part checksums into the archive checksum.
pub fn combine_tree_hashes(hashes: &[TreeHash]) -> Result<TreeHash, TransferError> {
    if hashes.is_empty() {
        return Err(TransferError::EmptyChecksumList);
    }
    let nodes = hashes.iter().map(|h| *h.as_bytes()).collect();
    Ok(TreeHash::from_bytes(reduce(nodes)))
}

/// Incremental tree hasher with bounded memory.
///
/// Produces the same digest as [`compute_tree_hash`] over the concatenation
/// of every slice passed to [`update`](Self::update).
pub struct TreeHasher {
    buffer: Vec<u8>,
    leaves: Vec<Node>,
    total: u64,
}

impl Default for TreeHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeHasher {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(LEAF_SIZE),
            leaves: Vec::new(),
            total: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.total += data.len() as u64;
        while !data.is_empty() {
            let take = (LEAF_SIZE - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() == LEAF_SIZE {
                self.leaves.push(leaf_digest(&self.buffer));
                self.buffer.clear();
            }
        }
    }

    /// Bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.total
    }

    pub fn finish(mut self) -> TreeHash {
        if !self.buffer.is_empty() || self.leaves.is_empty() {
            self.leaves.push(leaf_digest(&self.buffer));
        }
        TreeHash::from_bytes(reduce(self.leaves))
    }
}

/// Tree-hashes everything readable from `reader`.
///
/// Returns the digest and the number of bytes consumed.
pub fn tree_hash_reader<R: Read>(mut reader: R) -> Result<(TreeHash, u64), TransferError> {
    let mut hasher = TreeHasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let total = hasher.bytes_hashed();
    Ok((hasher.finish(), total))
}
