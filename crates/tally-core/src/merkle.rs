//! BLAKE3 merkle trees for transaction and vote commitment.
//!
//! Domain-separated hashing prevents second-preimage attacks:
//! leaves are `BLAKE3(0x00 || data)`, internal nodes
//! `BLAKE3(0x01 || left || right)`. Odd layers duplicate their last
//! element. The empty tree has root [`Hash256::ZERO`].

use serde::{Deserialize, Serialize};

use crate::types::Hash256;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Domain-separated leaf hash.
pub fn leaf_hash(data: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(data.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Domain-separated internal node hash.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Merkle root over a slice of leaf values (transaction or vote ids).
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }
    let mut layer: Vec<Hash256> = leaves.iter().map(leaf_hash).collect();
    while layer.len() > 1 {
        layer = next_layer(&layer);
    }
    layer[0]
}

fn next_layer(layer: &[Hash256]) -> Vec<Hash256> {
    let mut next = Vec::with_capacity(layer.len().div_ceil(2));
    let mut i = 0;
    while i < layer.len() {
        let left = &layer[i];
        let right = layer.get(i + 1).unwrap_or(left);
        next.push(node_hash(left, right));
        i += 2;
    }
    next
}

/// Append-only root maintained over a growing leaf set.
///
/// Used for the per-period vote root: each accepted vote appends a leaf and
/// the root is recomputed over the cached leaves.
#[derive(Clone, Debug, Default)]
pub struct IncrementalRoot {
    leaves: Vec<Hash256>,
}

impl IncrementalRoot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from an existing leaf set (e.g. after loading from the store).
    pub fn from_leaves(leaves: Vec<Hash256>) -> Self {
        Self { leaves }
    }

    /// Append a leaf and return the updated root.
    pub fn push(&mut self, leaf: Hash256) -> Hash256 {
        self.leaves.push(leaf);
        self.root()
    }

    pub fn root(&self) -> Hash256 {
        merkle_root(&self.leaves)
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}

/// Full merkle tree retaining all layers, for proof extraction.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    leaves: Vec<Hash256>,
    /// `layers[0]` = leaf hashes; last layer = `[root]`.
    layers: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    pub fn from_leaves(leaves: &[Hash256]) -> Self {
        if leaves.is_empty() {
            return Self { leaves: Vec::new(), layers: Vec::new() };
        }
        let mut layers = vec![leaves.iter().map(leaf_hash).collect::<Vec<_>>()];
        while layers.last().unwrap().len() > 1 {
            let next = next_layer(layers.last().unwrap());
            layers.push(next);
        }
        Self { leaves: leaves.to_vec(), layers }
    }

    pub fn root(&self) -> Hash256 {
        self.layers
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or(Hash256::ZERO)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Inclusion proof for the leaf at `index`, or `None` if out of bounds.
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaves.len() {
            return None;
        }
        let mut path = Vec::new();
        let mut pos = index;
        for layer in &self.layers[..self.layers.len() - 1] {
            let sibling_pos = pos ^ 1;
            // Odd layer: the last element is its own sibling.
            let sibling = layer.get(sibling_pos).copied().unwrap_or(layer[pos]);
            let side = if pos % 2 == 0 { Side::Right } else { Side::Left };
            path.push(ProofStep { hash: sibling, side });
            pos /= 2;
        }
        Some(MerkleProof {
            leaf_index: index,
            leaf: self.leaves[index],
            path,
        })
    }
}

/// Which side a sibling sits on relative to the current node.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum Side {
    Left,
    Right,
}

/// One level of an inclusion proof.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ProofStep {
    pub hash: Hash256,
    pub side: Side,
}

/// Inclusion proof for a single leaf.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub leaf: Hash256,
    pub path: Vec<ProofStep>,
}

impl MerkleProof {
    /// Recompute the root from the leaf and sibling path and compare.
    pub fn verify(&self, expected_root: &Hash256) -> bool {
        let mut current = leaf_hash(&self.leaf);
        for step in &self.path {
            current = match step.side {
                Side::Left => node_hash(&step.hash, &current),
                Side::Right => node_hash(&current, &step.hash),
            };
        }
        current == *expected_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(byte: u8) -> Hash256 {
        Hash256([byte; 32])
    }

    #[test]
    fn empty_root_is_zero() {
        assert_eq!(merkle_root(&[]), Hash256::ZERO);
    }

    #[test]
    fn single_leaf_root_is_leaf_hash() {
        assert_eq!(merkle_root(&[h(0xAA)]), leaf_hash(&h(0xAA)));
    }

    #[test]
    fn two_leaf_root() {
        let expected = node_hash(&leaf_hash(&h(1)), &leaf_hash(&h(2)));
        assert_eq!(merkle_root(&[h(1), h(2)]), expected);
    }

    #[test]
    fn odd_count_duplicates_last() {
        let la = leaf_hash(&h(1));
        let lb = leaf_hash(&h(2));
        let lc = leaf_hash(&h(3));
        let expected = node_hash(&node_hash(&la, &lb), &node_hash(&lc, &lc));
        assert_eq!(merkle_root(&[h(1), h(2), h(3)]), expected);
    }

    #[test]
    fn leaf_and_node_domains_differ() {
        assert_ne!(leaf_hash(&h(0xAA)), node_hash(&h(0xAA), &h(0xAA)));
    }

    #[test]
    fn order_matters() {
        assert_ne!(merkle_root(&[h(1), h(2)]), merkle_root(&[h(2), h(1)]));
    }

    #[test]
    fn tree_root_matches_standalone() {
        for count in 1..=12 {
            let leaves: Vec<Hash256> = (0..count).map(|i| h(i as u8)).collect();
            let tree = MerkleTree::from_leaves(&leaves);
            assert_eq!(tree.root(), merkle_root(&leaves), "count={count}");
        }
    }

    #[test]
    fn proofs_verify_for_all_leaves() {
        for count in [1usize, 2, 3, 5, 8, 13] {
            let leaves: Vec<Hash256> = (0..count).map(|i| h(i as u8)).collect();
            let tree = MerkleTree::from_leaves(&leaves);
            let root = tree.root();
            for i in 0..count {
                let proof = tree.proof(i).unwrap();
                assert!(proof.verify(&root), "count={count} leaf={i}");
            }
        }
    }

    #[test]
    fn tampered_proof_fails() {
        let leaves: Vec<Hash256> = (0..4).map(|i| h(i)).collect();
        let tree = MerkleTree::from_leaves(&leaves);
        let root = tree.root();

        let mut proof = tree.proof(1).unwrap();
        proof.leaf = h(0xFF);
        assert!(!proof.verify(&root));

        let mut proof = tree.proof(1).unwrap();
        proof.path[0].hash = h(0xFF);
        assert!(!proof.verify(&root));
    }

    #[test]
    fn proof_out_of_bounds() {
        let tree = MerkleTree::from_leaves(&[h(1)]);
        assert!(tree.proof(1).is_none());
        assert!(MerkleTree::from_leaves(&[]).proof(0).is_none());
    }

    #[test]
    fn incremental_root_matches_batch() {
        let leaves: Vec<Hash256> = (0..7).map(|i| h(i)).collect();
        let mut inc = IncrementalRoot::new();
        assert_eq!(inc.root(), Hash256::ZERO);
        for (i, leaf) in leaves.iter().enumerate() {
            let root = inc.push(*leaf);
            assert_eq!(root, merkle_root(&leaves[..=i]));
        }
        assert_eq!(inc.len(), 7);
    }

    #[test]
    fn incremental_from_leaves_resumes() {
        let leaves: Vec<Hash256> = (0..3).map(|i| h(i)).collect();
        let inc = IncrementalRoot::from_leaves(leaves.clone());
        assert_eq!(inc.root(), merkle_root(&leaves));
    }
}
