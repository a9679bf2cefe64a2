//! Transaction merkle trees
//!
//! Leaves are txids in block order. An odd level pairs its last node with
//! itself; an empty block has the zero root.

use serde::{Deserialize, Serialize};

use super::{hash_pair, Hash};

/// Which side of the running hash a sibling sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MerkleSide {
    Left,
    Right,
}

/// Inclusion proof for one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Position of the transaction in its block
    pub index: usize,
    /// Siblings from leaf to root
    pub path: Vec<(Hash, MerkleSide)>,
}

impl MerkleProof {
    /// Fold `txid` up the path and compare with `root`
    pub fn verify(&self, txid: &Hash, root: &Hash) -> bool {
        let folded = self.path.iter().fold(*txid, |acc, (sibling, side)| match side {
            MerkleSide::Left => hash_pair(sibling, &acc),
            MerkleSide::Right => hash_pair(&acc, sibling),
        });
        folded == *root
    }
}

/// Hash adjacent pairs into the next level up
fn parent_level(level: &[Hash]) -> Vec<Hash> {
    level
        .chunks(2)
        .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
        .collect()
}

pub fn compute_merkle_root(txids: &[Hash]) -> Hash {
    let mut level = match txids {
        [] => return Hash::zero(),
        [only] => return *only,
        _ => txids.to_vec(),
    };
    while level.len() > 1 {
        level = parent_level(&level);
    }
    level[0]
}

/// Proof for the leaf at `index`, or `None` when out of range
pub fn build_merkle_proof(txids: &[Hash], index: usize) -> Option<MerkleProof> {
    if index >= txids.len() {
        return None;
    }
    let mut path = Vec::new();
    let mut level = txids.to_vec();
    let mut position = index;
    while level.len() > 1 {
        let sibling = if position % 2 == 0 {
            (level.get(position + 1).unwrap_or(&level[position]), MerkleSide::Right)
        } else {
            (&level[position - 1], MerkleSide::Left)
        };
        path.push((*sibling.0, sibling.1));
        level = parent_level(&level);
        position /= 2;
    }
    Some(MerkleProof { index, path })
}
