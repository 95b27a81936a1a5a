//! Share difficulty evaluation.
//!
//! Rebuilds the exact block header a chip hashed for a job, nonce and
//! rolled version, and measures the difficulty its hash achieves:
//!
//! ```text
//! coinbase  = coinbase1 || extranonce1 || extranonce2 || coinbase2
//! root      = fold(sha256d(coinbase), merkle_branches)
//! header    = version | prev_hash | root | ntime | nbits | nonce
//! difficulty = diff1_target / sha256d(header)
//! ```

use bitcoin::block::{Header, Version};
use bitcoin::hashes::{Hash, sha256d};
use bitcoin::{BlockHash, Target, TxMerkleNode};

use crate::job_table::ActiveJob;

/// Measures the difficulty of a candidate nonce.
pub trait ShareEvaluator: Send + Sync {
    /// Difficulty achieved by `nonce` under the combined `version`.
    fn evaluate(&self, job: &ActiveJob, nonce: u32, version: u32) -> f64;
}

/// Evaluates shares by double-SHA256 of the reconstructed header.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderEvaluator;

impl HeaderEvaluator {
    /// Merkle root for the job's coinbase and extranonces.
    pub fn merkle_root(job: &ActiveJob) -> TxMerkleNode {
        let mut coinbase = Vec::with_capacity(
            job.job.coinbase1.len()
                + job.extranonce1.len()
                + job.extranonce2.size()
                + job.job.coinbase2.len(),
        );
        coinbase.extend_from_slice(&job.job.coinbase1);
        coinbase.extend_from_slice(&job.extranonce1);
        job.extranonce2.extend_vec(&mut coinbase);
        coinbase.extend_from_slice(&job.job.coinbase2);

        let mut current = sha256d::Hash::hash(&coinbase).to_byte_array();
        for branch in &job.job.merkle_branches {
            let mut combined = [0u8; 64];
            combined[..32].copy_from_slice(&current);
            combined[32..].copy_from_slice(branch.as_byte_array());
            current = sha256d::Hash::hash(&combined).to_byte_array();
        }

        TxMerkleNode::from_byte_array(current)
    }

    pub fn header(job: &ActiveJob, merkle_root: TxMerkleNode, nonce: u32, version: u32) -> Header {
        Header {
            version: Version::from_consensus(version as i32),
            prev_blockhash: job.job.prev_hash,
            merkle_root,
            time: job.job.ntime,
            bits: job.job.nbits,
            nonce,
        }
    }

    /// Difficulty represented by a header hash.
    pub fn hash_difficulty(hash: &BlockHash) -> f64 {
        Target::from_le_bytes(hash.to_byte_array()).difficulty_float()
    }
}

impl ShareEvaluator for HeaderEvaluator {
    fn evaluate(&self, job: &ActiveJob, nonce: u32, version: u32) -> f64 {
        let root = Self::merkle_root(job);
        let hash = Self::header(job, root, nonce, version).block_hash();
        Self::hash_difficulty(&hash)
    }
}
