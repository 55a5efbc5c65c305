//! CRDT engine capability seam.
//!
//! Session, routing and persistence code only ever talks to [`CrdtEngine`],
//! so another CRDT library can be substituted without touching them.
//! [`YrsEngine`] is the shipped implementation (Yjs-compatible v1 updates).

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Malformed update: {0}")]
    MalformedUpdate(String),
    #[error("Malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("Update rejected: {0}")]
    Rejected(String),
}

/// Opaque conflict-free state container.
///
/// Implementations must make `merge` commutative and idempotent: applying
/// the same multiset of updates in any order yields the same state.
pub trait CrdtEngine: Send + Sync + 'static {
    type State: Send + Sync + 'static;

    fn new_state(&self) -> Self::State;

    /// Merge a remote update into `state`. On error `state` is unchanged.
    fn merge(&self, state: &mut Self::State, update: &[u8]) -> Result<(), EngineError>;

    /// Complete encoding of `state`, suitable for bootstrapping or storage.
    fn encode_state(&self, state: &Self::State) -> Vec<u8>;

    /// Compact summary of what `state` has observed.
    fn state_vector(&self, state: &Self::State) -> Vec<u8>;

    /// Incremental update containing everything `state` has that a peer
    /// with `remote_state_vector` lacks.
    fn encode_diff(
        &self,
        state: &Self::State,
        remote_state_vector: &[u8],
    ) -> Result<Vec<u8>, EngineError>;
}

/// [`CrdtEngine`] backed by a `yrs::Doc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct YrsEngine;

impl CrdtEngine for YrsEngine {
    type State = yrs::Doc;

    fn new_state(&self) -> yrs::Doc {
        yrs::Doc::new()
    }

    fn merge(&self, state: &mut yrs::Doc, update: &[u8]) -> Result<(), EngineError> {
        let update =
            Update::decode_v1(update).map_err(|e| EngineError::MalformedUpdate(e.to_string()))?;
        let mut txn = state.transact_mut();
        txn.apply_update(update)
            .map_err(|e| EngineError::Rejected(e.to_string()))
    }

    fn encode_state(&self, state: &yrs::Doc) -> Vec<u8> {
        let txn = state.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn state_vector(&self, state: &yrs::Doc) -> Vec<u8> {
        let txn = state.transact();
        txn.state_vector().encode_v1()
    }

    fn encode_diff(
        &self,
        state: &yrs::Doc,
        remote_state_vector: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        let remote = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| EngineError::MalformedStateVector(e.to_string()))?;
        let txn = state.transact();
        Ok(txn.encode_diff_v1(&remote))
    }
}
