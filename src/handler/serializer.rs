//! Transaction serialization collaborator
//!
//! Chain wire encoding and signature math are outside the core. The core hands a
//! transfer to a `TransactionSerializer` and only checks that a non-empty
//! serialization came back.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::network::{NetworkType, TxHash};
use crate::wallet::transfer::{TezosOperationKind, Transfer, TransferPayload, TxEndpoint};
use crate::wallet::Credential;

/// Chain context needed to serialize a transfer
#[derive(Debug, Clone)]
pub struct SerializationContext {
    pub network_type: NetworkType,
    /// Sighash fork id (BCH/BSV)
    pub fork_id: u8,
    /// Latest verified block, used as the operation branch on Tezos
    pub block_hash: Option<TxHash>,
    /// Prepend a key reveal (Tezos accounts that never sent)
    pub needs_reveal: bool,
}

/// Output of a serialization; empty `bytes` means failure
#[derive(Debug, Clone, Default)]
pub struct Serialized {
    pub bytes: Vec<u8>,
    pub hash: [u8; 32],
}

impl Serialized {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A raw transaction decoded far enough to reconcile it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSummary {
    pub hash: [u8; 32],
    pub inputs: Vec<TxEndpoint>,
    pub outputs: Vec<TxEndpoint>,
    pub fee: u64,
    pub size: usize,
}

pub trait TransactionSerializer: Send + Sync {
    /// Serialize and sign; returns an empty serialization on failure
    fn serialize_and_sign(
        &self,
        transfer: &Transfer,
        credential: &Credential,
        ctx: &SerializationContext,
    ) -> Serialized;

    /// Serialize with a placeholder signature, only to size the transaction
    fn serialize_for_fee_estimation(&self, transfer: &Transfer, ctx: &SerializationContext)
        -> Serialized;

    /// Decode a raw transaction of `network_type`
    fn decode_transaction(&self, network_type: NetworkType, bytes: &[u8])
        -> Option<TransactionSummary>;
}

/// Deterministic stand-in serializer
///
/// The "transaction" is a JSON body describing the transfer; the "signature" is
/// SHA-256 over the body and the secret; the hash is double SHA-256 of the
/// serialization. Good enough to drive signing, submission and replay end to end.
#[derive(Debug, Default, Clone)]
pub struct DigestSerializer;

#[derive(Debug, Serialize, Deserialize)]
struct DigestBody {
    network: NetworkType,
    source: String,
    target: String,
    amount: u64,
    fee: u64,
    inputs: Vec<TxEndpoint>,
    outputs: Vec<TxEndpoint>,
    counter: Option<u64>,
    operation: Option<TezosOperationKind>,
    reveal: bool,
    branch: Option<String>,
    fork_id: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct DigestEnvelope {
    body: DigestBody,
    signature: String,
}

fn double_sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(Sha256::digest(bytes)).into()
}

impl DigestSerializer {
    pub fn new() -> Self {
        Self
    }

    fn body(&self, transfer: &Transfer, ctx: &SerializationContext) -> DigestBody {
        let fee = transfer.fee();
        let (inputs, outputs, counter, operation) = match transfer.payload() {
            TransferPayload::Bitcoin { inputs, outputs } => {
                (inputs.clone(), outputs.clone(), None, None)
            }
            TransferPayload::Tezos { counter, operation } => (
                vec![TxEndpoint {
                    address: transfer.source().to_string(),
                    amount: transfer.amount() + fee,
                }],
                vec![TxEndpoint {
                    address: transfer.target().to_string(),
                    amount: transfer.amount(),
                }],
                *counter,
                Some(*operation),
            ),
        };

        DigestBody {
            network: ctx.network_type,
            source: transfer.source().to_string(),
            target: transfer.target().to_string(),
            amount: transfer.amount(),
            fee,
            inputs,
            outputs,
            counter,
            operation,
            reveal: ctx.needs_reveal,
            branch: ctx.block_hash.map(|h| h.encode()),
            fork_id: ctx.fork_id,
        }
    }

    fn envelope(&self, body: DigestBody, signature: String) -> Serialized {
        match serde_json::to_vec(&DigestEnvelope { body, signature }) {
            Ok(bytes) => {
                let hash = double_sha256(&bytes);
                Serialized { bytes, hash }
            }
            Err(e) => {
                warn!(error = %e, "Digest serialization failed");
                Serialized::default()
            }
        }
    }
}

impl TransactionSerializer for DigestSerializer {
    fn serialize_and_sign(
        &self,
        transfer: &Transfer,
        credential: &Credential,
        ctx: &SerializationContext,
    ) -> Serialized {
        if credential.as_bytes().is_empty() {
            return Serialized::default();
        }
        let body = self.body(transfer, ctx);
        let Ok(preimage) = serde_json::to_vec(&body) else {
            return Serialized::default();
        };

        let mut hasher = Sha256::new();
        hasher.update(&preimage);
        hasher.update(credential.as_bytes());
        let signature = hex::encode(hasher.finalize());

        self.envelope(body, signature)
    }

    fn serialize_for_fee_estimation(
        &self,
        transfer: &Transfer,
        ctx: &SerializationContext,
    ) -> Serialized {
        let body = self.body(transfer, ctx);
        self.envelope(body, "00".repeat(32))
    }

    fn decode_transaction(
        &self,
        network_type: NetworkType,
        bytes: &[u8],
    ) -> Option<TransactionSummary> {
        let envelope: DigestEnvelope = serde_json::from_slice(bytes).ok()?;
        if envelope.body.network != network_type {
            return None;
        }
        Some(TransactionSummary {
            hash: double_sha256(bytes),
            inputs: envelope.body.inputs,
            outputs: envelope.body.outputs,
            fee: envelope.body.fee,
            size: bytes.len(),
        })
    }
}
