//! Chain data model: blocks, transactions and the extra field.
//!
//! These types mirror the JSON the full node serves. Hashes are recomputed
//! locally from a canonical varint digest so the scanner never trusts a
//! daemon-supplied transaction hash it can derive itself.

use serde::{Deserialize, Serialize};

use crate::crypto::{keccak256, varint, Hash, Hash8, KeyImage, PublicKey};

const EXTRA_TAG_PADDING: u8 = 0x00;
const EXTRA_TAG_PUBKEY: u8 = 0x01;
const EXTRA_TAG_NONCE: u8 = 0x02;
const NONCE_TAG_LONG_ID: u8 = 0x00;
const NONCE_TAG_ENCRYPTED_ID: u8 = 0x01;

/// A block as served by `get_blocks_fast`.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub timestamp: u64,
    pub prev_id: Hash,
    pub nonce: u32,
    pub miner_tx: Transaction,
    pub tx_hashes: Vec<Hash>,
}

impl Block {
    /// Block hash over the header digest and the ordered tx hash list.
    pub fn hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&varint(self.timestamp));
        buf.extend_from_slice(&self.prev_id.0);
        buf.extend_from_slice(&varint(u64::from(self.nonce)));
        buf.extend_from_slice(&self.miner_tx.hash().0);
        buf.extend_from_slice(&varint(self.tx_hashes.len() as u64));
        for tx_hash in &self.tx_hashes {
            buf.extend_from_slice(&tx_hash.0);
        }
        Hash(keccak256(&buf))
    }
}

/// A transaction input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxInput {
    /// Coinbase input; present only in miner transactions.
    Gen { height: u64 },
    /// Standard key input spending one real output hidden in a ring.
    ToKey {
        amount: u64,
        /// Ring member positions, delta-encoded global output ids.
        key_offsets: Vec<u64>,
        key_image: KeyImage,
    },
}

/// A transaction output.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOutput {
    pub amount: u64,
    pub target: TxOutTarget,
}

/// Destination of an output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxOutTarget {
    /// One-time key output, the only kind a view key can detect.
    ToKey { key: PublicKey },
    /// Raw script output; ignored by the scanner.
    Script {
        #[serde(with = "hex")]
        script: Vec<u8>,
    },
}

/// Confidential amount data for version 2 transactions, one entry per output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RctSignatures {
    /// Pedersen commitments.
    pub commitments: Vec<Hash>,
    /// ECDH-encoded amounts.
    pub ecdh_amounts: Vec<Hash8>,
}

impl RctSignatures {
    fn write_digest(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&varint(self.commitments.len() as u64));
        for commitment in &self.commitments {
            buf.extend_from_slice(&commitment.0);
        }
        for ecdh in &self.ecdh_amounts {
            buf.extend_from_slice(&ecdh.0);
        }
    }
}

/// A transaction as served by the full node.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u64,
    pub unlock_time: u64,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    #[serde(with = "hex", default)]
    pub extra: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rct: Option<RctSignatures>,
}

impl Transaction {
    fn write_prefix(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&varint(self.version));
        buf.extend_from_slice(&varint(self.unlock_time));
        buf.extend_from_slice(&varint(self.inputs.len() as u64));
        for input in &self.inputs {
            match input {
                TxInput::Gen { height } => {
                    buf.push(0xff);
                    buf.extend_from_slice(&varint(*height));
                }
                TxInput::ToKey {
                    amount,
                    key_offsets,
                    key_image,
                } => {
                    buf.push(0x02);
                    buf.extend_from_slice(&varint(*amount));
                    buf.extend_from_slice(&varint(key_offsets.len() as u64));
                    for offset in key_offsets {
                        buf.extend_from_slice(&varint(*offset));
                    }
                    buf.extend_from_slice(&key_image.0);
                }
            }
        }
        buf.extend_from_slice(&varint(self.outputs.len() as u64));
        for output in &self.outputs {
            buf.extend_from_slice(&varint(output.amount));
            match &output.target {
                TxOutTarget::ToKey { key } => {
                    buf.push(0x02);
                    buf.extend_from_slice(&key.0);
                }
                TxOutTarget::Script { script } => {
                    buf.push(0x00);
                    buf.extend_from_slice(&varint(script.len() as u64));
                    buf.extend_from_slice(script);
                }
            }
        }
        buf.extend_from_slice(&varint(self.extra.len() as u64));
        buf.extend_from_slice(&self.extra);
    }

    /// Hash of the transaction prefix (everything except confidential data).
    pub fn prefix_hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(256);
        self.write_prefix(&mut buf);
        Hash(keccak256(&buf))
    }

    /// Full transaction hash.
    pub fn hash(&self) -> Hash {
        let prefix_hash = self.prefix_hash();
        match &self.rct {
            None => prefix_hash,
            Some(rct) => {
                let mut buf = Vec::with_capacity(64);
                buf.extend_from_slice(&prefix_hash.0);
                let mut rct_buf = Vec::with_capacity(64 * rct.commitments.len());
                rct.write_digest(&mut rct_buf);
                buf.extend_from_slice(&keccak256(&rct_buf));
                Hash(keccak256(&buf))
            }
        }
    }
}

/// Payment id found in a transaction's extra field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraPaymentId {
    /// 32-byte plaintext form.
    Long(Hash),
    /// 8-byte encrypted form.
    Encrypted(Hash8),
}

/// Fields recovered from a transaction's extra blob.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ParsedExtra {
    pub tx_public: Option<PublicKey>,
    pub payment_id: Option<ExtraPaymentId>,
}

/// Parse the extra field. Parsing is best-effort: a malformed tail does not
/// discard the fields recovered before it, mirroring wallet behavior.
pub fn parse_extra(extra: &[u8]) -> ParsedExtra {
    let mut parsed = ParsedExtra::default();
    let mut pos = 0;
    while pos < extra.len() {
        match extra[pos] {
            EXTRA_TAG_PADDING => pos += 1,
            EXTRA_TAG_PUBKEY => {
                let Some(bytes) = extra.get(pos + 1..pos + 33) else {
                    break;
                };
                if parsed.tx_public.is_none() {
                    parsed.tx_public = Some(PublicKey(bytes.try_into().expect("32 bytes")));
                }
                pos += 33;
            }
            EXTRA_TAG_NONCE => {
                let Some(&len) = extra.get(pos + 1) else {
                    break;
                };
                let Some(nonce) = extra.get(pos + 2..pos + 2 + usize::from(len)) else {
                    break;
                };
                if parsed.payment_id.is_none() {
                    parsed.payment_id = parse_nonce(nonce);
                }
                pos += 2 + usize::from(len);
            }
            _ => break,
        }
    }
    parsed
}

fn parse_nonce(nonce: &[u8]) -> Option<ExtraPaymentId> {
    match nonce.split_first() {
        Some((&NONCE_TAG_LONG_ID, rest)) if rest.len() == 32 => Some(ExtraPaymentId::Long(Hash(
            rest.try_into().expect("32 bytes"),
        ))),
        Some((&NONCE_TAG_ENCRYPTED_ID, rest)) if rest.len() == 8 => Some(
            ExtraPaymentId::Encrypted(Hash8(rest.try_into().expect("8 bytes"))),
        ),
        _ => None,
    }
}

/// Build an extra blob the way a sending wallet would. Used by tests and
/// tooling; the server itself only parses.
pub fn build_extra(tx_public: &PublicKey, payment_id: Option<&ExtraPaymentId>) -> Vec<u8> {
    let mut extra = Vec::with_capacity(44);
    extra.push(EXTRA_TAG_PUBKEY);
    extra.extend_from_slice(&tx_public.0);
    match payment_id {
        None => {}
        Some(ExtraPaymentId::Long(id)) => {
            extra.push(EXTRA_TAG_NONCE);
            extra.push(33);
            extra.push(NONCE_TAG_LONG_ID);
            extra.extend_from_slice(&id.0);
        }
        Some(ExtraPaymentId::Encrypted(id)) => {
            extra.push(EXTRA_TAG_NONCE);
            extra.push(9);
            extra.push(NONCE_TAG_ENCRYPTED_ID);
            extra.extend_from_slice(&id.0);
        }
    }
    extra
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::random_keypair;

    fn sample_tx() -> Transaction {
        let (_, tx_public) = random_keypair();
        Transaction {
            version: 2,
            unlock_time: 0,
            inputs: vec![TxInput::ToKey {
                amount: 0,
                key_offsets: vec![10, 5, 3],
                key_image: KeyImage([7; 32]),
            }],
            outputs: vec![TxOutput {
                amount: 0,
                target: TxOutTarget::ToKey {
                    key: PublicKey([9; 32]),
                },
            }],
            extra: build_extra(&tx_public, None),
            rct: Some(RctSignatures {
                commitments: vec![Hash([1; 32])],
                ecdh_amounts: vec![Hash8([2; 8])],
            }),
        }
    }

    #[test]
    fn extra_round_trips_all_forms() {
        let (_, tx_public) = random_keypair();

        let parsed = parse_extra(&build_extra(&tx_public, None));
        assert_eq!(parsed.tx_public, Some(tx_public));
        assert_eq!(parsed.payment_id, None);

        let long = ExtraPaymentId::Long(Hash([3; 32]));
        let parsed = parse_extra(&build_extra(&tx_public, Some(&long)));
        assert_eq!(parsed.tx_public, Some(tx_public));
        assert_eq!(parsed.payment_id, Some(long));

        let short = ExtraPaymentId::Encrypted(Hash8([4; 8]));
        let parsed = parse_extra(&build_extra(&tx_public, Some(&short)));
        assert_eq!(parsed.payment_id, Some(short));
    }

    #[test]
    fn extra_tolerates_padding_and_truncation() {
        let (_, tx_public) = random_keypair();
        let mut extra = vec![0x00, 0x00];
        extra.extend_from_slice(&build_extra(&tx_public, None));
        // truncated nonce at the tail must not discard the pubkey
        extra.extend_from_slice(&[EXTRA_TAG_NONCE, 9, NONCE_TAG_ENCRYPTED_ID]);
        let parsed = parse_extra(&extra);
        assert_eq!(parsed.tx_public, Some(tx_public));
        assert_eq!(parsed.payment_id, None);

        assert!(parse_extra(&[]).tx_public.is_none());
        assert!(parse_extra(&[EXTRA_TAG_PUBKEY, 1, 2]).tx_public.is_none());
    }

    #[test]
    fn hashes_are_deterministic_and_distinct() {
        let tx = sample_tx();
        assert_eq!(tx.hash(), tx.hash());
        assert_ne!(tx.hash(), tx.prefix_hash());

        let mut other = tx.clone();
        other.unlock_time = 5;
        assert_ne!(tx.hash(), other.hash());
        assert_ne!(tx.prefix_hash(), other.prefix_hash());
    }

    #[test]
    fn wire_round_trip() {
        let tx = sample_tx();
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hash(), tx.hash());

        let block = Block {
            timestamp: 1_700_000_000,
            prev_id: Hash([5; 32]),
            nonce: 42,
            miner_tx: tx,
            tx_hashes: vec![Hash([6; 32])],
        };
        let json = serde_json::to_string(&block).unwrap();
        let back: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hash(), block.hash());
    }
}
