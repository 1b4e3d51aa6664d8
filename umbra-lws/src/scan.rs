//! Viewkey scanning of a single transaction against a set of accounts.

use crate::account::ScanAccount;
use crate::chain::{parse_extra, ExtraPaymentId, Transaction, TxInput, TxOutTarget};
use crate::crypto::{self, Hash};
use crate::db::data::{
    BlockHeight, Output, OutputId, PackedExtra, PaymentId, OUTPUT_COINBASE, OUTPUT_RINGCT,
};
use crate::error::ScanError;

/// Scan one transaction for every account in `users`.
///
/// Detects received outputs by key derivation, decodes confidential
/// amounts, and matches key inputs against each account's received output
/// set for spend detection. Matches accumulate on the account snapshots;
/// nothing is persisted here.
///
/// `tx_hash` is the hash from the containing block when known (miner
/// transactions have none and it is computed on demand). `output_ids` are
/// the daemon-assigned global ids of this transaction's outputs, in order.
pub fn scan_transaction(
    users: &mut [ScanAccount],
    height: BlockHeight,
    timestamp: u64,
    tx_hash: Option<Hash>,
    tx: &Transaction,
    output_ids: &[u64],
) -> Result<(), ScanError> {
    if tx.version > 2 {
        return Err(ScanError::UnsupportedTxVersion(tx.version));
    }

    // partial parsing of extra is allowed; only a missing pubkey makes the
    // transaction unscannable
    let extra = parse_extra(&tx.extra);
    let Some(tx_public) = extra.tx_public else {
        return Ok(());
    };

    // computed at most once per transaction, on the first match
    let mut tx_hash = tx_hash;
    let mut prefix_hash: Option<Hash> = None;
    let mut payment_id: Option<PaymentId> = None;

    for user in users.iter_mut() {
        if height <= user.scan_height() {
            continue;
        }

        let Some(derivation) = crypto::generate_key_derivation(&tx_public, user.view_key())
        else {
            tracing::warn!(
                account = %user.id(),
                "key derivation failed, skipping account for this tx"
            );
            continue;
        };

        let mut offsets_len = 0;
        for input in &tx.inputs {
            if let TxInput::ToKey {
                key_offsets,
                key_image,
                ..
            } = input
            {
                offsets_len = key_offsets.len();
                user.check_spends(height, key_image, key_offsets);
            }
        }

        let base_tag = if offsets_len == 0 { OUTPUT_COINBASE } else { 0 };
        let ring_size = (offsets_len.max(1) - 1) as u32;

        for (index, out) in tx.outputs.iter().enumerate() {
            let TxOutTarget::ToKey { key } = &out.target else {
                continue;
            };
            let index_u32 = index as u32;

            let derived = crypto::derive_public_key(&derivation, index_u32, user.spend_public());
            if derived.as_ref() != Some(key) {
                continue;
            }

            let mut amount = out.amount;
            let mut mask = Hash::default();
            let mut tag = base_tag;
            if amount == 0 {
                let decoded = tx.rct.as_ref().and_then(|rct| {
                    let commitment = rct.commitments.get(index)?;
                    let ecdh = rct.ecdh_amounts.get(index)?;
                    crypto::decode_ringct_amount(commitment, ecdh, &derivation, index_u32)
                });
                let Some((decoded_amount, decoded_mask)) = decoded else {
                    tracing::warn!(
                        account = %user.id(),
                        index,
                        "failed to decode confidential amount, skipping output"
                    );
                    continue;
                };
                amount = decoded_amount;
                mask = decoded_mask;
                tag |= OUTPUT_RINGCT;
            }

            let prefix_hash = *prefix_hash.get_or_insert_with(|| tx.prefix_hash());
            let tx_hash = *tx_hash.get_or_insert_with(|| tx.hash());
            let payment_id = *payment_id.get_or_insert_with(|| match extra.payment_id {
                None => PaymentId::None,
                Some(ExtraPaymentId::Long(id)) => PaymentId::Long(id),
                Some(ExtraPaymentId::Encrypted(id)) => PaymentId::Short(id),
            });

            let global_id = output_ids
                .get(index)
                .copied()
                .ok_or(ScanError::MissingOutputIndices)?;

            tracing::debug!(
                account = %user.id(),
                tx = %tx_hash,
                amount,
                "found matching output"
            );
            user.add_output(Output {
                height,
                id: OutputId(global_id),
                amount,
                timestamp,
                unlock_time: tx.unlock_time,
                ring_size,
                index: index_u32,
                tx_hash,
                tx_prefix_hash: prefix_hash,
                tx_public,
                ringct_mask: mask,
                extra: PackedExtra::pack(tag, payment_id.packed_len()),
                payment_id,
            });
        }
    }
    Ok(())
}
