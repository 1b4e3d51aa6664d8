//! Per-worker account state used during scanning.
//!
//! A [`ScanAccount`] is a snapshot of a stored account plus the outputs and
//! spends matched since the last commit. Identity fields are fixed at
//! construction; only scan progress and the uncommitted lists change. Each
//! worker owns its snapshots exclusively, so nothing here is shared.

use crate::crypto::{KeyImage, PublicKey, SecretKey};
use crate::db::data::{self, AccountId, BlockHeight, Output, OutputId, Spend};

/// Tracks a subset of stored account info for scanning and updating.
#[derive(Debug, Clone)]
pub struct ScanAccount {
    id: AccountId,
    address: data::AccountAddress,
    view_key: SecretKey,
    scan_height: BlockHeight,
    /// Global ids of all outputs ever received, sorted for spend matching.
    received: Vec<OutputId>,
    outputs: Vec<Output>,
    spends: Vec<(OutputId, Spend)>,
}

impl ScanAccount {
    /// Construct from a stored account and its received output ids.
    pub fn new(source: &data::Account, mut received: Vec<OutputId>) -> Self {
        received.sort_unstable();
        ScanAccount {
            id: source.id,
            address: source.address,
            view_key: source.view_key,
            scan_height: source.scan_height,
            received,
            outputs: Vec::new(),
            spends: Vec::new(),
        }
    }

    /// Unique id from the account database.
    pub fn id(&self) -> AccountId {
        self.id
    }

    /// Address used for store lookups.
    pub fn address(&self) -> &data::AccountAddress {
        &self.address
    }

    /// Public key outputs are derived against.
    pub fn spend_public(&self) -> &PublicKey {
        &self.address.spend_public
    }

    /// Secret view key for the account.
    pub fn view_key(&self) -> &SecretKey {
        &self.view_key
    }

    /// Current scan height of this snapshot.
    pub fn scan_height(&self) -> BlockHeight {
        self.scan_height
    }

    /// Outputs matched since the last commit.
    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// Spends matched since the last commit, keyed by the output they spend.
    pub fn spends(&self) -> &[(OutputId, Spend)] {
        &self.spends
    }

    /// Track a newly received output.
    pub fn add_output(&mut self, output: Output) {
        match self.received.binary_search(&output.id) {
            Ok(_) => {}
            Err(position) => self.received.insert(position, output.id),
        }
        self.outputs.push(output);
    }

    /// Record a spend for every delta-encoded ring offset that resolves to
    /// an output this account received.
    pub fn check_spends(
        &mut self,
        height: BlockHeight,
        key_image: &KeyImage,
        key_offsets: &[u64],
    ) {
        let ring_size = (key_offsets.len().max(1) - 1) as u32;
        let mut id = 0u64;
        for offset in key_offsets {
            id = id.wrapping_add(*offset);
            if self.received.binary_search(&OutputId(id)).is_ok() {
                self.spends.push((
                    OutputId(id),
                    Spend {
                        height,
                        key_image: *key_image,
                        ring_size,
                    },
                ));
            }
        }
    }

    /// Flush uncommitted state after a successful store commit.
    pub fn committed(&mut self, new_height: BlockHeight) {
        self.scan_height = new_height;
        self.outputs.clear();
        self.spends.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash;
    use crate::db::data::{AccountAddress, PackedExtra, PaymentId};

    fn sample_account(received: Vec<OutputId>) -> ScanAccount {
        let source = data::Account {
            id: AccountId(1),
            access: 0,
            address: AccountAddress {
                spend_public: PublicKey([1; 32]),
                view_public: PublicKey([2; 32]),
            },
            view_key: SecretKey::from_bytes([3; 32]),
            scan_height: BlockHeight(10),
            start_height: BlockHeight(10),
            creation: 0,
        };
        ScanAccount::new(&source, received)
    }

    fn sample_output(id: u64) -> Output {
        Output {
            height: BlockHeight(11),
            id: OutputId(id),
            amount: 1,
            timestamp: 0,
            unlock_time: 0,
            ring_size: 0,
            index: 0,
            tx_hash: Hash::default(),
            tx_prefix_hash: Hash::default(),
            tx_public: PublicKey([0; 32]),
            ringct_mask: Hash::default(),
            extra: PackedExtra::pack(0, 0),
            payment_id: PaymentId::None,
        }
    }

    #[test]
    fn spend_matching_decodes_relative_offsets() {
        // offsets 100, 20, 3 resolve to absolute ids 100, 120, 123
        let mut account = sample_account(vec![OutputId(120), OutputId(500)]);
        account.check_spends(BlockHeight(12), &KeyImage([9; 32]), &[100, 20, 3]);

        assert_eq!(account.spends().len(), 1);
        let (source, spend) = &account.spends()[0];
        assert_eq!(*source, OutputId(120));
        assert_eq!(spend.key_image, KeyImage([9; 32]));
        assert_eq!(spend.ring_size, 2);
        assert_eq!(spend.height, BlockHeight(12));
    }

    #[test]
    fn new_outputs_become_spendable_within_the_same_scan() {
        let mut account = sample_account(Vec::new());
        account.add_output(sample_output(42));
        account.check_spends(BlockHeight(12), &KeyImage([9; 32]), &[42]);

        assert_eq!(account.spends().len(), 1);
        // single-offset ring has ring size zero under the mixin convention
        assert_eq!(account.spends()[0].1.ring_size, 0);
    }

    #[test]
    fn committed_flushes_progress_but_keeps_received_set() {
        let mut account = sample_account(Vec::new());
        account.add_output(sample_output(42));
        account.committed(BlockHeight(20));

        assert_eq!(account.scan_height(), BlockHeight(20));
        assert!(account.outputs().is_empty());
        assert!(account.spends().is_empty());

        // the received set survives the flush for future spend detection
        account.check_spends(BlockHeight(21), &KeyImage([1; 32]), &[42]);
        assert_eq!(account.spends().len(), 1);
    }
}
