//! Durable record types and their packed layouts.
//!
//! Every record has a fixed-size little-endian layout written explicitly so
//! the on-disk format is independent of struct layout and host endianness.
//! Table keys (big-endian, ordering-stable) are built in the storage layer.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::crypto::{Hash, Hash8, KeyImage, PublicKey, SecretKey};

/// References an account stored in the database, cheaper than by address.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct AccountId(pub u32);

impl AccountId {
    /// Never a real account id.
    pub const INVALID: AccountId = AccountId(u32::MAX);
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// References a block height. Height 0 is the genesis block.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct BlockHeight(pub u64);

impl std::fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// References a global output number, as assigned by the daemon.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct OutputId(pub u64);

impl std::fmt::Display for OutputId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Seconds since the UNIX epoch, in the storage range.
pub type AccountTime = u32;

/// Lifecycle state of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Actively scanned and reported by the API.
    Active = 0,
    /// Not scanned, but still reported by the API.
    Inactive = 1,
    /// Not scanned or reported; soft-deleted.
    Hidden = 2,
}

impl AccountStatus {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AccountStatus::Active),
            1 => Some(AccountStatus::Inactive),
            2 => Some(AccountStatus::Hidden),
            _ => None,
        }
    }
}

/// Kind of a pending operator request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// Add a new account.
    Create = 0,
    /// Roll an existing account back for a full re-scan.
    ImportScan = 1,
}

impl RequestType {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RequestType::Create),
            1 => Some(RequestType::ImportScan),
            _ => None,
        }
    }
}

/// The two public curve points forming an account address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountAddress {
    /// Key with spend authority; the scanner only ever sees the public half.
    pub spend_public: PublicKey,
    /// Key outputs are detected against.
    pub view_public: PublicKey,
}

impl AccountAddress {
    pub(crate) const ENCODED_LEN: usize = 64;

    pub(crate) fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0; Self::ENCODED_LEN];
        out[..32].copy_from_slice(&self.spend_public.0);
        out[32..].copy_from_slice(&self.view_public.0);
        out
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        Some(AccountAddress {
            spend_public: PublicKey(bytes[..32].try_into().expect("32 bytes")),
            view_public: PublicKey(bytes[32..].try_into().expect("32 bytes")),
        })
    }
}

/// A registered account.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    /// Last time the account's info was served over the API.
    pub access: AccountTime,
    pub address: AccountAddress,
    /// Doubles as the API authorization credential.
    pub view_key: SecretKey,
    /// Last block scanned for this account.
    pub scan_height: BlockHeight,
    /// Block the account started scanning at. Never exceeds `scan_height`.
    pub start_height: BlockHeight,
    /// Time the account first appeared in the database.
    pub creation: AccountTime,
}

impl Account {
    pub(crate) const ENCODED_LEN: usize = 4 + 4 + 64 + 32 + 8 + 8 + 4;

    pub(crate) fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.id.0)?;
        writer.write_u32::<LittleEndian>(self.access)?;
        writer.write_all(&self.address.to_bytes())?;
        writer.write_all(self.view_key.as_bytes())?;
        writer.write_u64::<LittleEndian>(self.scan_height.0)?;
        writer.write_u64::<LittleEndian>(self.start_height.0)?;
        writer.write_u32::<LittleEndian>(self.creation)
    }

    pub(crate) fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let id = AccountId(reader.read_u32::<LittleEndian>()?);
        let access = reader.read_u32::<LittleEndian>()?;
        let address = read_address(&mut reader)?;
        let view_key = read_secret(&mut reader)?;
        let scan_height = BlockHeight(reader.read_u64::<LittleEndian>()?);
        let start_height = BlockHeight(reader.read_u64::<LittleEndian>()?);
        let creation = reader.read_u32::<LittleEndian>()?;
        Ok(Account {
            id,
            access,
            address,
            view_key,
            scan_height,
            start_height,
            creation,
        })
    }
}

/// One entry of the local chain tail.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub height: BlockHeight,
    pub hash: Hash,
}

/// Packed flags-and-length byte stored with every output: a 3-bit tag in
/// the low bits and a 5-bit payment id length above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedExtra(u8);

/// Tag bit: output came from a miner transaction.
pub const OUTPUT_COINBASE: u8 = 0b001;
/// Tag bit: amount was confidential and decoded via the view key.
pub const OUTPUT_RINGCT: u8 = 0b010;

/// Payment id length marker for the 32-byte form, which does not fit the
/// 5-bit field as a literal length.
pub const LONG_PAYMENT_ID_LEN: u8 = 31;
/// Payment id length of the encrypted 8-byte form.
pub const SHORT_PAYMENT_ID_LEN: u8 = 8;

impl PackedExtra {
    /// Pack `tag` (3 bits) and `length` (5 bits) into one byte.
    pub fn pack(tag: u8, length: u8) -> Self {
        debug_assert!(tag <= 0x7);
        debug_assert!(length <= 0x1f);
        PackedExtra((tag & 0x7) | (length << 3))
    }

    /// Recover `(tag, length)`.
    pub fn unpack(self) -> (u8, u8) {
        (self.0 & 0x7, self.0 >> 3)
    }

    /// Whether the output came from a miner transaction.
    pub fn is_coinbase(self) -> bool {
        self.0 & OUTPUT_COINBASE != 0
    }

    /// Whether the amount was confidential.
    pub fn is_ringct(self) -> bool {
        self.0 & OUTPUT_RINGCT != 0
    }
}

/// Payment id attached to an output's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaymentId {
    /// No payment id in the transaction's extra field.
    #[default]
    None,
    /// 8-byte form, stored still encrypted.
    Short(Hash8),
    /// 32-byte plaintext form.
    Long(Hash),
}

impl PaymentId {
    /// Length marker for the packed extra byte.
    pub fn packed_len(self) -> u8 {
        match self {
            PaymentId::None => 0,
            PaymentId::Short(_) => SHORT_PAYMENT_ID_LEN,
            PaymentId::Long(_) => LONG_PAYMENT_ID_LEN,
        }
    }
}

/// An output received by an account.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Output {
    pub height: BlockHeight,
    /// Global output index assigned by the daemon.
    pub id: OutputId,
    pub amount: u64,
    /// Timestamp of the containing block.
    pub timestamp: u64,
    /// Mirrors the chain value; not always a timestamp.
    pub unlock_time: u64,
    /// Decoy count of the transaction that created this output.
    pub ring_size: u32,
    /// Offset within the transaction.
    pub index: u32,
    pub tx_hash: Hash,
    pub tx_prefix_hash: Hash,
    pub tx_public: PublicKey,
    /// Decoded commitment mask; zero for plaintext amounts.
    pub ringct_mask: Hash,
    pub extra: PackedExtra,
    pub payment_id: PaymentId,
}

impl Output {
    pub(crate) const ENCODED_LEN: usize = 8 * 5 + 4 * 2 + 32 * 4 + 1 + 32;

    pub(crate) fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.height.0)?;
        writer.write_u64::<LittleEndian>(self.id.0)?;
        writer.write_u64::<LittleEndian>(self.amount)?;
        writer.write_u64::<LittleEndian>(self.timestamp)?;
        writer.write_u64::<LittleEndian>(self.unlock_time)?;
        writer.write_u32::<LittleEndian>(self.ring_size)?;
        writer.write_u32::<LittleEndian>(self.index)?;
        writer.write_all(&self.tx_hash.0)?;
        writer.write_all(&self.tx_prefix_hash.0)?;
        writer.write_all(&self.tx_public.0)?;
        writer.write_all(&self.ringct_mask.0)?;
        writer.write_u8(self.extra.0)?;
        let mut payment_id = [0u8; 32];
        match self.payment_id {
            PaymentId::None => {}
            PaymentId::Short(id) => payment_id[..8].copy_from_slice(&id.0),
            PaymentId::Long(id) => payment_id.copy_from_slice(&id.0),
        }
        writer.write_all(&payment_id)
    }

    pub(crate) fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let height = BlockHeight(reader.read_u64::<LittleEndian>()?);
        let id = OutputId(reader.read_u64::<LittleEndian>()?);
        let amount = reader.read_u64::<LittleEndian>()?;
        let timestamp = reader.read_u64::<LittleEndian>()?;
        let unlock_time = reader.read_u64::<LittleEndian>()?;
        let ring_size = reader.read_u32::<LittleEndian>()?;
        let index = reader.read_u32::<LittleEndian>()?;
        let mut tx_hash = [0u8; 32];
        reader.read_exact(&mut tx_hash)?;
        let mut tx_prefix_hash = [0u8; 32];
        reader.read_exact(&mut tx_prefix_hash)?;
        let mut tx_public = [0u8; 32];
        reader.read_exact(&mut tx_public)?;
        let mut ringct_mask = [0u8; 32];
        reader.read_exact(&mut ringct_mask)?;
        let extra = PackedExtra(reader.read_u8()?);
        let mut payment_id_bytes = [0u8; 32];
        reader.read_exact(&mut payment_id_bytes)?;
        let payment_id = match extra.unpack().1 {
            0 => PaymentId::None,
            SHORT_PAYMENT_ID_LEN => PaymentId::Short(Hash8(
                payment_id_bytes[..8].try_into().expect("8 bytes"),
            )),
            LONG_PAYMENT_ID_LEN => PaymentId::Long(Hash(payment_id_bytes)),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "invalid payment id length",
                ))
            }
        };
        Ok(Output {
            height,
            id,
            amount,
            timestamp,
            unlock_time,
            ring_size,
            index,
            tx_hash: Hash(tx_hash),
            tx_prefix_hash: Hash(tx_prefix_hash),
            tx_public: PublicKey(tx_public),
            ringct_mask: Hash(ringct_mask),
            extra,
            payment_id,
        })
    }
}

/// A detected spend of a received output, keyed in storage by the
/// [`OutputId`] it spends.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spend {
    /// Block the spending transaction appeared in.
    pub height: BlockHeight,
    pub key_image: KeyImage,
    /// Decoy count of the spending transaction.
    pub ring_size: u32,
}

impl Spend {
    pub(crate) const ENCODED_LEN: usize = 8 + 32 + 4;

    pub(crate) fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.height.0)?;
        writer.write_all(&self.key_image.0)?;
        writer.write_u32::<LittleEndian>(self.ring_size)
    }

    pub(crate) fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let height = BlockHeight(reader.read_u64::<LittleEndian>()?);
        let mut key_image = [0u8; 32];
        reader.read_exact(&mut key_image)?;
        let ring_size = reader.read_u32::<LittleEndian>()?;
        Ok(Spend {
            height,
            key_image: KeyImage(key_image),
            ring_size,
        })
    }
}

/// A pending operator request, keyed in storage by `(kind, address)`.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub address: AccountAddress,
    pub view_key: SecretKey,
    /// Requested scan start.
    pub start_height: BlockHeight,
    /// Time the request was created.
    pub creation: AccountTime,
}

impl PendingRequest {
    pub(crate) fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.address.to_bytes())?;
        writer.write_all(self.view_key.as_bytes())?;
        writer.write_u64::<LittleEndian>(self.start_height.0)?;
        writer.write_u32::<LittleEndian>(self.creation)
    }

    pub(crate) fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let address = read_address(&mut reader)?;
        let view_key = read_secret(&mut reader)?;
        let start_height = BlockHeight(reader.read_u64::<LittleEndian>()?);
        let creation = reader.read_u32::<LittleEndian>()?;
        Ok(PendingRequest {
            address,
            view_key,
            start_height,
            creation,
        })
    }
}

fn read_address<R: Read>(reader: &mut R) -> io::Result<AccountAddress> {
    let mut bytes = [0u8; AccountAddress::ENCODED_LEN];
    reader.read_exact(&mut bytes)?;
    Ok(AccountAddress::from_bytes(&bytes).expect("fixed length"))
}

fn read_secret<R: Read>(reader: &mut R) -> io::Result<SecretKey> {
    let mut bytes = [0u8; 32];
    reader.read_exact(&mut bytes)?;
    Ok(SecretKey::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_address() -> AccountAddress {
        AccountAddress {
            spend_public: PublicKey([1; 32]),
            view_public: PublicKey([2; 32]),
        }
    }

    fn sample_output(payment_id: PaymentId) -> Output {
        let tag = OUTPUT_COINBASE | OUTPUT_RINGCT;
        Output {
            height: BlockHeight(60),
            id: OutputId(1234),
            amount: 1_000_000,
            timestamp: 1_700_000_000,
            unlock_time: 0,
            ring_size: 15,
            index: 2,
            tx_hash: Hash([3; 32]),
            tx_prefix_hash: Hash([4; 32]),
            tx_public: PublicKey([5; 32]),
            ringct_mask: Hash([6; 32]),
            extra: PackedExtra::pack(tag, payment_id.packed_len()),
            payment_id,
        }
    }

    #[test]
    fn packed_extra_round_trips() {
        for tag in 0..=3u8 {
            for length in 0..=31u8 {
                let packed = PackedExtra::pack(tag, length);
                assert_eq!(packed.unpack(), (tag, length));
            }
        }
        assert!(PackedExtra::pack(OUTPUT_COINBASE, 0).is_coinbase());
        assert!(!PackedExtra::pack(OUTPUT_COINBASE, 0).is_ringct());
        assert!(PackedExtra::pack(OUTPUT_RINGCT, 8).is_ringct());
    }

    #[test]
    fn account_codec_round_trips() {
        let account = Account {
            id: AccountId(7),
            access: 100,
            address: sample_address(),
            view_key: SecretKey::from_bytes([9; 32]),
            scan_height: BlockHeight(500),
            start_height: BlockHeight(50),
            creation: 90,
        };
        let mut bytes = Vec::new();
        account.write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), Account::ENCODED_LEN);
        assert_eq!(Account::read(&bytes[..]).unwrap(), account);
    }

    #[test]
    fn output_codec_round_trips_every_payment_id_form() {
        for payment_id in [
            PaymentId::None,
            PaymentId::Short(Hash8([7; 8])),
            PaymentId::Long(Hash([8; 32])),
        ] {
            let output = sample_output(payment_id);
            let mut bytes = Vec::new();
            output.write(&mut bytes).unwrap();
            assert_eq!(bytes.len(), Output::ENCODED_LEN);
            assert_eq!(Output::read(&bytes[..]).unwrap(), output);
        }
    }

    #[test]
    fn spend_and_request_codecs_round_trip() {
        let spend = Spend {
            height: BlockHeight(70),
            key_image: KeyImage([1; 32]),
            ring_size: 10,
        };
        let mut bytes = Vec::new();
        spend.write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), Spend::ENCODED_LEN);
        assert_eq!(Spend::read(&bytes[..]).unwrap(), spend);

        let request = PendingRequest {
            address: sample_address(),
            view_key: SecretKey::from_bytes([2; 32]),
            start_height: BlockHeight(10),
            creation: 40,
        };
        let mut bytes = Vec::new();
        request.write(&mut bytes).unwrap();
        assert_eq!(PendingRequest::read(&bytes[..]).unwrap(), request);
    }

    #[test]
    fn truncated_records_rejected() {
        let account = Account {
            id: AccountId(7),
            access: 100,
            address: sample_address(),
            view_key: SecretKey::from_bytes([9; 32]),
            scan_height: BlockHeight(500),
            start_height: BlockHeight(50),
            creation: 90,
        };
        let mut bytes = Vec::new();
        account.write(&mut bytes).unwrap();
        assert!(Account::read(&bytes[..bytes.len() - 1]).is_err());
    }
}
