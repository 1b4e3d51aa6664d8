//! Curve and hash primitives used for output detection.
//!
//! These are the view-side operations only: deriving the shared secret for a
//! transaction, recovering one-time output keys, and decoding confidential
//! amounts. Spend authority never enters this process.

use std::sync::OnceLock;

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use sha3::{Digest, Keccak256};

/// Keccak-256 digest of `data`.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn keccak256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Unsigned LEB128 encoding, used in hash domains and the tx digest.
pub(crate) fn varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

macro_rules! hex_bytes {
    ($name:ident, $len:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Parse from a hex string of exactly the right length.
            pub fn from_hex(s: &str) -> Option<Self> {
                let bytes = hex::decode(s).ok()?;
                let bytes: [u8; $len] = bytes.try_into().ok()?;
                Some(Self(bytes))
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
                Self::from_hex(&s)
                    .ok_or_else(|| serde::de::Error::custom(concat!("invalid ", stringify!($name))))
            }
        }
    };
}

hex_bytes!(Hash, 32, "A 32-byte hash (block, transaction or long payment id).");
hex_bytes!(Hash8, 8, "An 8-byte hash; the encrypted short payment id form.");
hex_bytes!(PublicKey, 32, "A compressed curve point.");
hex_bytes!(KeyImage, 32, "Key image tagging the spend of a one-time output key.");
hex_bytes!(
    KeyDerivation,
    32,
    "Shared secret point between a transaction key and a view key."
);

/// A private scalar. The view key doubles as the API credential for its
/// account, so this type never exposes its bytes through `Debug`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    /// Wrap raw scalar bytes. Validity is checked at point of use.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        SecretKey(bytes)
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes: [u8; 32] = hex::decode(s).ok()?.try_into().ok()?;
        Some(SecretKey(bytes))
    }

    /// Raw scalar bytes, for durable storage.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn scalar(&self) -> Option<Scalar> {
        Scalar::from_canonical_bytes(self.0).into()
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(_)")
    }
}

/// Pedersen commitment base for confidential amounts.
fn commitment_base() -> &'static EdwardsPoint {
    static BASE: OnceLock<EdwardsPoint> = OnceLock::new();
    BASE.get_or_init(|| {
        let bytes =
            hex::decode("8b655970153799af2aeadc9ff1add0ea6c7251d54154cfa92c173a0dd39c1f94")
                .expect("valid hex constant");
        CompressedEdwardsY(bytes.try_into().expect("32 bytes"))
            .decompress()
            .expect("valid point constant")
    })
}

/// Public key corresponding to `secret`, or `None` if the scalar is not
/// canonical. This is the view-key authentication check: the result must
/// equal the address's view public key.
pub fn secret_key_to_public_key(secret: &SecretKey) -> Option<PublicKey> {
    let scalar = secret.scalar()?;
    Some(PublicKey(
        EdwardsPoint::mul_base(&scalar).compress().to_bytes(),
    ))
}

/// Shared secret between `public` and `secret`: the receiver computes this
/// from the transaction public key and its view key, matching what the
/// sender computed from the recipient's view public key and the tx secret.
pub fn generate_key_derivation(public: &PublicKey, secret: &SecretKey) -> Option<KeyDerivation> {
    let point = CompressedEdwardsY(public.0).decompress()?;
    let scalar = secret.scalar()?;
    let shared = (point * scalar).mul_by_cofactor();
    Some(KeyDerivation(shared.compress().to_bytes()))
}

/// Scalar bound to `derivation` and the output's position in its transaction.
pub fn derivation_to_scalar(derivation: &KeyDerivation, index: u32) -> Scalar {
    let digest = keccak256_parts(&[&derivation.0, &varint(u64::from(index))]);
    Scalar::from_bytes_mod_order(digest)
}

/// One-time output key expected at `index` for the holder of `spend_public`.
/// An output whose key equals this value belongs to the scanned account.
pub fn derive_public_key(
    derivation: &KeyDerivation,
    index: u32,
    spend_public: &PublicKey,
) -> Option<PublicKey> {
    let base = CompressedEdwardsY(spend_public.0).decompress()?;
    let scalar = derivation_to_scalar(derivation, index);
    let derived = EdwardsPoint::mul_base(&scalar) + base;
    Some(PublicKey(derived.compress().to_bytes()))
}

fn amount_key(shared: &Scalar) -> [u8; 8] {
    let digest = keccak256_parts(&[b"amount", shared.as_bytes()]);
    digest[..8].try_into().expect("8 bytes")
}

fn commitment_mask(shared: &Scalar) -> Scalar {
    Scalar::from_bytes_mod_order(keccak256_parts(&[b"commitment_mask", shared.as_bytes()]))
}

fn commit(amount: u64, mask: &Scalar) -> Hash {
    let point = EdwardsPoint::mul_base(mask) + commitment_base() * Scalar::from(amount);
    Hash(point.compress().to_bytes())
}

/// Decode a confidential amount.
///
/// Recovers `(amount, mask)` from the ECDH-encoded amount and verifies the
/// result against the output's Pedersen commitment. Returns `None` when the
/// commitment does not open, meaning the output was not actually addressed
/// to this derivation.
pub fn decode_ringct_amount(
    commitment: &Hash,
    ecdh_amount: &Hash8,
    derivation: &KeyDerivation,
    index: u32,
) -> Option<(u64, Hash)> {
    let shared = derivation_to_scalar(derivation, index);
    let key = amount_key(&shared);
    let mut amount_bytes = ecdh_amount.0;
    for (byte, k) in amount_bytes.iter_mut().zip(key.iter()) {
        *byte ^= k;
    }
    let amount = u64::from_le_bytes(amount_bytes);
    let mask = commitment_mask(&shared);
    if commit(amount, &mask) != *commitment {
        return None;
    }
    Some((amount, Hash(mask.to_bytes())))
}

/// Encode `amount` the way a sending wallet would: the deterministic mask
/// and XOR-encoded amount for the given derivation and output index.
/// Returns `(commitment, ecdh_amount)`.
pub fn encode_ringct_amount(
    amount: u64,
    derivation: &KeyDerivation,
    index: u32,
) -> (Hash, Hash8) {
    let shared = derivation_to_scalar(derivation, index);
    let mask = commitment_mask(&shared);
    let key = amount_key(&shared);
    let mut amount_bytes = amount.to_le_bytes();
    for (byte, k) in amount_bytes.iter_mut().zip(key.iter()) {
        *byte ^= k;
    }
    (commit(amount, &mask), Hash8(amount_bytes))
}

/// Decrypt a short payment id carried in a transaction's extra field.
pub fn decrypt_payment_id(
    encrypted: &Hash8,
    tx_public: &PublicKey,
    view_key: &SecretKey,
) -> Option<Hash8> {
    const PAYMENT_ID_TAIL: u8 = 0x8d;
    let derivation = generate_key_derivation(tx_public, view_key)?;
    let key = keccak256_parts(&[&derivation.0, &[PAYMENT_ID_TAIL]]);
    let mut out = encrypted.0;
    for (byte, k) in out.iter_mut().zip(key.iter()) {
        *byte ^= k;
    }
    Some(Hash8(out))
}
