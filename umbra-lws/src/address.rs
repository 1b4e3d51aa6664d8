//! Base58 account address encoding.
//!
//! An address is `base58(tag || spend_public || view_public || checksum)`
//! where the tag byte selects the network and the checksum is the first
//! four bytes of the Keccak-256 of everything before it.

use crate::config::Network;
use crate::crypto::{keccak256, PublicKey};
use crate::db::data::AccountAddress;
use crate::error::Error;

const CHECKSUM_LEN: usize = 4;
const DECODED_LEN: usize = 1 + 64 + CHECKSUM_LEN;

/// Encode `address` for `network`.
pub fn encode(address: &AccountAddress, network: Network) -> String {
    let mut data = Vec::with_capacity(DECODED_LEN);
    data.push(network.address_tag());
    data.extend_from_slice(&address.spend_public.0);
    data.extend_from_slice(&address.view_public.0);
    let checksum = keccak256(&data);
    data.extend_from_slice(&checksum[..CHECKSUM_LEN]);
    bs58::encode(data).into_string()
}

/// Decode an address string, requiring it to belong to `network`.
pub fn decode(s: &str, network: Network) -> Result<AccountAddress, Error> {
    let data = bs58::decode(s).into_vec().map_err(|_| Error::BadAddress)?;
    if data.len() != DECODED_LEN {
        return Err(Error::BadAddress);
    }
    let (body, checksum) = data.split_at(data.len() - CHECKSUM_LEN);
    if keccak256(body)[..CHECKSUM_LEN] != *checksum {
        return Err(Error::BadAddress);
    }
    if Network::from_address_tag(body[0]) != Some(network) {
        return Err(Error::BadAddress);
    }
    let spend_public = PublicKey(body[1..33].try_into().expect("32 bytes"));
    let view_public = PublicKey(body[33..65].try_into().expect("32 bytes"));
    Ok(AccountAddress {
        spend_public,
        view_public,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::random_keypair;

    fn sample_address() -> AccountAddress {
        let (_, spend_public) = random_keypair();
        let (_, view_public) = random_keypair();
        AccountAddress {
            spend_public,
            view_public,
        }
    }

    #[test]
    fn round_trip() {
        let address = sample_address();
        let encoded = encode(&address, Network::Mainnet);
        let decoded = decode(&encoded, Network::Mainnet).unwrap();
        assert_eq!(decoded, address);
    }

    #[test]
    fn wrong_network_rejected() {
        let address = sample_address();
        let encoded = encode(&address, Network::Testnet);
        assert!(matches!(
            decode(&encoded, Network::Mainnet),
            Err(Error::BadAddress)
        ));
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let address = sample_address();
        let mut encoded = encode(&address, Network::Mainnet).into_bytes();
        let last = encoded.last_mut().unwrap();
        *last = if *last == b'2' { b'3' } else { b'2' };
        let corrupted = String::from_utf8(encoded).unwrap();
        assert!(matches!(
            decode(&corrupted, Network::Mainnet),
            Err(Error::BadAddress)
        ));
    }

    #[test]
    fn garbage_rejected() {
        assert!(matches!(
            decode("not-an-address", Network::Mainnet),
            Err(Error::BadAddress)
        ));
        assert!(matches!(decode("", Network::Mainnet), Err(Error::BadAddress)));
    }
}
