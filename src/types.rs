use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};

use crate::{BridgeError, Result};

/// Raw address bytes, hex encoded on the wire.
///
/// Ledger accounts use `hash160` of the account's secp256k1 key. Multisig signers
/// are identified by their serialized compressed Bitcoin public key, so the
/// lexicographic order of signer addresses is the order of keys in the redeem script.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(#[serde(with = "hex")] Vec<u8>);

impl Address {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Ledger address of a transaction signing key.
    pub fn from_pubkey(pubkey: &secp256k1::PublicKey) -> Self {
        Self(hash160::Hash::hash(&pubkey.serialize()).to_byte_array().to_vec())
    }

    /// Multisig signer address of a validator's Bitcoin key.
    pub fn from_btc_pubkey(pubkey: &bitcoin::PublicKey) -> Self {
        Self(pubkey.to_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", hex::encode(&self.0))
    }
}

impl FromStr for Address {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        Ok(Self(hex::decode(s)?))
    }
}

/// An unspent output, valued in satoshis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub balance: u64,
}

impl Utxo {
    pub fn new(txid: Txid, vout: u32, balance: u64) -> Self {
        Self { txid, vout, balance }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    pub name: String,
    pub decimal: u32,
}

impl Currency {
    pub fn new(name: &str, decimal: u32) -> Self {
        Self {
            name: name.to_string(),
            decimal,
        }
    }

    /// Coin from an amount in the currency's smallest unit.
    pub fn coin_from_unit(&self, amount: u64) -> Coin {
        Coin {
            currency: self.name.clone(),
            amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub currency: String,
    pub amount: u64,
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}
