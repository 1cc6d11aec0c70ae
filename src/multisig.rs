/// M-of-N partial signature collection for one pending Bitcoin transaction

use serde::{Deserialize, Serialize};

use crate::types::Address;
use crate::{BridgeError, Result};

/// Signatures required out of `n` validators: `floor(2n/3) + 1`.
pub fn threshold_for(n: usize) -> usize {
    n * 2 / 3 + 1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtcSignature {
    pub index: usize,
    pub address: Address,
    #[serde(with = "hex")]
    pub sign: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtcMultisig {
    /// Unsigned transaction the signatures are collected for.
    #[serde(with = "hex")]
    pub msg: Vec<u8>,
    pub m: usize,
    /// Authorized signers, sorted; a signer's position is its script order.
    pub signers: Vec<Address>,
    /// Recorded signatures, at most one per signer, kept in index order.
    pub signatures: Vec<BtcSignature>,
}

impl BtcMultisig {
    pub fn new(msg: Vec<u8>, m: usize, mut signers: Vec<Address>) -> Result<Self> {
        signers.sort();
        signers.dedup();

        if signers.is_empty() || m == 0 || m > signers.len() {
            return Err(BridgeError::InvalidMultisig {
                threshold: m,
                signers: signers.len(),
            });
        }

        Ok(Self {
            msg,
            m,
            signers,
            signatures: Vec::new(),
        })
    }

    pub fn get_signer_index(&self, address: &Address) -> Result<usize> {
        self.signers
            .binary_search(address)
            .map_err(|_| BridgeError::UnknownSigner(address.to_string()))
    }

    /// Records a signature, replacing any earlier one from the same signer.
    pub fn add_signature(&mut self, address: &Address, sign: Vec<u8>) -> Result<()> {
        let index = self.get_signer_index(address)?;

        let signature = BtcSignature {
            index,
            address: address.clone(),
            sign,
        };

        match self.signatures.binary_search_by_key(&index, |s| s.index) {
            Ok(pos) => self.signatures[pos] = signature,
            Err(pos) => self.signatures.insert(pos, signature),
        }

        Ok(())
    }

    pub fn has_signed(&self, address: &Address) -> bool {
        self.signatures.iter().any(|s| &s.address == address)
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_valid(&self) -> bool {
        self.signatures.len() >= self.m
    }

    pub fn signatures_in_order(&self) -> Vec<&[u8]> {
        self.signatures.iter().map(|s| s.sign.as_slice()).collect()
    }

    /// The first `m` signatures in signer order, as the unlocking script needs them.
    pub fn threshold_signatures(&self) -> Vec<&[u8]> {
        self.signatures
            .iter()
            .take(self.m)
            .map(|s| s.sign.as_slice())
            .collect()
    }

    pub fn clear_signatures(&mut self) {
        self.signatures.clear();
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut multisig: BtcMultisig = serde_json::from_slice(bytes)?;
        let signatures = std::mem::take(&mut multisig.signatures);

        let mut rebuilt = BtcMultisig::new(multisig.msg, multisig.m, multisig.signers)?;
        for signature in signatures {
            rebuilt.add_signature(&signature.address, signature.sign)?;
        }

        Ok(rebuilt)
    }
}
