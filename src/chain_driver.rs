/// Raw Bitcoin transaction building and vault script handling
///
/// Everything here works on consensus-encoded bytes so that the same
/// transaction can travel through ledger payloads, the tracker store and
/// off-chain jobs unchanged.

use bitcoin::absolute::LockTime;
use bitcoin::consensus::{deserialize, serialize};
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::{self, all::*};
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, PrivateKey, PublicKey, Script, ScriptBuf, ScriptHash, Sequence, Transaction,
    TxIn, TxOut, Txid, Witness,
};

use crate::bitcoin_client::{BitcoinRpc, ConfirmationSource};
use crate::config::FeeConfig;
use crate::types::{Address, Utxo};
use crate::{BridgeError, Result};

/// Confirmations above which a transaction is considered final.
pub const FINALITY_CONFIRMATIONS: u64 = 10;

/// Serialized size is doubled to leave room for unlocking scripts.
pub const FEE_SIZE_MULTIPLIER: u64 = 2;

/// Bytes of randomness pushed in front of every vault script.
pub const MULTISIG_RANDOMNESS_LEN: usize = 4;

/// Largest key set whose vault script stays within [`MAX_REDEEM_SCRIPT_SIZE`].
pub const MAX_MULTISIG_KEYS: usize = 15;

/// Consensus limit on a P2SH redeem script push.
pub const MAX_REDEEM_SCRIPT_SIZE: usize = 520;

/// Push opcode, DER signature of at most 72 bytes and the sighash byte.
const SIGNATURE_PUSH_SIZE: usize = 74;

#[derive(Debug, Clone)]
pub struct ChainDriver {
    fee_rate: u64,
    min_fee_rate: u64,
    max_fee_rate: u64,
}

impl ChainDriver {
    pub fn new(fee_rate: u64, min_fee_rate: u64, max_fee_rate: u64) -> Self {
        Self {
            fee_rate,
            min_fee_rate,
            max_fee_rate,
        }
    }

    pub fn from_config(fees: &FeeConfig) -> Self {
        Self::new(fees.btc_fee_rate, fees.min_fee_rate, fees.max_fee_rate)
    }

    /// Unsigned lock transaction moving the vault's previous output (if any)
    /// and the user's output into one output paying `lock_script_address`.
    pub fn prepare_lock(
        &self,
        prev_utxo: Option<&Utxo>,
        input: &Utxo,
        lock_script_address: &ScriptHash,
    ) -> Result<Vec<u8>> {
        let mut inputs = Vec::with_capacity(2);
        if let Some(prev) = prev_utxo {
            inputs.push(unsigned_input(prev.txid, prev.vout));
        }
        inputs.push(unsigned_input(input.txid, input.vout));

        let prev_balance = prev_utxo.map_or(0, |u| u.balance);
        let balance = prev_balance + input.balance;

        let mut tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: inputs,
            output: vec![TxOut {
                value: Amount::from_sat(balance),
                script_pubkey: ScriptBuf::new_p2sh(lock_script_address),
            }],
        };

        let fee = self.fee_for(&tx);
        if fee >= balance {
            return Err(BridgeError::InsufficientFunds {
                required: fee,
                available: balance,
            });
        }
        tx.output[0].value = Amount::from_sat(balance - fee);

        log::debug!(
            "Prepared lock tx with {} inputs, output {} sat, fee {} sat",
            tx.input.len(),
            balance - fee,
            fee
        );

        Ok(serialize(&tx))
    }

    /// Unsigned redeem transaction spending the vault output: the remaining
    /// balance goes back to `lock_script_address`, `redeem_amount - fee_sat`
    /// to the user.
    pub fn prepare_redeem(
        &self,
        prev_utxo: &Utxo,
        user_script: &Script,
        redeem_amount: u64,
        fee_sat: u64,
        lock_script_address: &ScriptHash,
    ) -> Result<Vec<u8>> {
        if redeem_amount > prev_utxo.balance {
            return Err(BridgeError::InsufficientFunds {
                required: redeem_amount,
                available: prev_utxo.balance,
            });
        }
        if fee_sat >= redeem_amount {
            return Err(BridgeError::InsufficientFunds {
                required: fee_sat,
                available: redeem_amount,
            });
        }

        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![unsigned_input(prev_utxo.txid, prev_utxo.vout)],
            output: vec![
                TxOut {
                    value: Amount::from_sat(prev_utxo.balance - redeem_amount),
                    script_pubkey: ScriptBuf::new_p2sh(lock_script_address),
                },
                TxOut {
                    value: Amount::from_sat(redeem_amount - fee_sat),
                    script_pubkey: user_script.to_owned(),
                },
            ],
        };

        Ok(serialize(&tx))
    }

    /// Fee for a redeem spending `prev_utxo`, priced on the transaction's size
    /// once the unlocking script for `vault_script` is in place.
    pub fn redeem_fee(
        &self,
        prev_utxo: &Utxo,
        user_script: &Script,
        lock_script_address: &ScriptHash,
        vault_script: &Script,
    ) -> Result<u64> {
        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![unsigned_input(prev_utxo.txid, prev_utxo.vout)],
            output: vec![
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: ScriptBuf::new_p2sh(lock_script_address),
                },
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: user_script.to_owned(),
                },
            ],
        };
        Ok(self.fee_rate * estimate_tx_size(&tx, Some(vault_script))? as u64)
    }

    /// Puts the multisig unlocking script on the vault input of a lock. A lock
    /// with a single input has no vault input and is returned untouched.
    pub fn add_lock_signature(&self, tx_bytes: &[u8], sig_script: ScriptBuf) -> Result<Transaction> {
        let mut tx: Transaction = deserialize(tx_bytes)?;
        if tx.input.len() > 1 {
            tx.input[0].script_sig = sig_script;
        }
        Ok(tx)
    }

    /// Puts the multisig unlocking script on a redeem's only input, the vault output.
    pub fn add_redeem_signature(&self, tx_bytes: &[u8], sig_script: ScriptBuf) -> Result<Transaction> {
        let mut tx: Transaction = deserialize(tx_bytes)?;
        if tx.input.len() != 1 {
            return Err(BridgeError::TxMismatch(format!(
                "redeem must spend only the vault output, found {} inputs",
                tx.input.len()
            )));
        }
        tx.input[0].script_sig = sig_script;
        Ok(tx)
    }

    /// Puts the user's unlocking script on the user's input, always the last one.
    pub fn add_user_lock_signature(&self, tx_bytes: &[u8], sig_script: ScriptBuf) -> Result<Transaction> {
        let mut tx: Transaction = deserialize(tx_bytes)?;
        let input = tx
            .input
            .last_mut()
            .ok_or_else(|| BridgeError::TxMismatch("transaction has no inputs".to_string()))?;
        input.script_sig = sig_script;
        Ok(tx)
    }

    pub fn broadcast_tx(&self, tx: &Transaction, rpc: &dyn BitcoinRpc) -> Result<Txid> {
        rpc.send_raw_transaction(tx)
    }

    pub async fn check_finality(&self, txid: &Txid, source: &dyn ConfirmationSource) -> Result<bool> {
        let confirmations = source.confirmations(txid).await?;
        Ok(confirmations > FINALITY_CONFIRMATIONS)
    }

    /// `vault_script` is the script of the vault output `tx` spends, `None`
    /// when it spends no vault output.
    pub fn fee_rate_within_bounds(&self, tx: &Transaction, input_total: u64, vault_script: Option<&Script>) -> bool {
        let output_total: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
        let Some(fees) = input_total.checked_sub(output_total) else {
            return false;
        };
        let size = match estimate_tx_size(tx, vault_script) {
            Ok(size) => size,
            Err(e) => {
                log::warn!("Cannot size transaction: {}", e);
                return false;
            }
        };
        let per_byte = fees / size as u64;
        per_byte >= self.min_fee_rate && per_byte <= self.max_fee_rate
    }

    fn fee_for(&self, tx: &Transaction) -> u64 {
        self.fee_rate * serialize(tx).len() as u64 * FEE_SIZE_MULTIPLIER
    }
}

fn unsigned_input(txid: Txid, vout: u32) -> TxIn {
    TxIn {
        previous_output: OutPoint::new(txid, vout),
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

fn push_bytes(bytes: &[u8]) -> Result<PushBytesBuf> {
    PushBytesBuf::try_from(bytes.to_vec()).map_err(|e| BridgeError::InvalidScript(e.to_string()))
}

/// Size of `tx` once the unlocking script for `vault_script` is in place.
pub fn estimate_tx_size(tx: &Transaction, vault_script: Option<&Script>) -> Result<usize> {
    let size = serialize(tx).len();
    match vault_script {
        Some(script) => {
            let sig_script = multisig_sig_script_size(script)?;
            // The empty script_sig already counts one length byte.
            Ok(size + sig_script + compact_size_len(sig_script) - 1)
        }
        None => Ok(size),
    }
}

/// Upper bound of `OP_0 <sig_1> .. <sig_m> <redeem_script>` for `redeem_script`.
pub fn multisig_sig_script_size(redeem_script: &Script) -> Result<usize> {
    let (m, _) = parse_multisig_script(redeem_script)?;
    let len = redeem_script.len();
    let push_prefix = match len {
        0..=75 => 1,
        76..=255 => 2,
        _ => 3,
    };
    Ok(1 + SIGNATURE_PUSH_SIZE * m + push_prefix + len)
}

fn compact_size_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        _ => 5,
    }
}

/// M-of-N redeem script over `pubkeys` sorted by encoding, prefixed by
/// `<randomness> OP_DROP` so equal key sets still produce distinct addresses.
/// Returns the script, its P2SH hash and the ordered signer addresses.
pub fn create_multisig_address(
    m: usize,
    pubkeys: &[PublicKey],
    randomness: &[u8],
) -> Result<(ScriptBuf, ScriptHash, Vec<Address>)> {
    let mut keys = pubkeys.to_vec();
    keys.sort_by_key(|k| k.to_bytes());
    keys.dedup();

    if keys.is_empty() || m == 0 || m > keys.len() || keys.len() > MAX_MULTISIG_KEYS {
        return Err(BridgeError::InvalidMultisig {
            threshold: m,
            signers: keys.len(),
        });
    }
    if randomness.len() != MULTISIG_RANDOMNESS_LEN {
        return Err(BridgeError::InvalidScript(format!(
            "randomness must be {} bytes, got {}",
            MULTISIG_RANDOMNESS_LEN,
            randomness.len()
        )));
    }

    let mut builder = Builder::new()
        .push_slice(push_bytes(randomness)?)
        .push_opcode(OP_DROP)
        .push_int(m as i64);
    for key in &keys {
        builder = builder.push_key(key);
    }
    let script = builder
        .push_int(keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script();
    if script.len() > MAX_REDEEM_SCRIPT_SIZE {
        return Err(BridgeError::InvalidScript(format!(
            "redeem script is {} bytes, limit is {}",
            script.len(),
            MAX_REDEEM_SCRIPT_SIZE
        )));
    }

    let address = script.script_hash();
    let signers = keys.iter().map(Address::from_btc_pubkey).collect();

    Ok((script, address, signers))
}

/// Threshold and ordered keys of a script built by [`create_multisig_address`].
pub fn parse_multisig_script(script: &Script) -> Result<(usize, Vec<PublicKey>)> {
    let invalid = |reason: &str| BridgeError::InvalidScript(reason.to_string());

    let mut instructions = Vec::new();
    for instruction in script.instructions() {
        instructions.push(instruction.map_err(|e| BridgeError::InvalidScript(e.to_string()))?);
    }

    let body = match instructions.as_slice() {
        [Instruction::PushBytes(_), Instruction::Op(op), rest @ ..] if *op == OP_DROP => rest,
        all => all,
    };

    let (first, rest) = body.split_first().ok_or_else(|| invalid("empty script"))?;
    let m = small_int(first).ok_or_else(|| invalid("missing threshold"))?;

    let (last, rest) = rest.split_last().ok_or_else(|| invalid("truncated script"))?;
    if !matches!(last, Instruction::Op(op) if *op == OP_CHECKMULTISIG) {
        return Err(invalid("not a multisig script"));
    }

    let (count, key_pushes) = rest.split_last().ok_or_else(|| invalid("missing key count"))?;
    let n = small_int(count).ok_or_else(|| invalid("missing key count"))?;

    let mut keys = Vec::with_capacity(key_pushes.len());
    for push in key_pushes {
        match push {
            Instruction::PushBytes(bytes) => keys.push(
                PublicKey::from_slice(bytes.as_bytes())
                    .map_err(|e| BridgeError::InvalidScript(e.to_string()))?,
            ),
            _ => return Err(invalid("unexpected opcode among keys")),
        }
    }

    if keys.len() != n || m == 0 || m > n {
        return Err(BridgeError::InvalidMultisig {
            threshold: m,
            signers: keys.len(),
        });
    }

    Ok((m, keys))
}

fn small_int(instruction: &Instruction) -> Option<usize> {
    match instruction {
        Instruction::Op(op) => {
            let code = op.to_u8();
            let first = OP_PUSHNUM_1.to_u8();
            let last = OP_PUSHNUM_16.to_u8();
            (first..=last).contains(&code).then(|| (code - first + 1) as usize)
        }
        _ => None,
    }
}

/// `OP_0 <sig_1> .. <sig_m> <redeem_script>`
pub fn build_sig_script(signatures: &[&[u8]], m: usize, redeem_script: &Script) -> Result<ScriptBuf> {
    if signatures.len() < m {
        return Err(BridgeError::MissingSignature(format!(
            "{} of {} signatures",
            signatures.len(),
            m
        )));
    }

    let mut builder = Builder::new().push_opcode(opcodes::OP_0);
    for sig in signatures.iter().take(m) {
        builder = builder.push_slice(push_bytes(sig)?);
    }
    builder = builder.push_slice(push_bytes(redeem_script.as_bytes())?);

    Ok(builder.into_script())
}

/// Legacy SIGHASH_ALL digest of input 0 against `redeem_script`.
pub fn signature_hash(tx: &Transaction, redeem_script: &Script) -> Result<[u8; 32]> {
    let sighash = SighashCache::new(tx)
        .legacy_signature_hash(0, redeem_script, EcdsaSighashType::All.to_u32())
        .map_err(|e| BridgeError::SighashError(e.to_string()))?;
    Ok(sighash.to_byte_array())
}

/// Digest a validator signs for the pending transaction: the vault input's
/// sighash, or the txid when the transaction spends no vault output.
fn vault_digest(tx: &Transaction, redeem_script: Option<&Script>) -> Result<[u8; 32]> {
    match redeem_script {
        Some(script) => signature_hash(tx, script),
        None => Ok(tx.compute_txid().to_byte_array()),
    }
}

pub fn sign_vault_input(tx_bytes: &[u8], redeem_script: Option<&Script>, key: &PrivateKey) -> Result<Vec<u8>> {
    let tx: Transaction = deserialize(tx_bytes)?;
    let msg = Message::from_digest(vault_digest(&tx, redeem_script)?);

    let secp = Secp256k1::signing_only();
    let signature = ecdsa::Signature {
        signature: secp.sign_ecdsa(&msg, &key.inner),
        sighash_type: EcdsaSighashType::All,
    };

    Ok(signature.to_vec())
}

pub fn verify_vault_signature(
    tx_bytes: &[u8],
    redeem_script: Option<&Script>,
    pubkey: &PublicKey,
    signature: &[u8],
) -> Result<()> {
    let tx: Transaction = deserialize(tx_bytes)?;
    let msg = Message::from_digest(vault_digest(&tx, redeem_script)?);

    let signature = ecdsa::Signature::from_slice(signature)
        .map_err(|e| BridgeError::InvalidSignature(e.to_string()))?;

    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&msg, &signature.signature, &pubkey.inner)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{btc_keys, FakeBitcoinRpc, FakeExplorer};

    fn driver() -> ChainDriver {
        ChainDriver::new(70, 20, 70)
    }

    fn txid(b: u8) -> Txid {
        Txid::from_byte_array([b; 32])
    }

    fn vault_script(n: usize) -> (ScriptBuf, ScriptHash, Vec<Address>) {
        let keys: Vec<PublicKey> = btc_keys(n).iter().map(|k| k.public_key(&Secp256k1::new())).collect();
        create_multisig_address(n * 2 / 3 + 1, &keys, &[1, 2, 3, 4]).unwrap()
    }

    #[test]
    fn test_prepare_first_lock() {
        let (_, address, _) = vault_script(4);
        let input = Utxo::new(txid(1), 3, 100_000);

        let bytes = driver().prepare_lock(None, &input, &address).unwrap();
        let tx: Transaction = deserialize(&bytes).unwrap();

        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].previous_output, OutPoint::new(txid(1), 3));
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].script_pubkey, ScriptBuf::new_p2sh(&address));

        let fee = 70 * bytes.len() as u64 * 2;
        assert_eq!(tx.output[0].value.to_sat(), 100_000 - fee);
    }

    #[test]
    fn test_prepare_lock_spends_vault_first() {
        let (_, address, _) = vault_script(4);
        let prev = Utxo::new(txid(7), 0, 50_000);
        let input = Utxo::new(txid(1), 1, 60_000);

        let bytes = driver().prepare_lock(Some(&prev), &input, &address).unwrap();
        let tx: Transaction = deserialize(&bytes).unwrap();

        assert_eq!(tx.input.len(), 2);
        assert_eq!(tx.input[0].previous_output, OutPoint::new(txid(7), 0));
        assert_eq!(tx.input[1].previous_output, OutPoint::new(txid(1), 1));
        let fee = 70 * bytes.len() as u64 * 2;
        assert_eq!(tx.output[0].value.to_sat(), 110_000 - fee);
    }

    #[test]
    fn test_prepare_lock_rejects_dust() {
        let (_, address, _) = vault_script(4);
        let input = Utxo::new(txid(1), 0, 1_000);
        assert!(matches!(
            driver().prepare_lock(None, &input, &address),
            Err(BridgeError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_prepare_redeem_outputs() {
        let (_, address, _) = vault_script(4);
        let prev = Utxo::new(txid(7), 0, 80_000);
        let user = ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::all_zeros());

        let bytes = driver().prepare_redeem(&prev, &user, 30_000, 5_000, &address).unwrap();
        let tx: Transaction = deserialize(&bytes).unwrap();

        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.output[0].value.to_sat(), 50_000);
        assert_eq!(tx.output[1].value.to_sat(), 25_000);
        assert_eq!(tx.output[1].script_pubkey, user);

        assert!(driver().prepare_redeem(&prev, &user, 90_000, 5_000, &address).is_err());
        assert!(driver().prepare_redeem(&prev, &user, 5_000, 5_000, &address).is_err());
    }

    #[test]
    fn test_multisig_script_roundtrip_and_randomness() {
        let secp = Secp256k1::new();
        let keys: Vec<PublicKey> = btc_keys(4).iter().map(|k| k.public_key(&secp)).collect();

        let (script_a, address_a, signers) = create_multisig_address(3, &keys, &[1, 1, 1, 1]).unwrap();
        let (_, address_b, _) = create_multisig_address(3, &keys, &[2, 2, 2, 2]).unwrap();
        assert_ne!(address_a, address_b);

        let (m, parsed) = parse_multisig_script(&script_a).unwrap();
        assert_eq!(m, 3);
        let parsed_signers: Vec<Address> = parsed.iter().map(Address::from_btc_pubkey).collect();
        assert_eq!(parsed_signers, signers);

        let mut sorted = signers.clone();
        sorted.sort();
        assert_eq!(sorted, signers);

        assert!(create_multisig_address(5, &keys, &[0; 4]).is_err());
        assert!(parse_multisig_script(&ScriptBuf::new_p2sh(&address_a)).is_err());
    }

    #[test]
    fn test_vault_signature_verifies() {
        let secp = Secp256k1::new();
        let keys = btc_keys(4);
        let pubkeys: Vec<PublicKey> = keys.iter().map(|k| k.public_key(&secp)).collect();
        let (script, address, _) = create_multisig_address(3, &pubkeys, &[9; 4]).unwrap();

        let prev = Utxo::new(txid(7), 0, 50_000);
        let bytes = driver()
            .prepare_lock(Some(&prev), &Utxo::new(txid(1), 0, 60_000), &address)
            .unwrap();

        let sig = sign_vault_input(&bytes, Some(&script), &keys[0]).unwrap();
        assert!(verify_vault_signature(&bytes, Some(&script), &pubkeys[0], &sig).is_ok());
        assert!(verify_vault_signature(&bytes, Some(&script), &pubkeys[1], &sig).is_err());
        // A txid attestation is not a valid input signature.
        let attestation = sign_vault_input(&bytes, None, &keys[0]).unwrap();
        assert!(verify_vault_signature(&bytes, Some(&script), &pubkeys[0], &attestation).is_err());
        assert!(verify_vault_signature(&bytes, None, &pubkeys[0], &attestation).is_ok());
    }

    #[test]
    fn test_sig_script_and_injection() {
        let secp = Secp256k1::new();
        let keys = btc_keys(4);
        let pubkeys: Vec<PublicKey> = keys.iter().map(|k| k.public_key(&secp)).collect();
        let (script, address, _) = create_multisig_address(3, &pubkeys, &[9; 4]).unwrap();

        let sigs: Vec<Vec<u8>> = (0..4u8).map(|i| vec![0x30, i]).collect();
        let refs: Vec<&[u8]> = sigs.iter().map(|s| s.as_slice()).collect();

        let sig_script = build_sig_script(&refs, 3, &script).unwrap();
        let pushes: Vec<_> = sig_script.instructions().collect::<std::result::Result<_, _>>().unwrap();
        assert_eq!(pushes.len(), 5);
        assert!(build_sig_script(&refs[..2], 3, &script).is_err());

        let first = driver().prepare_lock(None, &Utxo::new(txid(1), 0, 60_000), &address).unwrap();
        let untouched = driver().add_lock_signature(&first, sig_script.clone()).unwrap();
        assert!(untouched.input[0].script_sig.is_empty());

        let user = ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::all_zeros());
        let redeem = driver()
            .prepare_redeem(&Utxo::new(txid(3), 0, 80_000), &user, 30_000, 5_000, &address)
            .unwrap();
        let signed_redeem = driver().add_redeem_signature(&redeem, sig_script.clone()).unwrap();
        assert_eq!(signed_redeem.input[0].script_sig, sig_script);
        assert!(driver().add_redeem_signature(&first, sig_script.clone()).is_ok());

        let second = driver()
            .prepare_lock(Some(&Utxo::new(txid(2), 0, 5_000)), &Utxo::new(txid(1), 0, 60_000), &address)
            .unwrap();
        let signed = driver().add_lock_signature(&second, sig_script.clone()).unwrap();
        assert_eq!(signed.input[0].script_sig, sig_script);

        let user_signed = driver().add_user_lock_signature(&second, ScriptBuf::from(vec![0x51])).unwrap();
        assert!(user_signed.input[0].script_sig.is_empty());
        assert_eq!(user_signed.input[1].script_sig, ScriptBuf::from(vec![0x51]));
    }

    #[test]
    fn test_fee_rate_bounds() {
        let (_, address, _) = vault_script(4);
        let input = Utxo::new(txid(1), 0, 100_000);
        let bytes = driver().prepare_lock(None, &input, &address).unwrap();
        let tx: Transaction = deserialize(&bytes).unwrap();

        // Prepared at 70 sat/byte over twice the size: above the upper bound.
        assert!(!driver().fee_rate_within_bounds(&tx, 100_000, None));
        let size = estimate_tx_size(&tx, None).unwrap() as u64;
        let output = tx.output[0].value.to_sat();
        assert!(driver().fee_rate_within_bounds(&tx, output + 30 * size, None));
        assert!(!driver().fee_rate_within_bounds(&tx, output + 10 * size, None));
        assert!(!driver().fee_rate_within_bounds(&tx, output - 1, None));

        let not_multisig = ScriptBuf::new_p2sh(&address);
        assert!(estimate_tx_size(&tx, Some(&not_multisig)).is_err());
        assert!(!driver().fee_rate_within_bounds(&tx, output + 30 * size, Some(&not_multisig)));
    }

    #[test]
    fn test_sig_script_estimate_follows_key_set() {
        let (small, _, _) = vault_script(4);
        let (large, _, _) = vault_script(15);

        // 3-of-4: OP_0, three signatures, then a PUSHDATA1 of the 145 byte script.
        assert_eq!(small.len(), 9 + 34 * 4);
        assert_eq!(multisig_sig_script_size(&small).unwrap(), 1 + 74 * 3 + 2 + small.len());
        // 11-of-15: the script needs PUSHDATA2.
        assert_eq!(multisig_sig_script_size(&large).unwrap(), 1 + 74 * 11 + 3 + large.len());

        let bytes = driver()
            .prepare_lock(Some(&Utxo::new(txid(2), 0, 50_000)), &Utxo::new(txid(1), 0, 60_000), &vault_script(4).1)
            .unwrap();
        let tx: Transaction = deserialize(&bytes).unwrap();
        let base = estimate_tx_size(&tx, None).unwrap();
        let with_small = estimate_tx_size(&tx, Some(&small)).unwrap();
        let with_large = estimate_tx_size(&tx, Some(&large)).unwrap();
        assert_eq!(with_small, base + multisig_sig_script_size(&small).unwrap() + 2);
        assert!(with_large > with_small);

        // A signed transaction is never larger than the estimate.
        let sigs: Vec<Vec<u8>> = (0..3).map(|_| vec![0x30; 72]).collect();
        let refs: Vec<&[u8]> = sigs.iter().map(|s| s.as_slice()).collect();
        let sig_script = build_sig_script(&refs, 3, &small).unwrap();
        let signed = driver().add_lock_signature(&bytes, sig_script).unwrap();
        assert!(serialize(&signed).len() <= with_small);
    }

    #[test]
    fn test_multisig_address_limits() {
        let secp = Secp256k1::new();
        let keys: Vec<PublicKey> = btc_keys(16).iter().map(|k| k.public_key(&secp)).collect();

        let (script, _, signers) = create_multisig_address(11, &keys[..15], &[7; 4]).unwrap();
        assert_eq!(signers.len(), 15);
        assert!(script.len() <= MAX_REDEEM_SCRIPT_SIZE);

        assert!(matches!(
            create_multisig_address(11, &keys, &[7; 4]),
            Err(BridgeError::InvalidMultisig { signers: 16, .. })
        ));
        assert!(matches!(
            create_multisig_address(3, &keys[..4], &[7; 3]),
            Err(BridgeError::InvalidScript(_))
        ));
        assert!(matches!(
            create_multisig_address(11, &keys[..15], &[7; 40]),
            Err(BridgeError::InvalidScript(_))
        ));
    }

    #[test]
    fn test_redeem_fee_within_bounds() {
        let prev = Utxo::new(txid(7), 0, 200_000);
        let user = ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::all_zeros());

        let (script, address, _) = vault_script(4);
        let fee = driver().redeem_fee(&prev, &user, &address, &script).unwrap();
        let bytes = driver().prepare_redeem(&prev, &user, 100_000, fee, &address).unwrap();
        let tx: Transaction = deserialize(&bytes).unwrap();
        assert!(driver().fee_rate_within_bounds(&tx, prev.balance, Some(&script)));

        let (large, _, _) = vault_script(15);
        assert!(driver().redeem_fee(&prev, &user, &address, &large).unwrap() > fee);
        assert!(driver().redeem_fee(&prev, &user, &address, &ScriptBuf::new()).is_err());
    }

    #[test]
    fn test_broadcast_goes_through_rpc() {
        let rpc = FakeBitcoinRpc::default();
        let (_, address, _) = vault_script(4);
        let bytes = driver().prepare_lock(None, &Utxo::new(txid(1), 0, 60_000), &address).unwrap();
        let tx: Transaction = deserialize(&bytes).unwrap();

        let sent = driver().broadcast_tx(&tx, &rpc).unwrap();
        assert_eq!(sent, tx.compute_txid());
        assert_eq!(rpc.sent().len(), 1);

        rpc.set_failing(true);
        assert!(driver().broadcast_tx(&tx, &rpc).unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_check_finality_threshold() {
        let explorer = FakeExplorer::default();
        let id = txid(5);

        explorer.set_confirmations(id, 10);
        assert!(!driver().check_finality(&id, &explorer).await.unwrap());
        explorer.set_confirmations(id, 11);
        assert!(driver().check_finality(&id, &explorer).await.unwrap());
        assert!(driver().check_finality(&txid(6), &explorer).await.is_err());
    }
}
