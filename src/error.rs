use thiserror::Error;

use crate::tracker::TrackerState;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Tracker not found: {0}")]
    TrackerNotFound(String),

    #[error("No tracker available for {0}")]
    NoTrackerAvailable(&'static str),

    #[error("Tracker is busy: {0}")]
    TrackerBusy(String),

    #[error("Tracker not collecting signatures")]
    NotCollectingSignatures,

    #[error("Unknown signer: {0}")]
    UnknownSigner(String),

    #[error("Tracker {tracker} cannot {action} while {state:?}")]
    InvalidStateTransition {
        tracker: String,
        action: &'static str,
        state: TrackerState,
    },

    #[error("Multisig not initialized for tracker {0}")]
    MultisigMissing(String),

    #[error("Invalid multisig parameters: threshold {threshold} of {signers} signers")]
    InvalidMultisig { threshold: usize, signers: usize },

    #[error("Address is not a validator: {0}")]
    NotValidator(String),

    #[error("Process not owned by {0}")]
    NotProcessOwner(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Missing signature for signer {0}")]
    MissingSignature(String),

    #[error("Bitcoin transaction does not match tracker: {0}")]
    TxMismatch(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Currency not found: {0}")]
    CurrencyNotFound(String),

    #[error("Fee error: {0}")]
    Fee(String),

    #[error("Wrong transaction type: {0}")]
    WrongTxType(String),

    #[error("Lock script not found: {0}")]
    LockScriptNotFound(String),

    #[error("Invalid script: {0}")]
    InvalidScript(String),

    #[error("Bitcoin RPC error: {0}")]
    BitcoinRpcError(String),

    #[error("Not enough confirmations: required {required}, got {actual}")]
    NotEnoughConfirmations { required: u64, actual: u64 },

    #[error("Block explorer error: {0}")]
    ExplorerError(String),

    #[error("Transaction submission failed: {0}")]
    SubmitError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Bitcoin error: {0}")]
    BitcoinError(#[from] bitcoin::consensus::encode::Error),

    #[error("Sighash error: {0}")]
    SighashError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Key parse error: {0}")]
    KeyParseError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    HexError(#[from] hex::FromHexError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeError {
    /// External-chain failures: the owning job retries them, they never reject a ledger transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::BitcoinRpcError(_)
                | BridgeError::ExplorerError(_)
                | BridgeError::NetworkError(_)
                | BridgeError::SubmitError(_)
        )
    }
}

impl From<bitcoincore_rpc::Error> for BridgeError {
    fn from(e: bitcoincore_rpc::Error) -> Self {
        BridgeError::BitcoinRpcError(e.to_string())
    }
}

impl From<bitcoin::secp256k1::Error> for BridgeError {
    fn from(e: bitcoin::secp256k1::Error) -> Self {
        BridgeError::InvalidSignature(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
