/// Escrow vault tracker and its state machine
///
/// A tracker owns one settled vault UTXO (`current_*`) and at most one
/// in-flight Bitcoin transaction (`process_*`). All transitions go through
/// [`Tracker::apply`], which never mutates the stored tracker: it returns the
/// next tracker plus the side effects the caller must carry out.

use std::fmt;

use bitcoin::{ScriptBuf, ScriptHash, Txid};
use serde::{Deserialize, Serialize};

use crate::multisig::BtcMultisig;
use crate::types::{Address, Utxo};
use crate::{BridgeError, Result};

pub const JOB_ID_SEPARATOR: &str = "/";

pub const EVENT_ADD_SIGNATURE: &str = "btc_add_signature";
pub const EVENT_RESET_PENDING: &str = "btc_broadcast_reset_pending";
pub const EVENT_RESET_COMPLETE: &str = "btc_broadcast_reset_complete";
pub const EVENT_FINALITY_PENDING: &str = "btc_finality_vote_pending";
pub const EVENT_FINALITY_COMPLETE: &str = "btc_finality_complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackerState {
    Available,
    BusySigning,
    BusyBroadcasting,
    BusyFinalizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessType {
    None,
    Lock,
    Redeem,
}

/// Off-chain job kinds a tracker can have pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    AddSignature,
    Broadcast,
    CheckFinality,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::AddSignature => "add_signature",
            JobKind::Broadcast => "broadcast",
            JobKind::CheckFinality => "check_finality",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Multisig script and P2SH address the vault moves to after the current round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextVault {
    pub script: ScriptBuf,
    pub address: ScriptHash,
}

#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Lock {
        owner: Address,
        unsigned_tx: Vec<u8>,
        process_balance: u64,
        multisig: BtcMultisig,
    },
    Redeem {
        owner: Address,
        unsigned_tx: Vec<u8>,
        process_balance: u64,
        redeem_amount: u64,
        multisig: BtcMultisig,
    },
    AddSignature {
        signer: Address,
        signature: Vec<u8>,
    },
    BroadcastSuccess {
        txid: Txid,
    },
    ResetVote {
        validator: Address,
        quorum: usize,
    },
    FinalityVote {
        validator: Address,
        owner: Address,
        quorum: usize,
        next_vault: NextVault,
    },
}

/// Work a transition asks the caller to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Credit wrapped BTC to the owner and to the total-supply tally.
    Mint { to: Address, amount: u64 },
    /// Debit wrapped BTC from the owner and from the total-supply tally.
    Burn { from: Address, amount: u64 },
    SaveLockScript { address: ScriptHash, script: ScriptBuf },
    ScheduleJob(JobKind),
    Emit(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracker {
    pub name: String,
    pub state: TrackerState,
    pub multisig: Option<BtcMultisig>,

    pub current_tx_id: Option<Txid>,
    pub current_balance: u64,
    pub current_lock_script_address: Option<ScriptHash>,

    pub process_tx_id: Option<Txid>,
    pub process_balance: u64,
    /// Address the next vault output must pay to.
    pub process_lock_script_address: ScriptHash,
    #[serde(with = "hex")]
    pub process_unsigned_tx: Vec<u8>,
    pub process_owner: Option<Address>,
    pub process_type: ProcessType,

    pub finality_votes: Vec<Address>,
    pub reset_votes: Vec<Address>,
}

impl Tracker {
    /// A never-funded tracker whose first lock pays to `lock_script_address`.
    pub fn new(name: &str, lock_script_address: ScriptHash) -> Self {
        Self {
            name: name.to_string(),
            state: TrackerState::Available,
            multisig: None,
            current_tx_id: None,
            current_balance: 0,
            current_lock_script_address: None,
            process_tx_id: None,
            process_balance: 0,
            process_lock_script_address: lock_script_address,
            process_unsigned_tx: Vec::new(),
            process_owner: None,
            process_type: ProcessType::None,
            finality_votes: Vec::new(),
            reset_votes: Vec::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.state == TrackerState::Available
    }

    pub fn is_busy(&self) -> bool {
        !self.is_available()
    }

    pub fn is_first_lock(&self) -> bool {
        self.current_tx_id.is_none()
    }

    /// Deposit address for the next lock.
    pub fn get_address(&self) -> Result<ScriptHash> {
        if self.is_busy() {
            return Err(BridgeError::TrackerBusy(self.name.clone()));
        }
        Ok(self.process_lock_script_address)
    }

    /// The settled vault output, if the tracker was ever funded.
    pub fn current_utxo(&self) -> Option<Utxo> {
        self.current_tx_id
            .map(|txid| Utxo::new(txid, 0, self.current_balance))
    }

    /// Lock script whose keys sign the current round: the script guarding the
    /// vault input, or the deposit script when there is no vault input yet.
    pub fn signing_script_address(&self) -> ScriptHash {
        self.current_lock_script_address
            .unwrap_or(self.process_lock_script_address)
    }

    pub fn has_enough_signatures(&self) -> bool {
        self.multisig.as_ref().map_or(false, |ms| ms.is_valid())
    }

    pub fn has_signed(&self, signer: &Address) -> bool {
        self.multisig.as_ref().map_or(false, |ms| ms.has_signed(signer))
    }

    pub fn has_voted_finality(&self, validator: &Address) -> bool {
        self.finality_votes.contains(validator)
    }

    pub fn has_voted_reset(&self, validator: &Address) -> bool {
        self.reset_votes.contains(validator)
    }

    pub fn job_id(&self, kind: JobKind) -> String {
        format!("{}{}{}", self.name, JOB_ID_SEPARATOR, kind)
    }

    /// Job a validator should be running for this tracker's current state.
    pub fn next_job(&self) -> Option<JobKind> {
        match self.state {
            TrackerState::Available => None,
            TrackerState::BusySigning => Some(JobKind::AddSignature),
            TrackerState::BusyBroadcasting | TrackerState::BusyFinalizing => Some(JobKind::Broadcast),
        }
    }

    pub fn apply(&self, event: TrackerEvent) -> Result<(Tracker, Vec<Effect>)> {
        let mut next = self.clone();
        let mut effects = Vec::new();

        match event {
            TrackerEvent::Lock {
                owner,
                unsigned_tx,
                process_balance,
                multisig,
            } => {
                self.expect_state("lock", &[TrackerState::Available])?;
                next.begin_process(ProcessType::Lock, owner, unsigned_tx, process_balance, multisig);
                effects.push(Effect::ScheduleJob(JobKind::AddSignature));
            }

            TrackerEvent::Redeem {
                owner,
                unsigned_tx,
                process_balance,
                redeem_amount,
                multisig,
            } => {
                self.expect_state("redeem", &[TrackerState::Available])?;
                if self.is_first_lock() {
                    return Err(BridgeError::TxMismatch(format!("{} holds no vault output", self.name)));
                }
                if redeem_amount > self.current_balance {
                    return Err(BridgeError::InsufficientFunds {
                        required: redeem_amount,
                        available: self.current_balance,
                    });
                }
                next.begin_process(ProcessType::Redeem, owner.clone(), unsigned_tx, process_balance, multisig);
                effects.push(Effect::Burn {
                    from: owner,
                    amount: redeem_amount,
                });
                effects.push(Effect::ScheduleJob(JobKind::AddSignature));
            }

            TrackerEvent::AddSignature { signer, signature } => {
                if self.state != TrackerState::BusySigning {
                    return Err(BridgeError::NotCollectingSignatures);
                }
                let multisig = next
                    .multisig
                    .as_mut()
                    .ok_or_else(|| BridgeError::MultisigMissing(self.name.clone()))?;
                multisig.add_signature(&signer, signature)?;

                if multisig.is_valid() {
                    next.state = TrackerState::BusyBroadcasting;
                    effects.push(Effect::ScheduleJob(JobKind::Broadcast));
                }
                effects.push(Effect::Emit(EVENT_ADD_SIGNATURE));
            }

            TrackerEvent::BroadcastSuccess { txid } => {
                let eligible = self.state == TrackerState::BusyBroadcasting
                    || (self.state == TrackerState::BusySigning && self.has_enough_signatures());
                if !eligible {
                    return Err(self.invalid("report broadcast"));
                }
                next.state = TrackerState::BusyFinalizing;
                next.process_tx_id = Some(txid);
                effects.push(Effect::ScheduleJob(JobKind::CheckFinality));
            }

            TrackerEvent::ResetVote { validator, quorum } => {
                self.expect_state("reset", &[TrackerState::BusyBroadcasting])?;
                if !next.reset_votes.contains(&validator) {
                    next.reset_votes.push(validator);
                }

                if next.reset_votes.len() < quorum {
                    effects.push(Effect::Emit(EVENT_RESET_PENDING));
                } else {
                    if self.process_type == ProcessType::Redeem {
                        if let Some(owner) = &self.process_owner {
                            effects.push(Effect::Mint {
                                to: owner.clone(),
                                amount: self.current_balance.saturating_sub(self.process_balance),
                            });
                        }
                    }
                    next.clear_process();
                    effects.push(Effect::Emit(EVENT_RESET_COMPLETE));
                }
            }

            TrackerEvent::FinalityVote {
                validator,
                owner,
                quorum,
                next_vault,
            } => {
                self.expect_state("finalize", &[TrackerState::BusyFinalizing])?;
                if self.process_owner.as_ref() != Some(&owner) {
                    return Err(BridgeError::NotProcessOwner(owner.to_string()));
                }
                if !next.finality_votes.contains(&validator) {
                    next.finality_votes.push(validator);
                }

                if next.finality_votes.len() < quorum {
                    effects.push(Effect::Emit(EVENT_FINALITY_PENDING));
                } else {
                    if self.process_type == ProcessType::Lock {
                        effects.push(Effect::Mint {
                            to: owner,
                            amount: self.process_balance.saturating_sub(self.current_balance),
                        });
                    }

                    next.current_tx_id = self.process_tx_id;
                    next.current_balance = self.process_balance;
                    next.current_lock_script_address = Some(self.process_lock_script_address);
                    next.process_lock_script_address = next_vault.address;
                    next.clear_process();

                    effects.push(Effect::SaveLockScript {
                        address: next_vault.address,
                        script: next_vault.script,
                    });
                    effects.push(Effect::Emit(EVENT_FINALITY_COMPLETE));
                }
            }
        }

        Ok((next, effects))
    }

    fn begin_process(
        &mut self,
        process_type: ProcessType,
        owner: Address,
        unsigned_tx: Vec<u8>,
        process_balance: u64,
        mut multisig: BtcMultisig,
    ) {
        multisig.msg = unsigned_tx.clone();
        multisig.clear_signatures();

        self.state = TrackerState::BusySigning;
        self.process_type = process_type;
        self.process_owner = Some(owner);
        self.process_unsigned_tx = unsigned_tx;
        self.process_balance = process_balance;
        self.process_tx_id = None;
        self.multisig = Some(multisig);
        self.finality_votes.clear();
        self.reset_votes.clear();
    }

    fn clear_process(&mut self) {
        self.state = TrackerState::Available;
        self.multisig = None;
        self.process_tx_id = None;
        self.process_balance = 0;
        self.process_unsigned_tx.clear();
        self.process_owner = None;
        self.process_type = ProcessType::None;
        self.finality_votes.clear();
        self.reset_votes.clear();
    }

    fn expect_state(&self, action: &'static str, allowed: &[TrackerState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    fn invalid(&self, action: &'static str) -> BridgeError {
        BridgeError::InvalidStateTransition {
            tracker: self.name.clone(),
            action,
            state: self.state,
        }
    }
}
