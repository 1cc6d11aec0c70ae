/// Off-chain validator jobs
///
/// Handlers schedule jobs into a sled-backed queue on the deliver path; the
/// [`JobRunner`] on each validator works them off on a timer. Jobs only
/// observe trackers and submit ledger transactions, they never write tracker
/// state themselves.

pub mod add_signature;
pub mod broadcast;
pub mod check_finality;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::PrivateKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::action::{Fee, RawTx, TxType};
use crate::bitcoin_client::{BitcoinRpc, ConfirmationSource};
use crate::chain_driver::ChainDriver;
use crate::store::{BridgeDatabase, LockScriptStore, TrackerStore};
use crate::tracker::{JobKind, JOB_ID_SEPARATOR};
use crate::types::Address;
use crate::{BridgeError, Result};

pub use add_signature::AddSignatureJob;
pub use broadcast::BroadcastJob;
pub use check_finality::CheckFinalityJob;

/// Internal path through which a validator submits ledger transactions
/// signed with its node key.
#[async_trait]
pub trait TxSubmitter: Send + Sync {
    async fn submit(&self, tx: RawTx) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct InternalBroadcastRequest<'a> {
    raw_tx: &'a RawTx,
}

#[derive(Debug, Deserialize)]
struct InternalBroadcastReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    log: String,
}

/// Posts transactions to the local node's internal broadcast endpoint.
#[derive(Debug, Clone)]
pub struct HttpSubmitter {
    url: String,
    client: reqwest::Client,
}

impl HttpSubmitter {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TxSubmitter for HttpSubmitter {
    async fn submit(&self, tx: RawTx) -> Result<()> {
        let reply: InternalBroadcastReply = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(10))
            .json(&InternalBroadcastRequest { raw_tx: &tx })
            .send()
            .await?
            .json()
            .await?;

        if !reply.ok {
            return Err(BridgeError::SubmitError(format!("{}: {}", tx.tx_type, reply.log)));
        }
        log::debug!("Submitted {} ({})", tx.tx_type, tx.memo);
        Ok(())
    }
}

/// Everything a job needs on one validator.
#[derive(Clone)]
pub struct JobContext {
    pub validator_address: Address,
    pub btc_key: PrivateKey,
    pub trackers: TrackerStore,
    pub lock_scripts: Arc<dyn LockScriptStore>,
    pub chain_driver: ChainDriver,
    pub bitcoin: Arc<dyn BitcoinRpc>,
    pub explorer: Arc<dyn ConfirmationSource>,
    pub submitter: Arc<dyn TxSubmitter>,
    pub max_broadcast_retries: u32,
}

impl JobContext {
    pub fn btc_pubkey(&self) -> bitcoin::PublicKey {
        self.btc_key.public_key(&Secp256k1::new())
    }

    /// This validator's address among multisig signers.
    pub fn signer_address(&self) -> Address {
        Address::from_btc_pubkey(&self.btc_pubkey())
    }

    pub(crate) async fn submit<T: Serialize>(&self, tx_type: TxType, msg: &T, memo: &str) -> Result<()> {
        let raw = RawTx::new(tx_type, msg, Fee::none(), memo)?;
        self.submitter.submit(raw).await
    }
}

/// Bookkeeping shared by every job kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub tracker_name: String,
    pub job_id: String,
    pub retry_count: u32,
    pub done: bool,
    pub created_at: DateTime<Utc>,
}

impl JobInfo {
    pub fn new(kind: JobKind, tracker_name: &str) -> Self {
        Self {
            tracker_name: tracker_name.to_string(),
            job_id: job_id(tracker_name, kind),
            retry_count: 0,
            done: false,
            created_at: Utc::now(),
        }
    }
}

pub fn job_id(tracker_name: &str, kind: JobKind) -> String {
    format!("{}{}{}", tracker_name, JOB_ID_SEPARATOR, kind)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Job {
    AddSignature(AddSignatureJob),
    Broadcast(BroadcastJob),
    CheckFinality(CheckFinalityJob),
}

impl Job {
    pub fn new(kind: JobKind, tracker_name: &str) -> Self {
        match kind {
            JobKind::AddSignature => Job::AddSignature(AddSignatureJob::new(tracker_name)),
            JobKind::Broadcast => Job::Broadcast(BroadcastJob::new(tracker_name)),
            JobKind::CheckFinality => Job::CheckFinality(CheckFinalityJob::new(tracker_name)),
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Job::AddSignature(_) => JobKind::AddSignature,
            Job::Broadcast(_) => JobKind::Broadcast,
            Job::CheckFinality(_) => JobKind::CheckFinality,
        }
    }

    pub fn info(&self) -> &JobInfo {
        match self {
            Job::AddSignature(j) => &j.info,
            Job::Broadcast(j) => &j.info,
            Job::CheckFinality(j) => &j.info,
        }
    }

    fn info_mut(&mut self) -> &mut JobInfo {
        match self {
            Job::AddSignature(j) => &mut j.info,
            Job::Broadcast(j) => &mut j.info,
            Job::CheckFinality(j) => &mut j.info,
        }
    }

    pub fn id(&self) -> &str {
        &self.info().job_id
    }

    pub fn is_done(&self) -> bool {
        self.info().done
    }

    pub fn do_finalize(&mut self) {
        self.info_mut().done = true;
    }

    pub async fn do_my_job(&mut self, ctx: &JobContext) {
        match self {
            Job::AddSignature(j) => j.do_my_job(ctx).await,
            Job::Broadcast(j) => j.do_my_job(ctx).await,
            Job::CheckFinality(j) => j.do_my_job(ctx).await,
        }
    }

    /// This validator's part is finished.
    pub fn is_my_job_done(&self, ctx: &JobContext) -> bool {
        match self {
            Job::AddSignature(j) => j.is_my_job_done(ctx),
            Job::Broadcast(j) => j.is_my_job_done(ctx),
            Job::CheckFinality(j) => j.is_my_job_done(ctx),
        }
    }

    /// The network no longer needs this job, whoever did the work.
    pub fn is_sufficient(&self, ctx: &JobContext) -> bool {
        match self {
            Job::AddSignature(j) => j.is_sufficient(ctx),
            Job::Broadcast(j) => j.is_my_job_done(ctx),
            Job::CheckFinality(j) => j.is_my_job_done(ctx),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobStore {
    db: Db,
    jobs: Tree,
}

impl JobStore {
    pub fn new(database: &BridgeDatabase) -> Result<Self> {
        let (db, jobs) = database.tree("jobs")?;
        Ok(Self { db, jobs })
    }

    /// Saves a job under its id, replacing any earlier job for the same tracker and kind.
    pub fn save_job(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.id(), serde_json::to_vec(job)?)?;
        self.db.flush()?;
        log::debug!("Saved job {}", job.id());
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        match self.jobs.get(id)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn delete_job(&self, id: &str) -> Result<()> {
        self.jobs.remove(id)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for item in self.jobs.iter() {
            let (_, value) = item?;
            jobs.push(serde_json::from_slice(&value)?);
        }
        Ok(jobs)
    }
}

/// Works off pending jobs on a fixed interval.
pub struct JobRunner {
    store: JobStore,
    ctx: Arc<JobContext>,
    interval: Duration,
}

impl JobRunner {
    pub fn new(store: JobStore, ctx: Arc<JobContext>, interval: Duration) -> Self {
        Self { store, ctx, interval }
    }

    /// Re-creates jobs for busy trackers that have none queued, e.g. after a restart
    /// with a fresh database for jobs.
    pub fn reschedule_pending(&self) -> Result<usize> {
        let mut scheduled = 0;
        for tracker in self.ctx.trackers.list()? {
            if let Some(kind) = tracker.next_job() {
                let id = tracker.job_id(kind);
                if self.store.get_job(&id)?.is_none() {
                    self.store.save_job(&Job::new(kind, &tracker.name))?;
                    scheduled += 1;
                }
            }
        }
        if scheduled > 0 {
            log::info!("Rescheduled {} jobs for busy trackers", scheduled);
        }
        Ok(scheduled)
    }

    /// One pass over the queue. Returns the number of jobs still pending.
    pub async fn run_once(&self) -> Result<usize> {
        let mut pending = 0;

        for mut job in self.store.list_jobs()? {
            if job.is_done() {
                self.store.delete_job(job.id())?;
                continue;
            }

            job.do_my_job(&self.ctx).await;

            if job.is_my_job_done(&self.ctx) || job.is_sufficient(&self.ctx) {
                job.do_finalize();
                log::debug!("Job {} finished", job.id());
                self.store.delete_job(job.id())?;
            } else {
                self.store.save_job(&job)?;
                pending += 1;
            }
        }

        Ok(pending)
    }

    pub async fn run(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            match self.run_once().await {
                Ok(pending) if pending > 0 => log::debug!("{} jobs pending", pending),
                Ok(_) => {}
                Err(e) => log::error!("Job pass failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::BTC_CURRENCY;
    use crate::testing::{ledger_address, user_key, TestBridge};
    use crate::tracker::{TrackerState, EVENT_FINALITY_COMPLETE, EVENT_RESET_COMPLETE};
    use crate::types::Utxo;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    const TRACKER: &str = "tracker_1";

    fn funding() -> Utxo {
        Utxo::new(Txid::from_byte_array([0xaa; 32]), 1, 50_000)
    }

    async fn run(bridge: &TestBridge, kind: JobKind, validator: usize) -> Job {
        let ctx = bridge.job_context(validator);
        let mut job = Job::new(kind, TRACKER);
        job.do_my_job(&ctx).await;
        job
    }

    async fn sign_round(bridge: &TestBridge, validators: std::ops::Range<usize>) {
        for i in validators {
            run(bridge, JobKind::AddSignature, i).await;
            for (ok, response) in bridge.relay(i) {
                assert!(ok, "{}", response.log);
            }
        }
    }

    #[test]
    fn test_job_store_roundtrip() {
        let bridge = TestBridge::new();
        let store = &bridge.jobs;

        let job = Job::new(JobKind::AddSignature, TRACKER);
        assert_eq!(job.id(), "tracker_1/add_signature");
        store.save_job(&job).unwrap();
        store.save_job(&Job::new(JobKind::Broadcast, TRACKER)).unwrap();

        let loaded = store.get_job("tracker_1/add_signature").unwrap().unwrap();
        assert_eq!(loaded, job);
        assert_eq!(loaded.kind(), JobKind::AddSignature);
        assert_eq!(store.list_jobs().unwrap().len(), 2);

        store.delete_job(job.id()).unwrap();
        assert!(store.get_job(job.id()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_signature_job_signs_once() {
        let bridge = TestBridge::new().with_trackers(1);
        bridge.lock(TRACKER, funding());

        let job = run(&bridge, JobKind::AddSignature, 0).await;
        let submitted = bridge.submitters[0].submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].tx_type, TxType::AddSignature);
        assert_eq!(submitted[0].memo, "tracker_1/add_signature");
        assert!(!job.is_my_job_done(&bridge.job_context(0)));

        bridge.relay(0);
        assert!(job.is_my_job_done(&bridge.job_context(0)));
        assert!(!job.is_sufficient(&bridge.job_context(0)));

        // Already signed: nothing more to submit.
        run(&bridge, JobKind::AddSignature, 0).await;
        assert!(bridge.submitters[0].submitted().is_empty());
    }

    #[tokio::test]
    async fn test_jobs_drive_lock_to_finality() {
        let bridge = TestBridge::new().with_trackers(1);
        let amount = bridge.lock(TRACKER, funding());
        let deposit = bridge.trackers().get(TRACKER).unwrap().process_lock_script_address;

        sign_round(&bridge, 0..3).await;
        assert_eq!(bridge.trackers().get(TRACKER).unwrap().state, TrackerState::BusyBroadcasting);

        run(&bridge, JobKind::Broadcast, 0).await;
        assert_eq!(bridge.rpc.sent().len(), 1);
        let txid = bridge.rpc.sent()[0].compute_txid();
        let (ok, _) = bridge.relay(0).remove(0);
        assert!(ok);

        let tracker = bridge.trackers().get(TRACKER).unwrap();
        assert_eq!(tracker.state, TrackerState::BusyFinalizing);
        assert_eq!(tracker.process_tx_id, Some(txid));

        // Not deep enough yet: no vote.
        bridge.explorer.set_confirmations(txid, 10);
        run(&bridge, JobKind::Broadcast, 1).await;
        assert!(bridge.submitters[1].submitted().is_empty());

        bridge.explorer.set_confirmations(txid, 11);
        let mut last = None;
        for i in 0..3 {
            let job = run(&bridge, JobKind::Broadcast, i).await;
            last = bridge.relay(i).pop();
            assert!(job.is_my_job_done(&bridge.job_context(i)));
        }
        let (ok, response) = last.unwrap();
        assert!(ok, "{}", response.log);
        assert!(response.has_event(EVENT_FINALITY_COMPLETE));

        let tracker = bridge.trackers().get(TRACKER).unwrap();
        assert!(tracker.is_available());
        assert_eq!(tracker.current_tx_id, Some(txid));
        assert_eq!(tracker.current_balance, amount);
        assert_eq!(tracker.current_lock_script_address, Some(deposit));
        assert_ne!(tracker.process_lock_script_address, deposit);
        assert!(bridge.lock_scripts.get_lock_script(&tracker.process_lock_script_address).is_ok());

        let owner = ledger_address(&user_key());
        assert_eq!(bridge.balances.balance_of(&owner, BTC_CURRENCY), amount);
        assert_eq!(bridge.balances.balance_of(&bridge.ctx.total_supply_address, BTC_CURRENCY), amount);
    }

    #[tokio::test]
    async fn test_broadcast_failure_votes_reset() {
        let bridge = TestBridge::new().with_trackers(1);
        bridge.lock(TRACKER, funding());
        sign_round(&bridge, 0..3).await;
        bridge.rpc.set_failing(true);

        for i in 0..3 {
            let mut ctx = bridge.job_context(i);
            ctx.max_broadcast_retries = 2;
            let mut job = Job::new(JobKind::Broadcast, TRACKER);

            job.do_my_job(&ctx).await;
            assert!(bridge.submitters[i].submitted().is_empty());
            assert!(!job.is_my_job_done(&ctx));

            job.do_my_job(&ctx).await;
            assert!(job.is_my_job_done(&ctx));
            assert_eq!(bridge.submitters[i].submitted()[0].tx_type, TxType::FailedBroadcastReset);
        }

        let (ok, _) = bridge.relay(0).remove(0);
        assert!(ok);
        assert_eq!(bridge.trackers().get(TRACKER).unwrap().reset_votes.len(), 1);
        bridge.relay(1);
        let (ok, response) = bridge.relay(2).remove(0);
        assert!(ok);
        assert!(response.has_event(EVENT_RESET_COMPLETE));
        assert_eq!(response.tag("tx.lock_redeem_status"), Some("failure"));

        let tracker = bridge.trackers().get(TRACKER).unwrap();
        assert!(tracker.is_available());
        assert!(tracker.is_first_lock());
        assert_eq!(bridge.balances.balance_of(&ledger_address(&user_key()), BTC_CURRENCY), 0);
    }

    #[tokio::test]
    async fn test_check_finality_job_records_depth() {
        let bridge = TestBridge::new().with_trackers(1);
        bridge.lock(TRACKER, funding());
        sign_round(&bridge, 0..3).await;
        run(&bridge, JobKind::Broadcast, 0).await;
        bridge.relay(0);

        let txid = bridge.rpc.sent()[0].compute_txid();
        bridge.explorer.set_confirmations(txid, 4);

        let job = run(&bridge, JobKind::CheckFinality, 2).await;
        match &job {
            Job::CheckFinality(check) => {
                assert_eq!(check.confirmations, 4);
                assert!(check.last_checked.is_some());
            }
            other => panic!("unexpected job {:?}", other),
        }
        assert!(!job.is_my_job_done(&bridge.job_context(2)));
        assert!(bridge.submitters[2].submitted().is_empty());
    }

    #[tokio::test]
    async fn test_runner_works_off_queue() {
        let bridge = TestBridge::new().with_trackers(1);
        bridge.lock(TRACKER, funding());
        // The lock handler queued the signing job.
        assert!(bridge.jobs.get_job("tracker_1/add_signature").unwrap().is_some());

        let runner = JobRunner::new(bridge.jobs.clone(), Arc::new(bridge.job_context(0)), Duration::from_secs(1));
        assert_eq!(runner.run_once().await.unwrap(), 1);
        bridge.relay(0);
        assert_eq!(runner.run_once().await.unwrap(), 0);
        assert!(bridge.jobs.list_jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reschedule_pending() {
        let bridge = TestBridge::new().with_trackers(2);
        bridge.lock(TRACKER, funding());
        bridge.jobs.delete_job("tracker_1/add_signature").unwrap();

        let runner = JobRunner::new(bridge.jobs.clone(), Arc::new(bridge.job_context(0)), Duration::from_secs(1));
        assert_eq!(runner.reschedule_pending().unwrap(), 1);
        assert_eq!(runner.reschedule_pending().unwrap(), 0);
        assert!(bridge.jobs.get_job("tracker_1/add_signature").unwrap().is_some());
    }
}
