use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobContext, JobInfo};
use crate::tracker::{JobKind, TrackerState};

/// Watches confirmation depth of a broadcast transaction. Votes are cast by
/// the broadcast job; this one only records what the explorer reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckFinalityJob {
    pub info: JobInfo,
    pub confirmations: u64,
    pub last_checked: Option<DateTime<Utc>>,
}

impl CheckFinalityJob {
    pub fn new(tracker_name: &str) -> Self {
        Self {
            info: JobInfo::new(JobKind::CheckFinality, tracker_name),
            confirmations: 0,
            last_checked: None,
        }
    }

    pub async fn do_my_job(&mut self, ctx: &JobContext) {
        let tracker = match ctx.trackers.get(&self.info.tracker_name) {
            Ok(tracker) => tracker,
            Err(e) => {
                log::error!("Failed to load tracker {}: {}", self.info.tracker_name, e);
                self.info.retry_count += 1;
                return;
            }
        };
        if tracker.state != TrackerState::BusyFinalizing {
            return;
        }
        let Some(txid) = tracker.process_tx_id else {
            return;
        };

        match ctx.explorer.confirmations(&txid).await {
            Ok(confirmations) => {
                if confirmations != self.confirmations {
                    log::debug!("{} has {} confirmations", txid, confirmations);
                }
                self.confirmations = confirmations;
                self.last_checked = Some(Utc::now());
            }
            Err(e) => log::warn!("Confirmation lookup for {} failed: {}", txid, e),
        }
    }

    pub fn is_my_job_done(&self, ctx: &JobContext) -> bool {
        ctx.trackers
            .get(&self.info.tracker_name)
            .map(|t| t.state != TrackerState::BusyFinalizing)
            .unwrap_or(false)
    }
}
