//! Recovery of purchases interrupted between reservation and completion.
//!
//! A crash or an unknown transfer outcome can leave a transaction in flight
//! with its quantity held back from the listing. The reconciler asks the chain
//! whether the transfer under the transaction's idempotency key happened and
//! either completes the transaction or releases the reservation.
//!
//! Document approvals whose job was lost, for instance to a restart, are put
//! back on the job queue by the same pass.

use super::jobs::{Job, JobQueue};
use super::settlement::{SettlementService, Transition};
use crate::config::ReconciliationConfig;
use crate::domain::document::DocumentStatus;
use crate::domain::ports::{DocumentStoreRef, TransactionStoreRef};
use crate::domain::transaction::SettlementStep;
use crate::error::Result;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub completed: usize,
    pub released: usize,
    /// Approvals put back on the job queue.
    pub requeued: usize,
}

pub struct Reconciler {
    transactions: TransactionStoreRef,
    documents: DocumentStoreRef,
    settlement: Arc<SettlementService>,
    jobs: JobQueue,
    config: ReconciliationConfig,
}

impl Reconciler {
    pub fn new(
        transactions: TransactionStoreRef,
        documents: DocumentStoreRef,
        settlement: Arc<SettlementService>,
        jobs: JobQueue,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            transactions,
            documents,
            settlement,
            jobs,
            config,
        }
    }

    /// Queues an approval job for every document still marked as processing.
    ///
    /// Jobs already queued or running are not duplicated, and the mint key is
    /// stable, so replaying an approval never mints twice.
    pub async fn resume_approvals(&self) -> Result<usize> {
        let mut requeued = 0;
        for document in self.documents.get_all().await? {
            if !document.processing || document.status != DocumentStatus::Pending {
                continue;
            }
            match self.jobs.enqueue(Job::ApproveDocument(document.id)).await {
                Ok(true) => {
                    info!(document = %document.id, "approval job resumed");
                    requeued += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(document = %document.id, error = %e, "could not resume approval job"),
            }
        }
        Ok(requeued)
    }

    /// Settles every in-flight transaction older than the grace period and
    /// resumes stranded approvals.
    pub async fn run_once(&self) -> Result<ReconciliationReport> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.grace_secs as i64);
        let stale: Vec<_> = self
            .transactions
            .get_all()
            .await?
            .into_iter()
            .filter(|tx| tx.step.is_in_flight() && tx.updated_at <= cutoff)
            .collect();

        let mut report = ReconciliationReport::default();
        for tx in stale {
            let id = tx.id;
            if self.settlement.is_live(id).await {
                continue;
            }
            let outcome = match self.settlement.lookup_transfer(&tx).await {
                Ok(Some(hash)) => self.settlement.complete(tx, hash).await,
                Ok(None) => {
                    self.settlement
                        .compensate(tx, "Transfer was not executed before the settlement deadline")
                        .await
                }
                Err(e) => Err(e),
            };
            match outcome {
                Ok(Transition::Applied(tx)) if tx.step == SettlementStep::Completed => {
                    report.completed += 1
                }
                Ok(Transition::Applied(_)) => report.released += 1,
                Ok(Transition::AlreadySettled(_)) => {}
                Err(e) => error!(tx = %id, error = %e, "failed to reconcile transaction"),
            }
        }
        report.requeued = self.resume_approvals().await?;
        if report != ReconciliationReport::default() {
            info!(
                completed = report.completed,
                released = report.released,
                requeued = report.requeued,
                "reconciliation pass finished"
            );
        }
        Ok(report)
    }

    /// Runs [`Reconciler::run_once`] every `interval_secs` until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    error!(error = %e, "reconciliation pass failed");
                }
            }
        })
    }
}
