//! Application layer orchestrating the marketplace workflows.
//!
//! Each service owns one workflow and talks to persistence and external
//! services only through the ports in [`crate::domain::ports`]. Long-running
//! work (document approval, reconciliation) runs on `tokio` tasks fed through
//! channels, so request handlers never wait on it.

pub mod auth;
pub mod credits;
pub mod documents;
pub mod external;
pub mod jobs;
pub mod payments;
pub mod reconciliation;
pub mod settlement;
pub mod users;

use crate::config::MarketConfig;
use crate::domain::ports::{Services, Stores};
use crate::error::Result;
use auth::AuthService;
use credits::CreditService;
use documents::{ApprovalWorker, DocumentService};
use jobs::JobQueue;
use payments::PaymentService;
use reconciliation::Reconciler;
use settlement::SettlementService;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use users::UserService;

/// Every service wired to one set of stores and external services.
///
/// Must be built inside a `tokio` runtime: construction starts the approval
/// workers.
pub struct Marketplace {
    pub auth: AuthService,
    pub users: UserService,
    pub credits: CreditService,
    pub documents: DocumentService,
    pub approvals: Arc<ApprovalWorker>,
    pub settlement: Arc<SettlementService>,
    pub payments: PaymentService,
    pub reconciler: Arc<Reconciler>,
    pub jobs: JobQueue,
    workers: Vec<JoinHandle<()>>,
}

impl Marketplace {
    pub fn new(stores: Stores, services: Services, config: &MarketConfig) -> Self {
        let approvals = Arc::new(ApprovalWorker::new(
            stores.users.clone(),
            stores.credits.clone(),
            stores.documents.clone(),
            services.blockchain.clone(),
            services.notifier.clone(),
            config.settlement.clone(),
        ));
        let (jobs, workers) = JobQueue::start(approvals.clone(), &config.jobs);

        let settlement = Arc::new(SettlementService::new(
            stores.users.clone(),
            stores.credits.clone(),
            stores.transactions.clone(),
            services.blockchain.clone(),
            config.settlement.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            stores.transactions.clone(),
            stores.documents.clone(),
            settlement.clone(),
            jobs.clone(),
            config.reconciliation.clone(),
        ));

        Self {
            auth: AuthService::new(
                stores.users.clone(),
                stores.sessions.clone(),
                config.auth.clone(),
            ),
            users: UserService::new(stores.users.clone(), stores.sessions.clone()),
            credits: CreditService::new(
                stores.credits.clone(),
                services.blockchain.clone(),
                config.settlement.clone(),
            ),
            documents: DocumentService::new(
                stores.users.clone(),
                stores.credits.clone(),
                stores.documents.clone(),
                services.storage.clone(),
                services.notifier.clone(),
                jobs.clone(),
                config.documents.clone(),
            ),
            payments: PaymentService::new(&stores, &services, config),
            approvals,
            settlement,
            reconciler,
            jobs,
            workers,
        }
    }

    /// Re-queues approvals interrupted by a previous shutdown or crash.
    pub async fn resume(&self) -> Result<usize> {
        self.reconciler.resume_approvals().await
    }

    /// Starts the periodic reconciliation task.
    pub fn start_reconciler(&self) -> JoinHandle<()> {
        self.reconciler.clone().spawn()
    }

    /// Stops accepting jobs and waits for queued ones to finish.
    pub async fn shutdown(self) {
        let workers = self.workers;
        drop(self.documents);
        drop(self.reconciler);
        drop(self.jobs);
        for worker in workers {
            let _ = worker.await;
        }
        info!("marketplace stopped");
    }
}
