//! Supporting documents: upload with virus scanning, admin review, and the
//! approval job that tokenizes the credit a document vouches for.

use super::credits::{mint_request, update_credit};
use super::external::with_retry;
use super::jobs::{Job, JobHandler, JobQueue};
use crate::config::{DocumentConfig, SettlementConfig};
use crate::domain::credit::{CarbonCredit, CreditId, CreditStatus};
use crate::domain::document::{Document, DocumentId, DocumentStatus, ScanStatus};
use crate::domain::ports::{
    BlockchainRef, CreditStoreRef, DocumentStoreRef, Notification, NotifierRef, ObjectStorageRef,
    UserStoreRef,
};
use crate::domain::user::{Role, User, UserId};
use crate::error::{MarketError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewAction {
    Approve,
    Reject,
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub carbon_credit: CreditId,
    pub file_name: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

async fn notify_user(users: &UserStoreRef, notifier: &NotifierRef, user: UserId, subject: String, body: String) {
    let recipient = match users.get(user).await {
        Ok(Some(user)) => user.email,
        Ok(None) => return,
        Err(e) => {
            warn!(%user, error = %e, "could not look up notification recipient");
            return;
        }
    };
    let notice = Notification {
        to: recipient,
        subject,
        body,
    };
    if let Err(e) = notifier.notify(notice).await {
        warn!(%user, error = %e, "failed to send notification");
    }
}

pub struct DocumentService {
    users: UserStoreRef,
    credits: CreditStoreRef,
    documents: DocumentStoreRef,
    storage: ObjectStorageRef,
    notifier: NotifierRef,
    queue: JobQueue,
    config: DocumentConfig,
}

impl DocumentService {
    pub fn new(
        users: UserStoreRef,
        credits: CreditStoreRef,
        documents: DocumentStoreRef,
        storage: ObjectStorageRef,
        notifier: NotifierRef,
        queue: JobQueue,
        config: DocumentConfig,
    ) -> Self {
        Self {
            users,
            credits,
            documents,
            storage,
            notifier,
            queue,
            config,
        }
    }

    async fn credit(&self, id: CreditId) -> Result<CarbonCredit> {
        self.credits
            .get(id)
            .await?
            .ok_or_else(|| MarketError::not_found(format!("Credit {id}")))
    }

    async fn load(&self, id: DocumentId) -> Result<Document> {
        self.documents
            .get(id)
            .await?
            .ok_or_else(|| MarketError::not_found(format!("Document {id}")))
    }

    fn validate_upload(&self, upload: &Upload) -> Result<()> {
        let name = upload.file_name.trim();
        if name.is_empty() || name.contains(|c: char| c == '/' || c == '\\') || name.starts_with('.') {
            return Err(MarketError::validation("Invalid file name"));
        }
        if upload.content.is_empty() {
            return Err(MarketError::validation("File is empty"));
        }
        if upload.content.len() as u64 > self.config.max_upload_bytes {
            return Err(MarketError::validation(format!(
                "File exceeds the {} byte limit",
                self.config.max_upload_bytes
            )));
        }
        if !self
            .config
            .allowed_content_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&upload.content_type))
        {
            return Err(MarketError::validation(format!(
                "File type {} is not allowed",
                upload.content_type
            )));
        }
        Ok(())
    }

    /// Scans and stores a file for one of the uploader's credits.
    ///
    /// Nothing is written unless the scan comes back clean.
    pub async fn upload(&self, user: &User, upload: Upload) -> Result<Document> {
        user.require_role(&[Role::Seller, Role::Admin])?;
        let credit = self.credit(upload.carbon_credit).await?;
        if credit.owner != user.id && !user.is_admin() {
            return Err(MarketError::forbidden(
                "Documents can only be attached to your own credits",
            ));
        }
        self.validate_upload(&upload)?;

        let scan = self.storage.scan(&upload.content).await.map_err(|e| match e {
            MarketError::SecurityError(_) => e,
            other => MarketError::SecurityError(format!("Virus scan failed: {other}")),
        })?;
        if let ScanStatus::Infected(threat) = &scan {
            warn!(user = %user.id, file = %upload.file_name, %threat, "infected upload rejected");
            return Err(MarketError::SecurityError(format!(
                "File failed virus scan: {threat}"
            )));
        }

        let mut document = Document::new(
            credit.id,
            upload.file_name.trim(),
            &upload.content_type,
            upload.content.len() as u64,
        );
        document.scan_status = scan;
        self.storage
            .store(&document.storage_key, upload.content, &upload.content_type)
            .await
            .map_err(|e| match e {
                MarketError::StorageError(_) => e,
                other => MarketError::StorageError(other.to_string()),
            })?;
        self.documents.store(document.clone()).await?;
        info!(document = %document.id, credit = %credit.id, size = document.file_size, "document uploaded");

        notify_user(
            &self.users,
            &self.notifier,
            credit.owner,
            "Document received".into(),
            format!(
                "{} was uploaded for {} and is awaiting review.",
                document.file_name, credit.project_name
            ),
        )
        .await;
        Ok(document)
    }

    /// Admins see every document, sellers those attached to their credits.
    pub async fn list(&self, user: &User) -> Result<Vec<Document>> {
        let mut documents = self.documents.get_all().await?;
        if !user.is_admin() {
            let owned: Vec<CreditId> = self
                .credits
                .get_all()
                .await?
                .into_iter()
                .filter(|c| c.owner == user.id)
                .map(|c| c.id)
                .collect();
            documents.retain(|d| owned.contains(&d.carbon_credit));
        }
        documents.sort_by(|a, b| b.upload_date.cmp(&a.upload_date));
        Ok(documents)
    }

    pub async fn get(&self, user: &User, id: DocumentId) -> Result<Document> {
        let document = self.load(id).await?;
        if !user.is_admin() && self.credit(document.carbon_credit).await?.owner != user.id {
            return Err(MarketError::not_found(format!("Document {id}")));
        }
        Ok(document)
    }

    /// A time-limited link to the stored file.
    pub async fn download_url(&self, user: &User, id: DocumentId) -> Result<String> {
        let document = self.get(user, id).await?;
        self.storage
            .signed_url(&document.storage_key, self.config.download_url_ttl())
            .await
    }

    /// Records an admin decision.
    ///
    /// Rejection is immediate. Approval marks the document as processing and
    /// queues the tokenization job; the final status arrives when it finishes.
    pub async fn review(
        &self,
        admin: &User,
        id: DocumentId,
        action: ReviewAction,
        comments: &str,
    ) -> Result<Document> {
        admin.require_role(&[Role::Admin])?;
        let mut document = self.load(id).await?;

        match action {
            ReviewAction::Reject => {
                document.reject(admin.id, comments)?;
                self.documents.store(document.clone()).await?;
                info!(document = %id, admin = %admin.id, "document rejected");
            }
            ReviewAction::Approve => {
                document.start_approval(admin.id, comments)?;
                self.documents.store(document.clone()).await?;
                if let Err(e) = self.queue.enqueue(Job::ApproveDocument(id)).await {
                    error!(document = %id, error = %e, "failed to queue approval");
                    document.abort_approval();
                    self.documents.store(document).await?;
                    return Err(MarketError::DocumentProcessingError(format!(
                        "Could not schedule approval: {e}"
                    )));
                }
                info!(document = %id, admin = %admin.id, "document approval queued");
            }
        }

        if let Ok(credit) = self.credit(document.carbon_credit).await {
            let outcome = match action {
                ReviewAction::Approve => "approved and is being processed",
                ReviewAction::Reject => "rejected",
            };
            notify_user(
                &self.users,
                &self.notifier,
                credit.owner,
                format!("Document {outcome}"),
                format!("{} was {outcome}. {comments}", document.file_name),
            )
            .await;
        }
        Ok(document)
    }
}

/// Runs approval jobs: mints the credit's token and settles the document.
pub struct ApprovalWorker {
    users: UserStoreRef,
    credits: CreditStoreRef,
    documents: DocumentStoreRef,
    blockchain: BlockchainRef,
    notifier: NotifierRef,
    config: SettlementConfig,
}

impl ApprovalWorker {
    pub fn new(
        users: UserStoreRef,
        credits: CreditStoreRef,
        documents: DocumentStoreRef,
        blockchain: BlockchainRef,
        notifier: NotifierRef,
        config: SettlementConfig,
    ) -> Self {
        Self {
            users,
            credits,
            documents,
            blockchain,
            notifier,
            config,
        }
    }

    /// Tokenizes and verifies the credit behind `document`, returning the token id.
    async fn tokenize(&self, document: &Document) -> Result<String> {
        let credit = self
            .credits
            .get(document.carbon_credit)
            .await?
            .ok_or_else(|| MarketError::not_found(format!("Credit {}", document.carbon_credit)))?;
        if credit.status == CreditStatus::Retired {
            return Err(MarketError::Conflict("Credit is retired".into()));
        }
        let owner = self
            .users
            .get(credit.owner)
            .await?
            .ok_or_else(|| MarketError::not_found(format!("User {}", credit.owner)))?;
        let request = mint_request(&credit, owner.wallet()?, &document.storage_key)?;

        let chain = &self.blockchain;
        let receipt = with_retry(&self.config, "mint", || chain.mint(request.clone())).await?;
        let token_id = receipt.token_id;
        update_credit(
            &self.credits,
            credit.id,
            self.config.max_reservation_attempts,
            |c| {
                if c.token_id.as_deref() != Some(token_id.as_str()) {
                    c.tokenize(token_id.clone());
                }
                if c.status != CreditStatus::Retired {
                    c.set_status(CreditStatus::Verified);
                }
                Ok(())
            },
        )
        .await?;
        info!(credit = %credit.id, token = %token_id, tx = %receipt.tx_hash, "credit tokenized on approval");
        Ok(token_id)
    }

    pub async fn process_approval(&self, id: DocumentId) -> Result<()> {
        let Some(mut document) = self.documents.get(id).await? else {
            warn!(document = %id, "approval job for unknown document");
            return Ok(());
        };
        if !document.processing || document.status != DocumentStatus::Pending {
            info!(document = %id, "document no longer awaiting approval, skipping");
            return Ok(());
        }

        let outcome = match self.tokenize(&document).await {
            Ok(token_id) => document.complete_approval(token_id),
            Err(e) => Err(e),
        };
        let (subject, body) = match &outcome {
            Ok(()) => {
                info!(document = %id, token = ?document.token_id, "document approved");
                (
                    "Document approved".to_string(),
                    format!("{} was approved and your credits are now listed.", document.file_name),
                )
            }
            Err(e) => {
                error!(document = %id, error = %e, "document approval failed");
                document.fail_approval(&e.to_string());
                (
                    "Document approval failed".to_string(),
                    format!("{}: {}", document.file_name, document.admin_comments),
                )
            }
        };
        self.documents.store(document.clone()).await?;

        if let Ok(Some(credit)) = self.credits.get(document.carbon_credit).await {
            notify_user(&self.users, &self.notifier, credit.owner, subject, body).await;
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for ApprovalWorker {
    async fn handle(&self, job: Job) -> Result<()> {
        match job {
            Job::ApproveDocument(id) => self.process_approval(id).await,
        }
    }
}
