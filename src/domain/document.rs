use super::credit::CreditId;
use super::user::UserId;
use crate::error::MarketError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type DocumentId = Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "lowercase", tag = "result", content = "detail")]
pub enum ScanStatus {
    NotScanned,
    Clean,
    Infected(String),
}

/// Supporting evidence attached to a credit.
///
/// Approval happens in two steps: an admin approves, which marks the document
/// `processing`, and the approval job then either tokenizes the credit (the
/// document becomes approved and carries the token id) or records why it
/// could not (rejected, with the failure in `admin_comments`).
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Document {
    pub id: DocumentId,
    pub carbon_credit: CreditId,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub storage_key: String,
    pub upload_date: DateTime<Utc>,
    pub status: DocumentStatus,
    pub processing: bool,
    pub admin_comments: String,
    pub reviewed_by: Option<UserId>,
    pub review_date: Option<DateTime<Utc>>,
    pub scan_status: ScanStatus,
    pub token_id: Option<String>,
}

impl Document {
    pub fn new(carbon_credit: CreditId, file_name: &str, file_type: &str, file_size: u64) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            carbon_credit,
            file_name: file_name.to_string(),
            file_type: file_type.to_string(),
            file_size,
            storage_key: format!("documents/{id}/{file_name}"),
            upload_date: Utc::now(),
            status: DocumentStatus::Pending,
            processing: false,
            admin_comments: String::new(),
            reviewed_by: None,
            review_date: None,
            scan_status: ScanStatus::NotScanned,
            token_id: None,
        }
    }

    /// Fails unless the document is still waiting for a decision.
    fn ensure_reviewable(&self) -> Result<(), MarketError> {
        if self.processing {
            return Err(MarketError::Conflict(format!(
                "Document {} is already being processed",
                self.id
            )));
        }
        if self.status != DocumentStatus::Pending {
            return Err(MarketError::Conflict(format!(
                "Document {} has already been reviewed",
                self.id
            )));
        }
        Ok(())
    }

    /// Records an admin approval and hands the document to the approval job.
    pub fn start_approval(&mut self, reviewer: UserId, comments: &str) -> Result<(), MarketError> {
        self.ensure_reviewable()?;
        self.processing = true;
        self.admin_comments = comments.to_string();
        self.reviewed_by = Some(reviewer);
        self.review_date = Some(Utc::now());
        Ok(())
    }

    /// Puts a document back in the queue when the approval job could not be scheduled.
    pub fn abort_approval(&mut self) {
        self.processing = false;
    }

    pub fn reject(&mut self, reviewer: UserId, comments: &str) -> Result<(), MarketError> {
        self.ensure_reviewable()?;
        if comments.trim().is_empty() {
            return Err(MarketError::validation(
                "A comment is required when rejecting a document",
            ));
        }
        self.status = DocumentStatus::Rejected;
        self.admin_comments = comments.trim().to_string();
        self.reviewed_by = Some(reviewer);
        self.review_date = Some(Utc::now());
        Ok(())
    }

    pub fn complete_approval(&mut self, token_id: String) -> Result<(), MarketError> {
        if token_id.is_empty() {
            return Err(MarketError::DocumentProcessingError(
                "Cannot approve a document without a token id".into(),
            ));
        }
        self.status = DocumentStatus::Approved;
        self.token_id = Some(token_id);
        self.processing = false;
        Ok(())
    }

    pub fn fail_approval(&mut self, reason: &str) {
        self.status = DocumentStatus::Rejected;
        self.admin_comments = format!("Token creation failed: {reason}");
        self.processing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        Document::new(Uuid::new_v4(), "audit.pdf", "application/pdf", 1024)
    }

    #[test]
    fn test_storage_key_layout() {
        let d = doc();
        assert_eq!(d.storage_key, format!("documents/{}/audit.pdf", d.id));
    }

    #[test]
    fn test_approval_flow() {
        let mut d = doc();
        let admin = Uuid::new_v4();
        d.start_approval(admin, "looks good").unwrap();
        assert!(d.processing);
        assert_eq!(d.status, DocumentStatus::Pending);

        // a second approval while the job is in flight is refused
        assert!(matches!(
            d.start_approval(admin, ""),
            Err(MarketError::Conflict(_))
        ));

        assert!(d.complete_approval(String::new()).is_err());
        d.complete_approval("42".into()).unwrap();
        assert_eq!(d.status, DocumentStatus::Approved);
        assert_eq!(d.token_id.as_deref(), Some("42"));
    }

    #[test]
    fn test_failed_approval_records_reason() {
        let mut d = doc();
        d.start_approval(Uuid::new_v4(), "").unwrap();
        d.fail_approval("node unreachable");
        assert_eq!(d.status, DocumentStatus::Rejected);
        assert_eq!(d.admin_comments, "Token creation failed: node unreachable");
        assert!(!d.processing);
    }

    #[test]
    fn test_reject_requires_comment() {
        let mut d = doc();
        assert!(d.reject(Uuid::new_v4(), "  ").is_err());
        d.reject(Uuid::new_v4(), "Missing verifier signature").unwrap();
        assert_eq!(d.status, DocumentStatus::Rejected);
        assert!(d.reject(Uuid::new_v4(), "again").is_err());
    }
}
