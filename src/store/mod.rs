//! Relational persistence.
//!
//! Every state change a recipient can race on is a single conditional
//! update inside the store, so two callers can never both observe success.

use crate::layout::FieldDiff;
use crate::models;
use crate::schema::{DocumentStatus, SigningStatus};

mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(diesel::result::Error),
    #[error("unable to get DB pool connection: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("database task failed: {0}")]
    Task(String),
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::DatabaseError(diesel::result::DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::Conflict(info.message().to_string())
            }
            err => StoreError::Db(err),
        }
    }
}

/// Outcome of a conditional request transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Commit {
    Committed(models::SigningRequest),
    /// Someone else moved the request first; this is its current state.
    Lost(models::SigningRequest),
    Missing,
}

/// The final state a signature commit writes.
#[derive(Debug, Clone)]
pub struct SignedRecord {
    pub signed_at: chrono::DateTime<chrono::Utc>,
    pub signature_url: Option<String>,
    pub signed_file_url: String,
    pub values: Vec<models::FieldValue>,
}

#[rocket::async_trait]
pub trait Store: Send + Sync {
    async fn profile(&self, id: uuid::Uuid) -> Result<Option<models::Profile>, StoreError>;

    /// Case-insensitive lookup by email.
    async fn profile_by_email(&self, email: &str) -> Result<Option<models::Profile>, StoreError>;

    async fn document(&self, id: uuid::Uuid) -> Result<Option<models::Document>, StoreError>;

    async fn insert_document(&self, document: models::Document, activity: models::ActivityLog) -> Result<(), StoreError>;

    /// Deletes a document that is still a draft. Returns false otherwise.
    async fn delete_draft_document(&self, id: uuid::Uuid) -> Result<bool, StoreError>;

    /// Moves a document from `from` to `to`; false if it was not in `from`.
    async fn transition_document(&self, id: uuid::Uuid, from: DocumentStatus, to: DocumentStatus) -> Result<bool, StoreError>;

    /// Fields of a document in placement order.
    async fn fields(&self, document_id: uuid::Uuid) -> Result<Vec<models::DocumentField>, StoreError>;

    /// Applies a layout diff while the document is a draft. Returns false if
    /// the document has left the draft state.
    async fn replace_fields(&self, document_id: uuid::Uuid, diff: FieldDiff, activity: models::ActivityLog) -> Result<bool, StoreError>;

    async fn request(&self, id: uuid::Uuid) -> Result<Option<models::SigningRequest>, StoreError>;

    async fn request_by_token(&self, token: &str) -> Result<Option<models::SigningRequest>, StoreError>;

    async fn requests_for_document(&self, document_id: uuid::Uuid) -> Result<Vec<models::SigningRequest>, StoreError>;

    /// Inserts new requests, moves a draft document to pending and records
    /// the activity, all at once.
    async fn insert_requests(&self, requests: Vec<models::SigningRequest>, activity: models::ActivityLog) -> Result<(), StoreError>;

    /// `pending -> viewed`. The activity is recorded only by the caller that
    /// performs the transition.
    async fn mark_viewed(&self, id: uuid::Uuid, activity: models::ActivityLog) -> Result<bool, StoreError>;

    /// `pending|viewed -> signed` together with the submitted field values.
    async fn commit_signature(&self, id: uuid::Uuid, record: SignedRecord) -> Result<Commit, StoreError>;

    /// `pending|viewed -> cancelled`, recording the activity on success.
    async fn cancel_request(&self, id: uuid::Uuid, activity: models::ActivityLog) -> Result<Commit, StoreError>;

    async fn field_values(&self, request_id: uuid::Uuid) -> Result<Vec<models::FieldValue>, StoreError>;

    async fn saved_signature(&self, email: &str) -> Result<Option<models::RecipientSignature>, StoreError>;

    /// Sets whichever paths are given, leaving the others untouched.
    async fn upsert_saved_signature(
        &self, email: &str, signature_path: Option<String>, initials_path: Option<String>,
    ) -> Result<(), StoreError>;

    async fn insert_activity(&self, activity: models::ActivityLog) -> Result<(), StoreError>;

    /// Most recent first.
    async fn activity(&self, document_id: uuid::Uuid) -> Result<Vec<models::ActivityLog>, StoreError>;
}

/// Whether a request in `status` still blocks a new request for the same
/// recipient.
pub(crate) fn is_live(status: SigningStatus) -> bool {
    status != SigningStatus::Cancelled
}
