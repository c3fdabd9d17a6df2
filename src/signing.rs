//! Signing requests: issuing them, the recipient's session and submission,
//! and the sender's follow-up actions.
//!
//! A request moves `pending -> viewed -> signed`, or from either open state
//! to `cancelled`. Every transition is a conditional update in the store, so
//! of two racing callers exactly one observes success and the other is told
//! what happened instead.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use rand::Rng;
use crate::error::SigningError;
use crate::files::{FileError, FileStore};
use crate::mail::Mailer;
use crate::models;
use crate::schema::{ActivityAction, DocumentStatus, FieldType, SigningStatus};
use crate::signatures::{self, SavedImage, SignatureError, SignatureStore};
use crate::store::{Commit, SignedRecord, Store};
use crate::views::ClientMeta;

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

lazy_static::lazy_static! {
    static ref DATA_URL_RE: regex::Regex = regex::Regex::new(r"^data:image/\w+;base64,").unwrap();
}

pub fn make_token() -> String {
    base64::encode_config(
        rand::thread_rng()
            .sample_iter(rand::distributions::Standard)
            .take(64)
            .collect::<Vec<u8>>(),
        base64::URL_SAFE_NO_PAD,
    )
}

/// Lifetimes of the links handed out to browsers.
#[derive(Debug, Clone, Copy)]
pub struct LinkTtls {
    pub document: chrono::Duration,
    pub saved_signature: chrono::Duration,
    pub signed_download: chrono::Duration,
}

impl Default for LinkTtls {
    fn default() -> Self {
        Self {
            document: chrono::Duration::hours(1),
            saved_signature: chrono::Duration::hours(1),
            signed_download: chrono::Duration::days(7),
        }
    }
}

/// Document status implied by the statuses of all its requests.
///
/// Never yields `draft`; callers only apply `completed`.
pub fn aggregate(statuses: &[SigningStatus]) -> DocumentStatus {
    if !statuses.is_empty() && statuses.iter().all(|s| s.is_settled()) {
        DocumentStatus::Completed
    } else {
        DocumentStatus::Pending
    }
}

/// The error a recipient sees for a request they can no longer act on.
fn unavailable(request: &models::SigningRequest) -> Option<SigningError> {
    match request.status {
        SigningStatus::Pending | SigningStatus::Viewed => None,
        SigningStatus::Signed => Some(SigningError::Conflict { signed_at: request.signed_at }),
        status => Some(SigningError::Gone { status }),
    }
}

fn check_open(request: &models::SigningRequest) -> Result<(), SigningError> {
    match unavailable(request) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn lost(current: &models::SigningRequest) -> SigningError {
    unavailable(current).unwrap_or_else(|| SigningError::InvalidTransition(format!(
        "request {} changed concurrently", current.id
    )))
}

pub fn signed_path(document_id: uuid::Uuid, request_id: uuid::Uuid, attempt: uuid::Uuid) -> String {
    format!("signed/{}/{}/{}.pdf", document_id, request_id, attempt)
}

fn decode_data_url(data_url: &str) -> Result<Vec<u8>, SigningError> {
    let encoded = DATA_URL_RE.replace(data_url, "");
    let bytes = base64::decode(encoded.trim())
        .map_err(|_| SigningError::InvalidInput("signature image is not valid base64".to_string()))?;
    if !bytes.starts_with(PNG_MAGIC) {
        return Err(SigningError::InvalidInput("signature images must be PNG".to_string()));
    }
    Ok(bytes)
}

/// Serialises submissions for the same request within this process, so a
/// second attempt waits for the first and sees its outcome instead of baking
/// again.
#[derive(Default)]
struct RequestLocks {
    locks: std::sync::Mutex<HashMap<uuid::Uuid, Weak<tokio::sync::Mutex<()>>>>,
}

impl RequestLocks {
    fn get(&self, id: uuid::Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.retain(|_, l| l.strong_count() > 0);
        match locks.get(&id).and_then(Weak::upgrade) {
            Some(l) => l,
            None => {
                let l = Arc::new(tokio::sync::Mutex::new(()));
                locks.insert(id, Arc::downgrade(&l));
                l
            }
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct IssuedRequest {
    #[serde(flatten)]
    pub request: models::SigningRequest,
    pub signing_url: String,
    pub emailed: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct SessionRequest {
    pub id: uuid::Uuid,
    pub status: SigningStatus,
    pub recipient_email: String,
    pub message: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct SessionDocument {
    pub id: uuid::Uuid,
    pub title: String,
    pub file_url: Option<String>,
    pub sender_name: String,
}

/// Everything the signing page needs.
#[derive(Serialize, Debug, Clone)]
pub struct Session {
    pub request: SessionRequest,
    pub document: SessionDocument,
    pub fields: Vec<models::DocumentField>,
    pub saved_signature: Option<SavedImage>,
    pub saved_initials: Option<SavedImage>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FieldValueInput {
    pub document_field_id: uuid::Uuid,
    pub value: String,
}

/// An image for a signature or initials field: freshly drawn as a data URL,
/// or the path of the recipient's saved image.
#[derive(Deserialize, Debug, Clone)]
pub struct SignatureInput {
    pub document_field_id: uuid::Uuid,
    #[serde(default)]
    pub data_url: Option<String>,
    #[serde(default)]
    pub signature_path: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Submission {
    #[serde(default)]
    pub field_values: Vec<FieldValueInput>,
    #[serde(default)]
    pub signature_data: Vec<SignatureInput>,
}

#[derive(Serialize, Debug, Clone)]
pub struct SubmitOutcome {
    pub signed_at: chrono::DateTime<chrono::Utc>,
    pub document_status: DocumentStatus,
    pub download_url: Option<String>,
    pub skipped_fields: Vec<uuid::Uuid>,
}

#[derive(Serialize, Debug, Clone)]
pub struct CancelOutcome {
    pub request: models::SigningRequest,
    pub document_status: DocumentStatus,
}

pub struct SigningService {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) files: Arc<dyn FileStore>,
    mailer: Arc<Mailer>,
    external_uri: String,
    ttls: LinkTtls,
    locks: RequestLocks,
}

impl SigningService {
    pub fn new(
        store: Arc<dyn Store>, files: Arc<dyn FileStore>, mailer: Arc<Mailer>, external_uri: &str, ttls: LinkTtls,
    ) -> Self {
        Self {
            store,
            files,
            mailer,
            external_uri: external_uri.trim_end_matches('/').to_string(),
            ttls,
            locks: RequestLocks::default(),
        }
    }

    pub fn signing_url(&self, token: &str) -> String {
        format!("{}/sign/{}", self.external_uri, token)
    }

    fn signature_store(&self) -> SignatureStore<'_> {
        SignatureStore {
            store: self.store.as_ref(),
            files: self.files.as_ref(),
        }
    }

    async fn sender_name(&self, sender_id: uuid::Uuid) -> Result<String, SigningError> {
        Ok(self.store.profile(sender_id).await?
            .map(|p| p.display_name().to_string())
            .unwrap_or_else(|| "Unknown".to_string()))
    }

    /// The document if `sender` owns it. Documents of other senders are
    /// indistinguishable from missing ones.
    pub(crate) async fn owned_document(&self, sender: uuid::Uuid, document_id: uuid::Uuid) -> Result<models::Document, SigningError> {
        match self.store.document(document_id).await? {
            Some(d) if d.sender_id == sender => Ok(d),
            _ => Err(SigningError::NotFound),
        }
    }

    async fn owned_request(
        &self, sender: uuid::Uuid, request_id: uuid::Uuid,
    ) -> Result<(models::SigningRequest, models::Document), SigningError> {
        let request = self.store.request(request_id).await?.ok_or(SigningError::NotFound)?;
        let document = self.owned_document(sender, request.document_id).await?;
        Ok((request, document))
    }

    async fn request_by_token(&self, token: &str) -> Result<models::SigningRequest, SigningError> {
        self.store.request_by_token(token).await?.ok_or(SigningError::NotFound)
    }

    /// Re-reads every request of the document and completes it once all are
    /// settled. Completion is never undone.
    pub async fn settle_document(&self, document_id: uuid::Uuid) -> Result<DocumentStatus, SigningError> {
        let statuses = self.store.requests_for_document(document_id).await?
            .into_iter()
            .map(|r| r.status)
            .collect::<Vec<_>>();
        if aggregate(&statuses) == DocumentStatus::Completed
            && self.store.transition_document(document_id, DocumentStatus::Pending, DocumentStatus::Completed).await? {
            info!("Document {} completed", document_id);
        }
        self.store.document(document_id).await?
            .map(|d| d.status)
            .ok_or(SigningError::NotFound)
    }

    pub async fn create_requests(
        &self, sender: uuid::Uuid, document_id: uuid::Uuid, recipients: Vec<String>, message: Option<String>,
        client: &ClientMeta,
    ) -> Result<Vec<IssuedRequest>, SigningError> {
        let document = self.owned_document(sender, document_id).await?;
        if document.status == DocumentStatus::Completed {
            return Err(SigningError::InvalidTransition("document is already completed".to_string()));
        }

        let mut emails: Vec<String> = vec![];
        for recipient in &recipients {
            let email = signatures::normalize_email(recipient);
            if let Err(err) = email.parse::<lettre::Address>() {
                return Err(SigningError::InvalidInput(format!("invalid recipient {}: {}", recipient.trim(), err)));
            }
            if !emails.contains(&email) {
                emails.push(email);
            }
        }
        if emails.is_empty() {
            return Err(SigningError::InvalidInput("at least one recipient is required".to_string()));
        }

        let existing = self.store.requests_for_document(document.id).await?;
        let message = message.filter(|m| !m.trim().is_empty());
        let now = chrono::Utc::now();
        let mut requests = vec![];
        for email in emails {
            if existing.iter().any(|r| crate::store::is_live(r.status) && signatures::normalize_email(&r.recipient_email) == email) {
                debug!("{} already has a request for document {}", email, document.id);
                continue;
            }
            let recipient_id = self.store.profile_by_email(&email).await?.map(|p| p.id);
            requests.push(models::SigningRequest {
                id: uuid::Uuid::new_v4(),
                document_id: document.id,
                recipient_email: email,
                recipient_id,
                token: make_token(),
                status: SigningStatus::Pending,
                message: message.clone(),
                signed_at: None,
                signature_url: None,
                signed_file_url: None,
                created_at: now,
            });
        }
        if requests.is_empty() {
            return Ok(vec![]);
        }

        let activity = models::ActivityLog::new(document.id, Some(sender), ActivityAction::SignatureRequested, serde_json::json!({
            "recipients": requests.iter().map(|r| r.recipient_email.as_str()).collect::<Vec<_>>(),
            "ip": client.ip,
            "user_agent": client.user_agent,
        }));
        self.store.insert_requests(requests.clone(), activity).await?;
        info!("Issued {} signing request(s) for document {}", requests.len(), document.id);

        let sender_name = self.sender_name(sender).await?;
        let mut issued = Vec::with_capacity(requests.len());
        for request in requests {
            let signing_url = self.signing_url(&request.token);
            let emailed = match self.mailer.send_signing_request(
                &request.recipient_email, &sender_name, &document.title, request.message.as_deref(), &signing_url,
            ).await {
                Ok(()) => true,
                Err(err) => {
                    warn!("Unable to email signing request {}: {}", request.id, err);
                    false
                }
            };
            issued.push(IssuedRequest { request, signing_url, emailed });
        }
        Ok(issued)
    }

    pub async fn resolve(&self, token: &str, client: &ClientMeta) -> Result<Session, SigningError> {
        let mut request = self.request_by_token(token).await?;
        check_open(&request)?;
        let document = self.store.document(request.document_id).await?.ok_or(SigningError::NotFound)?;

        if request.status == SigningStatus::Pending {
            let activity = models::ActivityLog::new(
                document.id, request.recipient_id, ActivityAction::DocumentViewed, client.metadata(&request.recipient_email),
            );
            if self.store.mark_viewed(request.id, activity).await? {
                request.status = SigningStatus::Viewed;
            } else {
                request = self.store.request(request.id).await?.ok_or(SigningError::NotFound)?;
                check_open(&request)?;
            }
        }

        let file_url = match self.files.signed_url(document.source_path(), self.ttls.document).await {
            Ok(url) => Some(url),
            Err(FileError::NotFound(path)) => {
                warn!("Document {} has no stored file at {}", document.id, path);
                None
            }
            Err(err) => return Err(err.into()),
        };
        let saved = self.signature_store().lookup(&request.recipient_email, self.ttls.saved_signature).await?;

        Ok(Session {
            document: SessionDocument {
                id: document.id,
                sender_name: self.sender_name(document.sender_id).await?,
                title: document.title,
                file_url,
            },
            fields: self.store.fields(document.id).await?,
            saved_signature: saved.signature,
            saved_initials: saved.initials,
            request: SessionRequest {
                id: request.id,
                status: request.status,
                recipient_email: request.recipient_email,
                message: request.message,
            },
        })
    }

    pub async fn submit(&self, token: &str, submission: Submission, client: &ClientMeta) -> Result<SubmitOutcome, SigningError> {
        let request = self.request_by_token(token).await?;
        check_open(&request)?;

        let lock = self.locks.get(request.id);
        let _guard = lock.lock().await;
        let request = self.store.request(request.id).await?.ok_or(SigningError::NotFound)?;
        check_open(&request)?;

        let document = self.store.document(request.document_id).await?.ok_or(SigningError::NotFound)?;
        let fields = self.store.fields(document.id).await?;

        let mut values = HashMap::new();
        for input in submission.field_values {
            match fields.iter().find(|f| f.id == input.document_field_id) {
                Some(f) if !f.field_type.takes_image() => {
                    values.insert(f.id, input.value);
                }
                _ => debug!("Ignoring value for unknown field {}", input.document_field_id),
            }
        }

        let sigs = self.signature_store();
        let mut images = HashMap::new();
        for field in fields.iter().filter(|f| f.field_type.takes_image()) {
            let input = match submission.signature_data.iter().find(|s| s.document_field_id == field.id) {
                Some(i) => i,
                None => continue,
            };
            let bytes = if let Some(data_url) = &input.data_url {
                decode_data_url(data_url)?
            } else if let Some(path) = &input.signature_path {
                match sigs.load_own(&request.recipient_email, path).await {
                    Ok(b) => b,
                    Err(SignatureError::Files(FileError::NotFound(_))) => {
                        return Err(SigningError::InvalidInput("saved signature not found".to_string()));
                    }
                    Err(err) => return Err(err.into()),
                }
            } else {
                continue;
            };
            images.insert(field.id, bytes);
        }

        crate::fields::check_submission(&fields, |id| values.get(id).map(String::as_str), |id| images.contains_key(id))
            .map_err(SigningError::Validation)?;

        // Each attempt writes its own objects; only the committed attempt's
        // paths are ever referenced by the request.
        let attempt = uuid::Uuid::new_v4();
        let mut written = vec![];
        let mut image_paths = HashMap::new();
        let mut primary_signature: Option<(String, Vec<u8>)> = None;
        let mut primary_initials: Option<(String, Vec<u8>)> = None;
        for field in &fields {
            let bytes = match images.get(&field.id) {
                Some(b) => b,
                None => continue,
            };
            let path = signatures::request_image_path(request.id, attempt, field.id);
            if let Err(err) = self.files.put(&path, bytes.clone()).await {
                self.discard(&written).await;
                return Err(err.into());
            }
            written.push(path.clone());
            match field.field_type {
                FieldType::Signature if primary_signature.is_none() => primary_signature = Some((path.clone(), bytes.clone())),
                FieldType::Initials if primary_initials.is_none() => primary_initials = Some((path.clone(), bytes.clone())),
                _ => {}
            }
            image_paths.insert(field.id, path);
        }
        let signature_url = primary_signature.as_ref().or(primary_initials.as_ref()).map(|(p, _)| p.clone());

        let now = chrono::Utc::now();
        let rows = fields.iter().filter_map(|f| {
            let value = image_paths.get(&f.id).or_else(|| values.get(&f.id))?;
            Some(models::FieldValue {
                id: uuid::Uuid::new_v4(),
                signing_request_id: request.id,
                document_field_id: f.id,
                value: value.clone(),
                created_at: now,
            })
        }).collect::<Vec<_>>();

        let signed_path = signed_path(document.id, request.id, attempt);
        let baked = match self.bake_and_store(&document, &fields, values, images, &signed_path).await {
            Ok(b) => b,
            Err(err) => {
                self.discard(&written).await;
                return Err(err);
            }
        };
        written.push(signed_path.clone());

        let signed_at = chrono::Utc::now();
        let lost_to = match self.store.commit_signature(request.id, SignedRecord {
            signed_at,
            signature_url,
            signed_file_url: signed_path.clone(),
            values: rows,
        }).await? {
            Commit::Committed(_) => None,
            Commit::Lost(current) => Some(lost(&current)),
            Commit::Missing => Some(SigningError::NotFound),
        };
        if let Some(err) = lost_to {
            self.discard(&written).await;
            return Err(err);
        }
        info!("Request {} of document {} signed", request.id, document.id);

        if let Err(err) = sigs.save(
            &request.recipient_email,
            primary_signature.map(|(_, b)| b),
            primary_initials.map(|(_, b)| b),
        ).await {
            warn!("Unable to save signature of {} for reuse: {}", request.recipient_email, err);
        }

        let document_status = match self.settle_document(document.id).await {
            Ok(s) => s,
            Err(err) => {
                warn!("Unable to aggregate document {}: {}", document.id, err);
                document.status
            }
        };

        let activity = models::ActivityLog::new(
            document.id, request.recipient_id, ActivityAction::DocumentSigned, client.metadata(&request.recipient_email),
        );
        if let Err(err) = self.store.insert_activity(activity).await {
            warn!("Unable to record signature of request {}: {}", request.id, err);
        }

        let download_url = match self.files.signed_url(&signed_path, self.ttls.signed_download).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!("Unable to link signed copy {}: {}", signed_path, err);
                None
            }
        };
        self.send_signed_copies(&document, &request, download_url.as_deref(), baked.bytes).await;

        Ok(SubmitOutcome {
            signed_at,
            document_status,
            download_url,
            skipped_fields: baked.skipped.into_iter().map(|s| s.field_id).collect(),
        })
    }

    async fn bake_and_store(
        &self, document: &models::Document, fields: &[models::DocumentField], values: HashMap<uuid::Uuid, String>,
        images: HashMap<uuid::Uuid, Vec<u8>>, path: &str,
    ) -> Result<crate::pdf::Baked, SigningError> {
        let base = self.files.get(document.source_path()).await?;
        let bake_fields = fields.to_vec();
        let baked = tokio::task::spawn_blocking(move || crate::pdf::bake(&base, &bake_fields, &values, &images)).await
            .map_err(|e| SigningError::Internal(format!("bake task failed: {}", e)))??;
        for skipped in &baked.skipped {
            warn!("Field {} of document {} not drawn: {:?}", skipped.field_id, document.id, skipped.reason);
        }
        self.files.put(path, baked.bytes.clone()).await?;
        Ok(baked)
    }

    /// Removes the objects of an attempt that did not commit.
    async fn discard(&self, paths: &[String]) {
        for path in paths {
            if let Err(err) = self.files.delete(path).await {
                warn!("Unable to remove {} of an abandoned submission: {}", path, err);
            }
        }
    }

    async fn send_signed_copies(
        &self, document: &models::Document, request: &models::SigningRequest, download_url: Option<&str>, pdf: Vec<u8>,
    ) {
        let sender = match self.store.profile(document.sender_id).await {
            Ok(s) => s,
            Err(err) => {
                warn!("Unable to load sender of document {}: {}", document.id, err);
                None
            }
        };
        let sender_name = sender.as_ref().map(|s| s.display_name().to_string()).unwrap_or_else(|| "Sender".to_string());

        let mut to = vec![];
        if let Some(sender) = &sender {
            to.push(sender.email.clone());
        }
        to.push(request.recipient_email.clone());

        for address in to {
            if let Err(err) = self.mailer.send_signed_copy(
                &address, &document.title, &request.recipient_email, &sender_name, download_url, pdf.clone(),
            ).await {
                warn!("Unable to email signed copy of {} to {}: {}", document.id, address, err);
            }
        }
    }

    pub async fn cancel(&self, sender: uuid::Uuid, request_id: uuid::Uuid, client: &ClientMeta) -> Result<CancelOutcome, SigningError> {
        let (request, document) = self.owned_request(sender, request_id).await?;
        let activity = models::ActivityLog::new(
            document.id, Some(sender), ActivityAction::RequestCancelled, client.metadata(&request.recipient_email),
        );
        let request = match self.store.cancel_request(request.id, activity).await? {
            Commit::Committed(r) => r,
            Commit::Lost(current) => return Err(lost(&current)),
            Commit::Missing => return Err(SigningError::NotFound),
        };
        info!("Request {} of document {} cancelled", request.id, document.id);

        let document_status = match self.settle_document(document.id).await {
            Ok(s) => s,
            Err(err) => {
                warn!("Unable to aggregate document {}: {}", document.id, err);
                document.status
            }
        };
        Ok(CancelOutcome { request, document_status })
    }

    pub async fn resend(&self, sender: uuid::Uuid, request_id: uuid::Uuid) -> Result<(), SigningError> {
        let (request, document) = self.owned_request(sender, request_id).await?;
        if !request.status.is_open() {
            return Err(SigningError::InvalidTransition(
                "Can only resend email for pending or viewed requests".to_string()
            ));
        }
        let sender_name = self.sender_name(sender).await?;
        self.mailer.send_signing_request(
            &request.recipient_email, &sender_name, &document.title, request.message.as_deref(),
            &self.signing_url(&request.token),
        ).await?;
        info!("Resent signing request {}", request.id);
        Ok(())
    }

    /// A fresh link to the signed copy of a request.
    pub async fn signed_file_link(&self, sender: uuid::Uuid, request_id: uuid::Uuid) -> Result<String, SigningError> {
        let (request, _) = self.owned_request(sender, request_id).await?;
        let path = request.signed_file_url.ok_or(SigningError::NotFound)?;
        match self.files.signed_url(&path, self.ttls.signed_download).await {
            Ok(url) => Ok(url),
            Err(FileError::NotFound(_)) => Err(SigningError::NotFound),
            Err(err) => Err(err.into()),
        }
    }
}
