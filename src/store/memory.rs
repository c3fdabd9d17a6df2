use std::collections::HashMap;
use crate::layout::FieldDiff;
use crate::models;
use crate::schema::{DocumentStatus, SigningStatus};
use super::{Commit, SignedRecord, Store, StoreError};

#[derive(Default)]
struct State {
    profiles: Vec<models::Profile>,
    documents: HashMap<uuid::Uuid, models::Document>,
    fields: Vec<models::DocumentField>,
    requests: Vec<models::SigningRequest>,
    values: Vec<models::FieldValue>,
    signatures: HashMap<String, models::RecipientSignature>,
    activity: Vec<models::ActivityLog>,
}

/// Keeps everything in process memory, with the same constraints the
/// database enforces.
#[derive(Default)]
pub struct MemoryStore {
    state: tokio::sync::Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_profile(&self, profile: models::Profile) {
        self.state.lock().await.profiles.push(profile);
    }
}

impl State {
    /// The request if it can still change state, or the outcome to report.
    fn open_request(&mut self, id: uuid::Uuid) -> Result<&mut models::SigningRequest, Commit> {
        match self.requests.iter_mut().find(|r| r.id == id) {
            None => Err(Commit::Missing),
            Some(r) if !r.status.is_open() => Err(Commit::Lost(r.clone())),
            Some(r) => Ok(r),
        }
    }
}

#[rocket::async_trait]
impl Store for MemoryStore {
    async fn profile(&self, id: uuid::Uuid) -> Result<Option<models::Profile>, StoreError> {
        Ok(self.state.lock().await.profiles.iter().find(|p| p.id == id).cloned())
    }

    async fn profile_by_email(&self, email: &str) -> Result<Option<models::Profile>, StoreError> {
        let email = email.trim().to_lowercase();
        Ok(self.state.lock().await.profiles.iter().find(|p| p.email.to_lowercase() == email).cloned())
    }

    async fn document(&self, id: uuid::Uuid) -> Result<Option<models::Document>, StoreError> {
        Ok(self.state.lock().await.documents.get(&id).cloned())
    }

    async fn insert_document(&self, document: models::Document, activity: models::ActivityLog) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.documents.contains_key(&document.id) {
            return Err(StoreError::Conflict(format!("document {} exists", document.id)));
        }
        state.documents.insert(document.id, document);
        state.activity.push(activity);
        Ok(())
    }

    async fn delete_draft_document(&self, id: uuid::Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.documents.get(&id) {
            Some(d) if d.status == DocumentStatus::Draft => {}
            _ => return Ok(false),
        }
        state.documents.remove(&id);
        state.fields.retain(|f| f.document_id != id);
        state.activity.retain(|a| a.document_id != id);
        let request_ids = state.requests.iter()
            .filter(|r| r.document_id == id)
            .map(|r| r.id)
            .collect::<Vec<_>>();
        state.requests.retain(|r| r.document_id != id);
        state.values.retain(|v| !request_ids.contains(&v.signing_request_id));
        Ok(true)
    }

    async fn transition_document(&self, id: uuid::Uuid, from: DocumentStatus, to: DocumentStatus) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.documents.get_mut(&id) {
            Some(d) if d.status == from => {
                d.status = to;
                d.updated_at = chrono::Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fields(&self, document_id: uuid::Uuid) -> Result<Vec<models::DocumentField>, StoreError> {
        let mut fields = self.state.lock().await.fields.iter()
            .filter(|f| f.document_id == document_id)
            .cloned()
            .collect::<Vec<_>>();
        fields.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at)
                .then(a.page_number.cmp(&b.page_number))
                .then(a.position_y.total_cmp(&b.position_y))
                .then(a.position_x.total_cmp(&b.position_x))
        });
        Ok(fields)
    }

    async fn replace_fields(&self, document_id: uuid::Uuid, diff: FieldDiff, activity: models::ActivityLog) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.documents.get_mut(&document_id) {
            Some(d) if d.status == DocumentStatus::Draft => d.updated_at = chrono::Utc::now(),
            _ => return Ok(false),
        }
        state.fields.retain(|f| f.document_id != document_id || !diff.delete.contains(&f.id));
        for field in diff.upsert {
            match state.fields.iter_mut().find(|f| f.id == field.id) {
                Some(existing) => *existing = models::DocumentField {
                    created_at: existing.created_at,
                    ..field
                },
                None => state.fields.push(field),
            }
        }
        state.activity.push(activity);
        Ok(true)
    }

    async fn request(&self, id: uuid::Uuid) -> Result<Option<models::SigningRequest>, StoreError> {
        Ok(self.state.lock().await.requests.iter().find(|r| r.id == id).cloned())
    }

    async fn request_by_token(&self, token: &str) -> Result<Option<models::SigningRequest>, StoreError> {
        Ok(self.state.lock().await.requests.iter().find(|r| r.token == token).cloned())
    }

    async fn requests_for_document(&self, document_id: uuid::Uuid) -> Result<Vec<models::SigningRequest>, StoreError> {
        let mut requests = self.state.lock().await.requests.iter()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect::<Vec<_>>();
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    async fn insert_requests(&self, requests: Vec<models::SigningRequest>, activity: models::ActivityLog) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for (i, new) in requests.iter().enumerate() {
            let email = new.recipient_email.to_lowercase();
            let clashes = state.requests.iter().chain(requests[..i].iter()).any(|r| {
                r.token == new.token || (
                    r.document_id == new.document_id
                        && super::is_live(r.status)
                        && super::is_live(new.status)
                        && r.recipient_email.to_lowercase() == email
                )
            });
            if clashes {
                return Err(StoreError::Conflict(format!("duplicate signing request for {}", new.recipient_email)));
            }
        }

        if let Some(d) = state.documents.get_mut(&activity.document_id) {
            if d.status == DocumentStatus::Draft {
                d.status = DocumentStatus::Pending;
                d.updated_at = chrono::Utc::now();
            }
        }
        state.requests.extend(requests);
        state.activity.push(activity);
        Ok(())
    }

    async fn mark_viewed(&self, id: uuid::Uuid, activity: models::ActivityLog) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.requests.iter_mut().find(|r| r.id == id) {
            Some(r) if r.status == SigningStatus::Pending => r.status = SigningStatus::Viewed,
            _ => return Ok(false),
        }
        state.activity.push(activity);
        Ok(true)
    }

    async fn commit_signature(&self, id: uuid::Uuid, record: SignedRecord) -> Result<Commit, StoreError> {
        let mut state = self.state.lock().await;
        let duplicate = record.values.iter().enumerate().any(|(i, v)| {
            state.values.iter().chain(record.values[..i].iter()).any(|o| {
                o.signing_request_id == v.signing_request_id && o.document_field_id == v.document_field_id
            })
        });

        let request = match state.open_request(id) {
            Ok(r) => r,
            Err(outcome) => return Ok(outcome),
        };
        if duplicate {
            return Err(StoreError::Conflict("duplicate field value".to_string()));
        }
        request.status = SigningStatus::Signed;
        request.signed_at = Some(record.signed_at);
        request.signature_url = record.signature_url;
        request.signed_file_url = Some(record.signed_file_url);
        let request = request.clone();

        state.values.extend(record.values);
        Ok(Commit::Committed(request))
    }

    async fn cancel_request(&self, id: uuid::Uuid, activity: models::ActivityLog) -> Result<Commit, StoreError> {
        let mut state = self.state.lock().await;
        let request = match state.open_request(id) {
            Ok(r) => r,
            Err(outcome) => return Ok(outcome),
        };
        request.status = SigningStatus::Cancelled;
        let request = request.clone();

        state.activity.push(activity);
        Ok(Commit::Committed(request))
    }

    async fn field_values(&self, request_id: uuid::Uuid) -> Result<Vec<models::FieldValue>, StoreError> {
        Ok(self.state.lock().await.values.iter()
            .filter(|v| v.signing_request_id == request_id)
            .cloned()
            .collect())
    }

    async fn saved_signature(&self, email: &str) -> Result<Option<models::RecipientSignature>, StoreError> {
        Ok(self.state.lock().await.signatures.get(email).cloned())
    }

    async fn upsert_saved_signature(
        &self, email: &str, signature_path: Option<String>, initials_path: Option<String>,
    ) -> Result<(), StoreError> {
        if signature_path.is_none() && initials_path.is_none() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let row = state.signatures.entry(email.to_string()).or_insert_with(|| models::RecipientSignature {
            recipient_email: email.to_string(),
            signature_path: None,
            initials_path: None,
            updated_at: chrono::Utc::now(),
        });
        if signature_path.is_some() {
            row.signature_path = signature_path;
        }
        if initials_path.is_some() {
            row.initials_path = initials_path;
        }
        row.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn insert_activity(&self, activity: models::ActivityLog) -> Result<(), StoreError> {
        self.state.lock().await.activity.push(activity);
        Ok(())
    }

    async fn activity(&self, document_id: uuid::Uuid) -> Result<Vec<models::ActivityLog>, StoreError> {
        let mut entries = self.state.lock().await.activity.iter()
            .rev()
            .filter(|a| a.document_id == document_id)
            .cloned()
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }
}
