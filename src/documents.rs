//! Document preparation by the sender: upload, field layout, deletion.

use crate::error::SigningError;
use crate::layout::{FieldDiff, FieldDraft, LayoutError};
use crate::models;
use crate::schema::{ActivityAction, DocumentStatus};
use crate::signing::SigningService;
use crate::views::ClientMeta;

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Serialize, Debug, Clone)]
pub struct DocumentDetail {
    #[serde(flatten)]
    pub document: models::Document,
    pub fields: Vec<models::DocumentField>,
    pub requests: Vec<models::SigningRequest>,
}

async fn page_count(bytes: Vec<u8>) -> Result<u32, SigningError> {
    let doc = tokio::task::spawn_blocking(move || crate::pdf::Document::load(&bytes)).await
        .map_err(|e| SigningError::Internal(format!("PDF task failed: {}", e)))?;
    match doc {
        Ok(d) => Ok(d.page_count()),
        Err(err) => {
            debug!("Unreadable PDF: {}", err);
            Err(SigningError::InvalidInput("the file is not a readable PDF".to_string()))
        }
    }
}

pub struct Documents<'a> {
    service: &'a SigningService,
}

impl SigningService {
    pub fn documents(&self) -> Documents<'_> {
        Documents { service: self }
    }
}

impl Documents<'_> {
    fn draft_only(document: &models::Document) -> Result<(), SigningError> {
        if document.status == DocumentStatus::Draft {
            Ok(())
        } else {
            Err(SigningError::InvalidTransition(format!("document is {:?}, not a draft", document.status).to_lowercase()))
        }
    }

    pub async fn create(&self, sender: uuid::Uuid, title: &str, pdf: Vec<u8>, client: &ClientMeta) -> Result<models::Document, SigningError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SigningError::InvalidInput("a title is required".to_string()));
        }
        if pdf.len() > MAX_UPLOAD_BYTES {
            return Err(SigningError::InvalidInput("the file exceeds the 10 MiB limit".to_string()));
        }
        if !pdf.starts_with(b"%PDF-") {
            return Err(SigningError::InvalidInput("only PDF files are accepted".to_string()));
        }
        let pages = page_count(pdf.clone()).await?;
        if pages == 0 {
            return Err(SigningError::InvalidInput("the PDF has no pages".to_string()));
        }

        let id = uuid::Uuid::new_v4();
        let now = chrono::Utc::now();
        let document = models::Document {
            id,
            title: title.to_string(),
            file_url: format!("documents/{}/{}.pdf", sender, id),
            converted_pdf_url: None,
            status: DocumentStatus::Draft,
            sender_id: sender,
            created_at: now,
            updated_at: now,
        };
        self.service.files.put(&document.file_url, pdf).await?;

        let activity = models::ActivityLog::new(id, Some(sender), ActivityAction::DocumentUploaded, serde_json::json!({
            "title": document.title,
            "pages": pages,
            "ip": client.ip,
            "user_agent": client.user_agent,
        }));
        self.service.store.insert_document(document.clone(), activity).await?;
        info!("Document {} uploaded by {}", id, sender);
        Ok(document)
    }

    pub async fn detail(&self, sender: uuid::Uuid, document_id: uuid::Uuid) -> Result<DocumentDetail, SigningError> {
        let document = self.service.owned_document(sender, document_id).await?;
        Ok(DocumentDetail {
            fields: self.service.store.fields(document.id).await?,
            requests: self.service.store.requests_for_document(document.id).await?,
            document,
        })
    }

    /// Replaces the layout with `drafts`. Drafts carrying the id of an
    /// existing field update it; existing fields not among them are deleted.
    pub async fn save_fields(
        &self, sender: uuid::Uuid, document_id: uuid::Uuid, drafts: Vec<FieldDraft>, client: &ClientMeta,
    ) -> Result<Vec<models::DocumentField>, SigningError> {
        let document = self.service.owned_document(sender, document_id).await?;
        Self::draft_only(&document)?;

        let pages = page_count(self.service.files.get(document.source_path()).await?).await?;
        if let Some(i) = drafts.iter().position(|d| d.page_number > pages as i32) {
            return Err(LayoutError::PageOutOfRange(i).into());
        }

        let existing = self.service.store.fields(document.id).await?;
        let count = drafts.len();
        let diff = FieldDiff::compute(document.id, &existing, drafts)?;
        let activity = models::ActivityLog::new(document.id, Some(sender), ActivityAction::DocumentPrepared, serde_json::json!({
            "fields": count,
            "removed": diff.delete.len(),
            "ip": client.ip,
            "user_agent": client.user_agent,
        }));
        if !self.service.store.replace_fields(document.id, diff, activity).await? {
            return Err(SigningError::InvalidTransition("document is no longer a draft".to_string()));
        }
        debug!("Saved {} field(s) on document {}", count, document.id);
        Ok(self.service.store.fields(document.id).await?)
    }

    pub async fn fields(&self, sender: uuid::Uuid, document_id: uuid::Uuid) -> Result<Vec<models::DocumentField>, SigningError> {
        let document = self.service.owned_document(sender, document_id).await?;
        Ok(self.service.store.fields(document.id).await?)
    }

    pub async fn activity(&self, sender: uuid::Uuid, document_id: uuid::Uuid) -> Result<Vec<models::ActivityLog>, SigningError> {
        let document = self.service.owned_document(sender, document_id).await?;
        Ok(self.service.store.activity(document.id).await?)
    }

    pub async fn delete(&self, sender: uuid::Uuid, document_id: uuid::Uuid) -> Result<(), SigningError> {
        let document = self.service.owned_document(sender, document_id).await?;
        Self::draft_only(&document)?;
        if !self.service.store.delete_draft_document(document.id).await? {
            return Err(SigningError::InvalidTransition("document is no longer a draft".to_string()));
        }

        for path in std::iter::once(&document.file_url).chain(document.converted_pdf_url.iter()) {
            if let Err(err) = self.service.files.delete(path).await {
                warn!("Unable to remove {} of deleted document {}: {}", path, document.id, err);
            }
        }
        info!("Document {} deleted", document.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::FileStore;
    use crate::pdf::tests::blank_pdf;
    use crate::schema::FieldType;
    use crate::signing::tests::{client, harness, SENDER};
    use crate::store::Store;

    fn draft(field_type: FieldType, page: i32) -> FieldDraft {
        FieldDraft::dropped(field_type.config(), page, 10.0, 10.0)
    }

    #[tokio::test]
    async fn upload_creates_draft() {
        let h = harness().await;
        let document = h.service.documents()
            .create(SENDER, "  Lease ", blank_pdf(&[(612, 792), (595, 842)]), &client()).await.unwrap();

        assert_eq!(document.title, "Lease");
        assert_eq!(document.status, DocumentStatus::Draft);
        assert_eq!(document.file_url, format!("documents/{}/{}.pdf", SENDER, document.id));
        assert!(h.files.exists(&document.file_url).await.unwrap());

        let activity = h.service.documents().activity(SENDER, document.id).await.unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].action, ActivityAction::DocumentUploaded);
        assert_eq!(activity[0].metadata["pages"], 2);
    }

    #[tokio::test]
    async fn rejects_bad_uploads() {
        let h = harness().await;
        let docs = h.service.documents();

        let not_pdf = docs.create(SENDER, "Notes", b"PK\x03\x04 word file".to_vec(), &client()).await;
        assert!(matches!(not_pdf, Err(SigningError::InvalidInput(_))));

        let mut huge = b"%PDF-1.7\n".to_vec();
        huge.resize(MAX_UPLOAD_BYTES + 1, b' ');
        assert!(matches!(docs.create(SENDER, "Big", huge, &client()).await, Err(SigningError::InvalidInput(_))));

        let broken = docs.create(SENDER, "Broken", b"%PDF-1.7\ngarbage".to_vec(), &client()).await;
        assert!(matches!(broken, Err(SigningError::InvalidInput(_))));

        let untitled = docs.create(SENDER, " ", blank_pdf(&[(612, 792)]), &client()).await;
        assert!(matches!(untitled, Err(SigningError::InvalidInput(_))));

        assert!(h.files.paths().await.is_empty());
    }

    #[tokio::test]
    async fn fields_are_replaced_by_diff() {
        let h = harness().await;
        let docs = h.service.documents();
        let document = docs.create(SENDER, "Lease", blank_pdf(&[(612, 792), (612, 792)]), &client()).await.unwrap();

        let saved = docs.save_fields(
            SENDER, document.id, vec![draft(FieldType::Signature, 1), draft(FieldType::Text, 2)], &client(),
        ).await.unwrap();
        assert_eq!(saved.len(), 2);

        let text = saved.iter().find(|f| f.field_type == FieldType::Text).unwrap().clone();
        let mut kept = draft(FieldType::Text, 2);
        kept.db_id = Some(text.id);
        kept.label = "Full name".to_string();
        let saved = docs.save_fields(SENDER, document.id, vec![kept], &client()).await.unwrap();

        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].id, text.id);
        assert_eq!(saved[0].label, "Full name");
        assert_eq!(docs.fields(SENDER, document.id).await.unwrap(), saved);
    }

    #[tokio::test]
    async fn layout_is_checked_before_saving() {
        let h = harness().await;
        let docs = h.service.documents();
        let document = docs.create(SENDER, "Lease", blank_pdf(&[(612, 792)]), &client()).await.unwrap();

        let res = docs.save_fields(SENDER, document.id, vec![draft(FieldType::Text, 1), draft(FieldType::Date, 3)], &client()).await;
        assert!(matches!(res, Err(SigningError::Layout(LayoutError::PageOutOfRange(1)))));

        let mut off_page = draft(FieldType::Text, 1);
        off_page.position_x = 95.0;
        let res = docs.save_fields(SENDER, document.id, vec![off_page], &client()).await;
        assert!(matches!(res, Err(SigningError::Layout(LayoutError::Geometry(0)))));

        assert!(docs.fields(SENDER, document.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn layout_is_frozen_once_sent() {
        let h = harness().await;
        let docs = h.service.documents();
        let document = docs.create(SENDER, "Lease", blank_pdf(&[(612, 792)]), &client()).await.unwrap();
        docs.save_fields(SENDER, document.id, vec![draft(FieldType::Signature, 1)], &client()).await.unwrap();
        h.service.create_requests(SENDER, document.id, vec!["bob@example.com".to_string()], None, &client()).await.unwrap();

        let res = docs.save_fields(SENDER, document.id, vec![], &client()).await;
        assert!(matches!(res, Err(SigningError::InvalidTransition(_))));
        assert!(matches!(docs.delete(SENDER, document.id).await, Err(SigningError::InvalidTransition(_))));

        let detail = docs.detail(SENDER, document.id).await.unwrap();
        assert_eq!(detail.fields.len(), 1);
        assert_eq!(detail.requests.len(), 1);
    }

    #[tokio::test]
    async fn drafts_can_be_deleted_by_owner() {
        let h = harness().await;
        let docs = h.service.documents();
        let document = docs.create(SENDER, "Lease", blank_pdf(&[(612, 792)]), &client()).await.unwrap();

        assert!(matches!(docs.delete(uuid::Uuid::new_v4(), document.id).await, Err(SigningError::NotFound)));
        docs.delete(SENDER, document.id).await.unwrap();

        assert!(h.store.document(document.id).await.unwrap().is_none());
        assert!(!h.files.exists(&document.file_url).await.unwrap());
        assert!(matches!(docs.fields(SENDER, document.id).await, Err(SigningError::NotFound)));
    }
}
