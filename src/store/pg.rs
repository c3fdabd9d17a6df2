use diesel::prelude::*;
use diesel_migrations::MigrationHarness;
use crate::layout::FieldDiff;
use crate::{models, schema};
use crate::schema::{DocumentStatus, SigningStatus};
use super::{Commit, SignedRecord, Store, StoreError};

pub const MIGRATIONS: diesel_migrations::EmbeddedMigrations = diesel_migrations::embed_migrations!("./migrations");

pub type DbPool = r2d2::Pool<diesel::r2d2::ConnectionManager<diesel::PgConnection>>;

diesel::sql_function!(fn lower(x: diesel::sql_types::Text) -> diesel::sql_types::Text);

#[derive(Clone)]
pub struct PgStore {
    db: std::sync::Arc<DbPool>,
}

impl PgStore {
    pub fn new(db: DbPool) -> Self {
        Self {
            db: std::sync::Arc::new(db),
        }
    }

    pub fn connect(url: &str, pool_size: u32) -> Result<Self, StoreError> {
        let manager = diesel::r2d2::ConnectionManager::<diesel::PgConnection>::new(url);
        let pool = r2d2::Pool::builder().max_size(pool_size).build(manager)?;
        Ok(Self::new(pool))
    }

    pub fn run_migrations(&self) -> Result<(), StoreError> {
        let mut c = self.db.get()?;
        let applied = c.run_pending_migrations(MIGRATIONS).map_err(|err| {
            StoreError::Task(format!("Unable to run migrations: {}", err))
        })?;
        for version in applied {
            info!("Applied migration {}", version);
        }
        Ok(())
    }

    async fn run<
        T: 'static + std::marker::Send,
        F: 'static + FnOnce(&mut diesel::PgConnection) -> Result<T, StoreError> + std::marker::Send
    >(&self, func: F) -> Result<T, StoreError> {
        let db_pool = self.db.clone();
        match tokio::task::spawn_blocking(move || {
            let mut c = db_pool.get()?;
            func(&mut c)
        }).await {
            Ok(r) => r,
            Err(err) => Err(StoreError::Task(err.to_string())),
        }
    }
}

fn current_request(c: &mut diesel::PgConnection, id: uuid::Uuid) -> Result<Commit, StoreError> {
    Ok(match schema::signing_requests::dsl::signing_requests
        .find(id)
        .first::<models::SigningRequest>(c)
        .optional()? {
        Some(r) => Commit::Lost(r),
        None => Commit::Missing,
    })
}

#[rocket::async_trait]
impl Store for PgStore {
    async fn profile(&self, id: uuid::Uuid) -> Result<Option<models::Profile>, StoreError> {
        self.run(move |c| {
            Ok(schema::profiles::dsl::profiles.find(id).first::<models::Profile>(c).optional()?)
        }).await
    }

    async fn profile_by_email(&self, email: &str) -> Result<Option<models::Profile>, StoreError> {
        let email = email.trim().to_lowercase();
        self.run(move |c| {
            Ok(schema::profiles::dsl::profiles
                .filter(lower(schema::profiles::dsl::email).eq(email))
                .first::<models::Profile>(c)
                .optional()?)
        }).await
    }

    async fn document(&self, id: uuid::Uuid) -> Result<Option<models::Document>, StoreError> {
        self.run(move |c| {
            Ok(schema::documents::dsl::documents.find(id).first::<models::Document>(c).optional()?)
        }).await
    }

    async fn insert_document(&self, document: models::Document, activity: models::ActivityLog) -> Result<(), StoreError> {
        self.run(move |c| {
            c.transaction(|c| -> Result<(), StoreError> {
                diesel::insert_into(schema::documents::dsl::documents)
                    .values(&document)
                    .execute(c)?;
                diesel::insert_into(schema::activity_log::dsl::activity_log)
                    .values(&activity)
                    .execute(c)?;
                Ok(())
            })
        }).await
    }

    async fn delete_draft_document(&self, id: uuid::Uuid) -> Result<bool, StoreError> {
        self.run(move |c| {
            let deleted = diesel::delete(schema::documents::dsl::documents.filter(
                schema::documents::dsl::id.eq(id)
            ).filter(
                schema::documents::dsl::status.eq(DocumentStatus::Draft)
            )).execute(c)?;
            Ok(deleted > 0)
        }).await
    }

    async fn transition_document(&self, id: uuid::Uuid, from: DocumentStatus, to: DocumentStatus) -> Result<bool, StoreError> {
        self.run(move |c| {
            let updated = diesel::update(schema::documents::dsl::documents.filter(
                schema::documents::dsl::id.eq(id)
            ).filter(
                schema::documents::dsl::status.eq(from)
            ))
                .set((
                    schema::documents::dsl::status.eq(to),
                    schema::documents::dsl::updated_at.eq(chrono::Utc::now()),
                ))
                .execute(c)?;
            Ok(updated > 0)
        }).await
    }

    async fn fields(&self, document_id: uuid::Uuid) -> Result<Vec<models::DocumentField>, StoreError> {
        self.run(move |c| {
            Ok(schema::document_fields::dsl::document_fields
                .filter(schema::document_fields::dsl::document_id.eq(document_id))
                .order((
                    schema::document_fields::dsl::created_at.asc(),
                    schema::document_fields::dsl::page_number.asc(),
                    schema::document_fields::dsl::position_y.asc(),
                    schema::document_fields::dsl::position_x.asc(),
                ))
                .load::<models::DocumentField>(c)?)
        }).await
    }

    async fn replace_fields(&self, document_id: uuid::Uuid, diff: FieldDiff, activity: models::ActivityLog) -> Result<bool, StoreError> {
        self.run(move |c| {
            c.transaction(|c| -> Result<bool, StoreError> {
                let status = schema::documents::dsl::documents
                    .find(document_id)
                    .select(schema::documents::dsl::status)
                    .for_update()
                    .first::<DocumentStatus>(c)
                    .optional()?;
                if status != Some(DocumentStatus::Draft) {
                    return Ok(false);
                }

                if !diff.delete.is_empty() {
                    diesel::delete(schema::document_fields::dsl::document_fields.filter(
                        schema::document_fields::dsl::document_id.eq(document_id)
                    ).filter(
                        schema::document_fields::dsl::id.eq_any(&diff.delete)
                    )).execute(c)?;
                }

                for field in &diff.upsert {
                    diesel::insert_into(schema::document_fields::dsl::document_fields)
                        .values(field)
                        .on_conflict(schema::document_fields::dsl::id)
                        .do_update()
                        .set(field)
                        .execute(c)?;
                }

                diesel::insert_into(schema::activity_log::dsl::activity_log)
                    .values(&activity)
                    .execute(c)?;
                diesel::update(schema::documents::dsl::documents.find(document_id))
                    .set(schema::documents::dsl::updated_at.eq(chrono::Utc::now()))
                    .execute(c)?;
                Ok(true)
            })
        }).await
    }

    async fn request(&self, id: uuid::Uuid) -> Result<Option<models::SigningRequest>, StoreError> {
        self.run(move |c| {
            Ok(schema::signing_requests::dsl::signing_requests.find(id).first::<models::SigningRequest>(c).optional()?)
        }).await
    }

    async fn request_by_token(&self, token: &str) -> Result<Option<models::SigningRequest>, StoreError> {
        let token = token.to_string();
        self.run(move |c| {
            Ok(schema::signing_requests::dsl::signing_requests
                .filter(schema::signing_requests::dsl::token.eq(token))
                .first::<models::SigningRequest>(c)
                .optional()?)
        }).await
    }

    async fn requests_for_document(&self, document_id: uuid::Uuid) -> Result<Vec<models::SigningRequest>, StoreError> {
        self.run(move |c| {
            Ok(schema::signing_requests::dsl::signing_requests
                .filter(schema::signing_requests::dsl::document_id.eq(document_id))
                .order(schema::signing_requests::dsl::created_at.asc())
                .load::<models::SigningRequest>(c)?)
        }).await
    }

    async fn insert_requests(&self, requests: Vec<models::SigningRequest>, activity: models::ActivityLog) -> Result<(), StoreError> {
        self.run(move |c| {
            c.transaction(|c| -> Result<(), StoreError> {
                diesel::insert_into(schema::signing_requests::dsl::signing_requests)
                    .values(&requests)
                    .execute(c)?;
                diesel::update(schema::documents::dsl::documents.filter(
                    schema::documents::dsl::id.eq(activity.document_id)
                ).filter(
                    schema::documents::dsl::status.eq(DocumentStatus::Draft)
                ))
                    .set((
                        schema::documents::dsl::status.eq(DocumentStatus::Pending),
                        schema::documents::dsl::updated_at.eq(chrono::Utc::now()),
                    ))
                    .execute(c)?;
                diesel::insert_into(schema::activity_log::dsl::activity_log)
                    .values(&activity)
                    .execute(c)?;
                Ok(())
            })
        }).await
    }

    async fn mark_viewed(&self, id: uuid::Uuid, activity: models::ActivityLog) -> Result<bool, StoreError> {
        self.run(move |c| {
            c.transaction(|c| -> Result<bool, StoreError> {
                let updated = diesel::update(schema::signing_requests::dsl::signing_requests.filter(
                    schema::signing_requests::dsl::id.eq(id)
                ).filter(
                    schema::signing_requests::dsl::status.eq(SigningStatus::Pending)
                ))
                    .set(schema::signing_requests::dsl::status.eq(SigningStatus::Viewed))
                    .execute(c)?;
                if updated == 0 {
                    return Ok(false);
                }
                diesel::insert_into(schema::activity_log::dsl::activity_log)
                    .values(&activity)
                    .execute(c)?;
                Ok(true)
            })
        }).await
    }

    async fn commit_signature(&self, id: uuid::Uuid, record: SignedRecord) -> Result<Commit, StoreError> {
        self.run(move |c| {
            c.transaction(|c| -> Result<Commit, StoreError> {
                let updated = diesel::update(schema::signing_requests::dsl::signing_requests.filter(
                    schema::signing_requests::dsl::id.eq(id)
                ).filter(
                    schema::signing_requests::dsl::status.eq(SigningStatus::Pending)
                        .or(schema::signing_requests::dsl::status.eq(SigningStatus::Viewed))
                ))
                    .set((
                        schema::signing_requests::dsl::status.eq(SigningStatus::Signed),
                        schema::signing_requests::dsl::signed_at.eq(Some(record.signed_at)),
                        schema::signing_requests::dsl::signature_url.eq(record.signature_url),
                        schema::signing_requests::dsl::signed_file_url.eq(Some(record.signed_file_url)),
                    ))
                    .get_result::<models::SigningRequest>(c)
                    .optional()?;

                match updated {
                    Some(r) => {
                        if !record.values.is_empty() {
                            diesel::insert_into(schema::field_values::dsl::field_values)
                                .values(&record.values)
                                .execute(c)?;
                        }
                        Ok(Commit::Committed(r))
                    }
                    None => current_request(c, id),
                }
            })
        }).await
    }

    async fn cancel_request(&self, id: uuid::Uuid, activity: models::ActivityLog) -> Result<Commit, StoreError> {
        self.run(move |c| {
            c.transaction(|c| -> Result<Commit, StoreError> {
                let updated = diesel::update(schema::signing_requests::dsl::signing_requests.filter(
                    schema::signing_requests::dsl::id.eq(id)
                ).filter(
                    schema::signing_requests::dsl::status.eq(SigningStatus::Pending)
                        .or(schema::signing_requests::dsl::status.eq(SigningStatus::Viewed))
                ))
                    .set(schema::signing_requests::dsl::status.eq(SigningStatus::Cancelled))
                    .get_result::<models::SigningRequest>(c)
                    .optional()?;

                match updated {
                    Some(r) => {
                        diesel::insert_into(schema::activity_log::dsl::activity_log)
                            .values(&activity)
                            .execute(c)?;
                        Ok(Commit::Committed(r))
                    }
                    None => current_request(c, id),
                }
            })
        }).await
    }

    async fn field_values(&self, request_id: uuid::Uuid) -> Result<Vec<models::FieldValue>, StoreError> {
        self.run(move |c| {
            Ok(schema::field_values::dsl::field_values
                .filter(schema::field_values::dsl::signing_request_id.eq(request_id))
                .order(schema::field_values::dsl::created_at.asc())
                .load::<models::FieldValue>(c)?)
        }).await
    }

    async fn saved_signature(&self, email: &str) -> Result<Option<models::RecipientSignature>, StoreError> {
        let email = email.to_string();
        self.run(move |c| {
            Ok(schema::recipient_signatures::dsl::recipient_signatures
                .find(email)
                .first::<models::RecipientSignature>(c)
                .optional()?)
        }).await
    }

    async fn upsert_saved_signature(
        &self, email: &str, signature_path: Option<String>, initials_path: Option<String>,
    ) -> Result<(), StoreError> {
        let now = chrono::Utc::now();
        let row = models::RecipientSignature {
            recipient_email: email.to_string(),
            signature_path: signature_path.clone(),
            initials_path: initials_path.clone(),
            updated_at: now,
        };
        self.run(move |c| {
            let insert = diesel::insert_into(schema::recipient_signatures::dsl::recipient_signatures)
                .values(&row)
                .on_conflict(schema::recipient_signatures::dsl::recipient_email)
                .do_update();
            match (signature_path, initials_path) {
                (Some(s), Some(i)) => insert.set((
                    schema::recipient_signatures::dsl::signature_path.eq(s),
                    schema::recipient_signatures::dsl::initials_path.eq(i),
                    schema::recipient_signatures::dsl::updated_at.eq(now),
                )).execute(c)?,
                (Some(s), None) => insert.set((
                    schema::recipient_signatures::dsl::signature_path.eq(s),
                    schema::recipient_signatures::dsl::updated_at.eq(now),
                )).execute(c)?,
                (None, Some(i)) => insert.set((
                    schema::recipient_signatures::dsl::initials_path.eq(i),
                    schema::recipient_signatures::dsl::updated_at.eq(now),
                )).execute(c)?,
                (None, None) => return Ok(()),
            };
            Ok(())
        }).await
    }

    async fn insert_activity(&self, activity: models::ActivityLog) -> Result<(), StoreError> {
        self.run(move |c| {
            diesel::insert_into(schema::activity_log::dsl::activity_log)
                .values(&activity)
                .execute(c)?;
            Ok(())
        }).await
    }

    async fn activity(&self, document_id: uuid::Uuid) -> Result<Vec<models::ActivityLog>, StoreError> {
        self.run(move |c| {
            Ok(schema::activity_log::dsl::activity_log
                .filter(schema::activity_log::dsl::document_id.eq(document_id))
                .order(schema::activity_log::dsl::created_at.desc())
                .load::<models::ActivityLog>(c)?)
        }).await
    }
}
