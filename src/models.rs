use crate::schema::*;

#[derive(Insertable, Queryable, Identifiable, AsChangeset, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[diesel(table_name = documents)]
pub struct Document {
    pub id: uuid::Uuid,
    pub title: String,
    pub file_url: String,
    pub converted_pdf_url: Option<String>,
    pub status: DocumentStatus,
    pub sender_id: uuid::Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Document {
    /// Storage path of the PDF that fields were placed on.
    pub fn source_path(&self) -> &str {
        self.converted_pdf_url.as_deref().unwrap_or(&self.file_url)
    }
}

#[derive(Insertable, Queryable, Identifiable, AsChangeset, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[diesel(table_name = document_fields)]
pub struct DocumentField {
    pub id: uuid::Uuid,
    pub document_id: uuid::Uuid,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub label: String,
    pub placeholder: Option<String>,
    pub required: bool,
    pub validation: FieldValidation,
    pub font_size: i32,
    pub page_number: i32,
    pub position_x: f64,
    pub position_y: f64,
    pub width: f64,
    pub height: f64,
    pub options: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl DocumentField {
    pub fn rect(&self) -> crate::geometry::PercentRect {
        crate::geometry::PercentRect {
            x: self.position_x,
            y: self.position_y,
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Insertable, Queryable, Identifiable, AsChangeset, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[diesel(table_name = signing_requests)]
pub struct SigningRequest {
    pub id: uuid::Uuid,
    pub document_id: uuid::Uuid,
    pub recipient_email: String,
    pub recipient_id: Option<uuid::Uuid>,
    #[serde(skip_serializing)]
    pub token: String,
    pub status: SigningStatus,
    pub message: Option<String>,
    pub signed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub signature_url: Option<String>,
    pub signed_file_url: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Insertable, Queryable, Identifiable, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[diesel(table_name = field_values)]
pub struct FieldValue {
    pub id: uuid::Uuid,
    pub signing_request_id: uuid::Uuid,
    pub document_field_id: uuid::Uuid,
    pub value: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Insertable, Queryable, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[diesel(table_name = recipient_signatures)]
pub struct RecipientSignature {
    pub recipient_email: String,
    pub signature_path: Option<String>,
    pub initials_path: Option<String>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Insertable, Queryable, Identifiable, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[diesel(table_name = activity_log)]
pub struct ActivityLog {
    pub id: uuid::Uuid,
    pub document_id: uuid::Uuid,
    pub user_id: Option<uuid::Uuid>,
    pub action: ActivityAction,
    pub metadata: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ActivityLog {
    pub fn new(document_id: uuid::Uuid, user_id: Option<uuid::Uuid>, action: ActivityAction, metadata: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            document_id,
            user_id,
            action,
            metadata,
            created_at: chrono::Utc::now(),
        }
    }
}

#[derive(Queryable, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Profile {
    pub id: uuid::Uuid,
    pub email: String,
    pub full_name: Option<String>,
}

impl Profile {
    pub fn display_name(&self) -> &str {
        self.full_name.as_deref().filter(|n| !n.trim().is_empty()).unwrap_or(&self.email)
    }
}
