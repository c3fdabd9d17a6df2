#[derive(diesel_derive_enum::DbEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[ExistingTypePath = "crate::schema::sql_types::FieldType"]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Signature,
    Initials,
    Text,
    Date,
    Checkbox,
    Dropdown,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Signature => "signature",
            Self::Initials => "initials",
            Self::Text => "text",
            Self::Date => "date",
            Self::Checkbox => "checkbox",
            Self::Dropdown => "dropdown",
        })
    }
}

#[derive(diesel_derive_enum::DbEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[ExistingTypePath = "crate::schema::sql_types::FieldValidation"]
#[serde(rename_all = "snake_case")]
pub enum FieldValidation {
    #[default]
    None,
    Number,
    Email,
    Phone,
}

#[derive(diesel_derive_enum::DbEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[ExistingTypePath = "crate::schema::sql_types::SigningStatus"]
#[serde(rename_all = "snake_case")]
pub enum SigningStatus {
    Pending,
    Viewed,
    Signed,
    Cancelled,
    Declined,
}

impl SigningStatus {
    /// Whether a recipient may still act on a request in this state.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Viewed)
    }

    /// Counts towards document completion.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Signed | Self::Cancelled)
    }
}

impl std::fmt::Display for SigningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Viewed => "viewed",
            Self::Signed => "signed",
            Self::Cancelled => "cancelled",
            Self::Declined => "declined",
        })
    }
}

#[derive(diesel_derive_enum::DbEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[ExistingTypePath = "crate::schema::sql_types::DocumentStatus"]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Draft,
    Pending,
    Completed,
}

#[derive(diesel_derive_enum::DbEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[ExistingTypePath = "crate::schema::sql_types::ActivityAction"]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    DocumentUploaded,
    DocumentPrepared,
    SignatureRequested,
    DocumentViewed,
    DocumentSigned,
    RequestCancelled,
}

pub mod sql_types {
    #[derive(diesel::query_builder::QueryId, diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "field_type"))]
    pub struct FieldType;

    #[derive(diesel::query_builder::QueryId, diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "field_validation"))]
    pub struct FieldValidation;

    #[derive(diesel::query_builder::QueryId, diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "signing_status"))]
    pub struct SigningStatus;

    #[derive(diesel::query_builder::QueryId, diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "document_status"))]
    pub struct DocumentStatus;

    #[derive(diesel::query_builder::QueryId, diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "activity_action"))]
    pub struct ActivityAction;
}

diesel::table! {
    use diesel::sql_types::*;
    use super::sql_types::DocumentStatus;

    documents (id) {
        id -> Uuid,
        title -> Varchar,
        file_url -> Varchar,
        converted_pdf_url -> Nullable<Varchar>,
        status -> DocumentStatus,
        sender_id -> Uuid,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;
    use super::sql_types::{FieldType, FieldValidation};

    document_fields (id) {
        id -> Uuid,
        document_id -> Uuid,
        field_type -> FieldType,
        label -> Varchar,
        placeholder -> Nullable<Varchar>,
        required -> Bool,
        validation -> FieldValidation,
        font_size -> Int4,
        page_number -> Int4,
        position_x -> Float8,
        position_y -> Float8,
        width -> Float8,
        height -> Float8,
        options -> Array<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;
    use super::sql_types::SigningStatus;

    signing_requests (id) {
        id -> Uuid,
        document_id -> Uuid,
        recipient_email -> Varchar,
        recipient_id -> Nullable<Uuid>,
        token -> Varchar,
        status -> SigningStatus,
        message -> Nullable<Varchar>,
        signed_at -> Nullable<Timestamptz>,
        signature_url -> Nullable<Varchar>,
        signed_file_url -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    field_values (id) {
        id -> Uuid,
        signing_request_id -> Uuid,
        document_field_id -> Uuid,
        value -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    recipient_signatures (recipient_email) {
        recipient_email -> Varchar,
        signature_path -> Nullable<Varchar>,
        initials_path -> Nullable<Varchar>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;
    use super::sql_types::ActivityAction;

    activity_log (id) {
        id -> Uuid,
        document_id -> Uuid,
        user_id -> Nullable<Uuid>,
        action -> ActivityAction,
        metadata -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    profiles (id) {
        id -> Uuid,
        email -> Varchar,
        full_name -> Nullable<Varchar>,
    }
}

diesel::joinable!(document_fields -> documents (document_id));
diesel::joinable!(signing_requests -> documents (document_id));
diesel::joinable!(field_values -> signing_requests (signing_request_id));
diesel::joinable!(activity_log -> documents (document_id));

diesel::allow_tables_to_appear_in_same_query!(
    documents,
    document_fields,
    signing_requests,
    field_values,
    recipient_signatures,
    activity_log,
    profiles,
);
