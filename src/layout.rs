//! Field placement operations performed by the layout editor, and the
//! replace-by-diff that persists an edited layout.

use crate::fields::{self, FieldConfig};
use crate::geometry::{clamp, PercentRect, FULL};
use crate::models::DocumentField;
use crate::schema::{FieldType, FieldValidation};

/// Smallest width/height a resize may produce, in percent.
pub const MIN_SIZE: f64 = 4.0;

/// A field as the editor sends it. `db_id` is set for fields loaded from
/// storage; fields added in this session have none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDraft {
    #[serde(default)]
    pub db_id: Option<uuid::Uuid>,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub validation: FieldValidation,
    #[serde(default = "default_font_size")]
    pub font_size: i32,
    pub page_number: i32,
    pub position_x: f64,
    pub position_y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub options: Vec<String>,
}

fn default_required() -> bool {
    true
}

fn default_font_size() -> i32 {
    fields::DEFAULT_FONT_SIZE
}

/// Why a draft cannot be saved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("field {0}: page number must be at least 1")]
    Page(usize),
    #[error("field {0}: the document has no such page")]
    PageOutOfRange(usize),
    #[error("field {0}: box must lie within the page")]
    Geometry(usize),
    #[error("field {0}: font size must be between 8 and 32")]
    FontSize(usize),
    #[error("field {0}: validation only applies to text fields")]
    Validation(usize),
    #[error("field {0}: dropdown needs at least one option")]
    Options(usize),
    #[error("field {0}: unknown field id")]
    UnknownField(usize),
    #[error("field {0}: duplicate field id")]
    DuplicateField(usize),
}

impl FieldDraft {
    pub fn rect(&self) -> PercentRect {
        PercentRect {
            x: self.position_x,
            y: self.position_y,
            width: self.width,
            height: self.height,
        }
    }

    fn set_rect(&mut self, r: PercentRect) {
        self.position_x = r.x;
        self.position_y = r.y;
        self.width = r.width;
        self.height = r.height;
    }

    /// New field dropped at a pointer position given in percent of the page.
    pub fn dropped(config: &FieldConfig, page_number: i32, pointer_x: f64, pointer_y: f64) -> Self {
        FieldDraft {
            db_id: None,
            field_type: config.field_type,
            label: config.label.to_string(),
            placeholder: config.placeholder.map(str::to_string),
            required: true,
            validation: FieldValidation::None,
            font_size: fields::DEFAULT_FONT_SIZE,
            page_number: page_number.max(1),
            position_x: clamp(pointer_x, 0.0, FULL - config.default_width),
            position_y: clamp(pointer_y, 0.0, FULL - config.default_height),
            width: config.default_width,
            height: config.default_height,
            options: config.options.iter().map(|o| o.to_string()).collect(),
        }
    }

    /// Drag by a pixel delta measured over a container of the given size.
    pub fn move_by(&mut self, dx: f64, dy: f64, container_width: f64, container_height: f64) {
        let mut r = self.rect();
        r.x = clamp(r.x + dx / container_width * FULL, 0.0, FULL - r.width);
        r.y = clamp(r.y + dy / container_height * FULL, 0.0, FULL - r.height);
        self.set_rect(r);
    }

    /// Resize from the bottom-right handle by a pixel delta.
    pub fn resize_by(&mut self, dx: f64, dy: f64, container_width: f64, container_height: f64) {
        let mut r = self.rect();
        r.width = clamp(r.width + dx / container_width * FULL, MIN_SIZE, FULL - r.x);
        r.height = clamp(r.height + dy / container_height * FULL, MIN_SIZE, FULL - r.y);
        self.set_rect(r);
    }

    pub fn validate(&self, index: usize) -> Result<(), LayoutError> {
        if self.page_number < 1 {
            return Err(LayoutError::Page(index));
        }
        if !self.rect().is_valid() {
            return Err(LayoutError::Geometry(index));
        }
        if fields::clamp_font_size(self.font_size) != self.font_size {
            return Err(LayoutError::FontSize(index));
        }
        if self.field_type != FieldType::Text && self.validation != FieldValidation::None {
            return Err(LayoutError::Validation(index));
        }
        if self.field_type == FieldType::Dropdown && self.options.iter().all(|o| o.trim().is_empty()) {
            return Err(LayoutError::Options(index));
        }
        Ok(())
    }
}

/// What saving a layout does to the stored rows.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDiff {
    pub delete: Vec<uuid::Uuid>,
    pub upsert: Vec<DocumentField>,
}

impl FieldDiff {
    /// Rows absent from `drafts` are deleted; every draft is upserted, keeping
    /// its identity and creation time when it already exists.
    pub fn compute(document_id: uuid::Uuid, existing: &[DocumentField], drafts: Vec<FieldDraft>) -> Result<Self, LayoutError> {
        let mut seen = std::collections::HashSet::new();
        let now = chrono::Utc::now();
        let mut upsert = Vec::with_capacity(drafts.len());

        for (i, draft) in drafts.into_iter().enumerate() {
            draft.validate(i)?;
            let (id, created_at) = match draft.db_id {
                Some(id) => match existing.iter().find(|f| f.id == id) {
                    Some(f) => (f.id, f.created_at),
                    None => return Err(LayoutError::UnknownField(i)),
                },
                None => (uuid::Uuid::new_v4(), now),
            };
            if !seen.insert(id) {
                return Err(LayoutError::DuplicateField(i));
            }
            upsert.push(DocumentField {
                id,
                document_id,
                field_type: draft.field_type,
                label: draft.label,
                placeholder: draft.placeholder,
                required: draft.required,
                validation: draft.validation,
                font_size: draft.font_size,
                page_number: draft.page_number,
                position_x: draft.position_x,
                position_y: draft.position_y,
                width: draft.width,
                height: draft.height,
                options: if draft.field_type == FieldType::Dropdown { draft.options } else { vec![] },
                created_at,
            });
        }

        let delete = existing
            .iter()
            .map(|f| f.id)
            .filter(|id| !seen.contains(id))
            .collect();

        Ok(FieldDiff { delete, upsert })
    }
}
