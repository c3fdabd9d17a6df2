//! The six field types and their per-type rules.

use crate::schema::{FieldType, FieldValidation};

pub const MIN_FONT_SIZE: i32 = 8;
pub const MAX_FONT_SIZE: i32 = 32;
pub const DEFAULT_FONT_SIZE: i32 = 14;

/// The literal value a checked checkbox submits.
pub const CHECKED: &str = "true";

lazy_static::lazy_static! {
    static ref EMAIL_RE: regex::Regex = regex::Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap();
    static ref PHONE_RE: regex::Regex = regex::Regex::new(r"^[\d\s\-+()]{7,}$").unwrap();
}

/// Editor defaults for a field type.
#[derive(Debug, Clone, Serialize)]
pub struct FieldConfig {
    pub field_type: FieldType,
    pub label: &'static str,
    pub default_width: f64,
    pub default_height: f64,
    pub placeholder: Option<&'static str>,
    pub options: &'static [&'static str],
}

pub const CATALOG: [FieldConfig; 6] = [
    FieldConfig {
        field_type: FieldType::Signature,
        label: "Signature",
        default_width: 22.0,
        default_height: 8.0,
        placeholder: None,
        options: &[],
    },
    FieldConfig {
        field_type: FieldType::Text,
        label: "Text",
        default_width: 20.0,
        default_height: 6.0,
        placeholder: Some("Text"),
        options: &[],
    },
    FieldConfig {
        field_type: FieldType::Date,
        label: "Date",
        default_width: 16.0,
        default_height: 6.0,
        placeholder: Some("MM/DD/YYYY"),
        options: &[],
    },
    FieldConfig {
        field_type: FieldType::Checkbox,
        label: "Checkbox",
        default_width: 6.0,
        default_height: 6.0,
        placeholder: None,
        options: &[],
    },
    FieldConfig {
        field_type: FieldType::Initials,
        label: "Initials",
        default_width: 12.0,
        default_height: 6.0,
        placeholder: Some("Initials"),
        options: &[],
    },
    FieldConfig {
        field_type: FieldType::Dropdown,
        label: "Dropdown",
        default_width: 18.0,
        default_height: 6.0,
        placeholder: None,
        options: &["Option 1", "Option 2"],
    },
];

impl FieldType {
    pub fn config(self) -> &'static FieldConfig {
        CATALOG
            .iter()
            .find(|c| c.field_type == self)
            .unwrap_or(&CATALOG[0])
    }

    /// Filled with an image rather than a typed value.
    pub fn takes_image(self) -> bool {
        matches!(self, Self::Signature | Self::Initials)
    }

    /// Whether `value` satisfies a `required` flag for this type.
    pub fn is_filled(self, value: Option<&str>) -> bool {
        match self {
            Self::Checkbox => value == Some(CHECKED),
            _ => value.map(|v| !v.trim().is_empty()).unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Invalid {
    Required,
    Number,
    Email,
    Phone,
}

impl std::fmt::Display for Invalid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Required => "This field is required",
            Self::Number => "Must be a number",
            Self::Email => "Invalid email",
            Self::Phone => "Invalid phone number",
        })
    }
}

impl FieldValidation {
    pub fn check(self, value: &str) -> Result<(), Invalid> {
        match self {
            Self::None => Ok(()),
            Self::Number => match value.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(()),
                _ => Err(Invalid::Number),
            },
            Self::Email => {
                if EMAIL_RE.is_match(value) {
                    Ok(())
                } else {
                    Err(Invalid::Email)
                }
            }
            Self::Phone => {
                if PHONE_RE.is_match(value) {
                    Ok(())
                } else {
                    Err(Invalid::Phone)
                }
            }
        }
    }
}

/// One field that failed submission checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub field_id: uuid::Uuid,
    pub label: String,
    pub reason: Invalid,
    pub message: String,
}

/// Checks a recipient's answers against every field of the document.
///
/// Image fields count as filled when `has_image` reports an image for them.
/// Validation rules apply to text fields with a non-empty value only.
pub fn check_submission<'a, V, I>(
    fields: &[crate::models::DocumentField], value: V, has_image: I,
) -> Result<(), Vec<FieldError>>
where
    V: Fn(&uuid::Uuid) -> Option<&'a str>,
    I: Fn(&uuid::Uuid) -> bool,
{
    let mut errors = vec![];
    for field in fields {
        let reason = if field.field_type.takes_image() {
            if field.required && !has_image(&field.id) {
                Some(Invalid::Required)
            } else {
                None
            }
        } else {
            let v = value(&field.id);
            if field.required && !field.field_type.is_filled(v) {
                Some(Invalid::Required)
            } else if field.field_type == FieldType::Text {
                match v {
                    Some(v) if !v.is_empty() => field.validation.check(v).err(),
                    _ => None,
                }
            } else {
                None
            }
        };

        if let Some(reason) = reason {
            errors.push(FieldError {
                field_id: field.id,
                label: if field.label.is_empty() { field.field_type.to_string() } else { field.label.clone() },
                reason,
                message: reason.to_string(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn clamp_font_size(size: i32) -> i32 {
    size.max(MIN_FONT_SIZE).min(MAX_FONT_SIZE)
}
