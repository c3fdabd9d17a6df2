use crate::fields::FieldError;
use crate::schema::SigningStatus;

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("some fields are invalid")]
    Validation(Vec<FieldError>),
    #[error(transparent)]
    Layout(#[from] crate::layout::LayoutError),
    #[error("not found")]
    NotFound,
    #[error("this signing request is no longer available")]
    Gone { status: SigningStatus },
    #[error("this document has already been signed")]
    Conflict { signed_at: Option<chrono::DateTime<chrono::Utc>> },
    #[error("{0}")]
    InvalidTransition(String),
    #[error("too many requests")]
    RateLimited,
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Files(#[from] crate::files::FileError),
    #[error(transparent)]
    Pdf(#[from] crate::pdf::PdfError),
    #[error(transparent)]
    Mail(#[from] crate::mail::MailError),
    #[error("{0}")]
    Internal(String),
}

impl From<crate::signatures::SignatureError> for SigningError {
    fn from(err: crate::signatures::SignatureError) -> Self {
        match err {
            crate::signatures::SignatureError::Foreign => SigningError::InvalidInput(err.to_string()),
            crate::signatures::SignatureError::Store(e) => SigningError::Store(e),
            crate::signatures::SignatureError::Files(e) => SigningError::Files(e),
        }
    }
}

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SigningStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
}

impl SigningError {
    pub fn status(&self) -> rocket::http::Status {
        use rocket::http::Status;
        match self {
            SigningError::InvalidInput(_) => Status::BadRequest,
            SigningError::Validation(_) | SigningError::Layout(_) => Status::UnprocessableEntity,
            SigningError::NotFound => Status::NotFound,
            SigningError::Gone { .. } => Status::Gone,
            SigningError::Conflict { .. } | SigningError::InvalidTransition(_) => Status::Conflict,
            SigningError::RateLimited => Status::TooManyRequests,
            SigningError::Store(_) | SigningError::Files(_) | SigningError::Pdf(_)
            | SigningError::Mail(_) | SigningError::Internal(_) => Status::InternalServerError,
        }
    }

    pub fn body(&self) -> ErrorBody {
        let mut body = ErrorBody {
            error: self.to_string(),
            status: None,
            signed_at: None,
            errors: vec![],
        };
        match self {
            SigningError::Gone { status } => {
                body.status = Some(*status);
                if *status == SigningStatus::Cancelled {
                    body.error = "This signing request has been cancelled".to_string();
                }
            }
            SigningError::Conflict { signed_at } => {
                body.status = Some(SigningStatus::Signed);
                body.signed_at = *signed_at;
            }
            SigningError::Validation(errors) => body.errors = errors.clone(),
            _ if self.status() == rocket::http::Status::InternalServerError => {
                body.error = "Internal server error".to_string();
            }
            _ => {}
        }
        body
    }
}

impl<'r> rocket::response::Responder<'r, 'static> for SigningError {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        let status = self.status();
        if status == rocket::http::Status::InternalServerError {
            error!("{} {}: {}", req.method(), req.uri(), self);
        } else {
            debug!("{} {}: {}", req.method(), req.uri(), self);
        }
        (status, rocket::serde::json::Json(self.body())).respond_to(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collaborator_failures_hide_details() {
        let err = SigningError::Files(crate::files::FileError::NotFound("signed/secret.pdf".to_string()));
        assert_eq!(err.status(), rocket::http::Status::InternalServerError);
        assert_eq!(err.body().error, "Internal server error");
    }

    #[test]
    fn conflict_carries_signed_at() {
        let at = chrono::Utc::now();
        let body = serde_json::to_value(SigningError::Conflict { signed_at: Some(at) }.body()).unwrap();
        assert_eq!(body["status"], "signed");
        assert_eq!(body["signed_at"], serde_json::to_value(at).unwrap());
        assert!(body.get("errors").is_none());
    }

    #[test]
    fn cancelled_is_gone() {
        let err = SigningError::Gone { status: SigningStatus::Cancelled };
        assert_eq!(err.status(), rocket::http::Status::Gone);
        let body = serde_json::to_value(err.body()).unwrap();
        assert_eq!(body["status"], "cancelled");
        assert_eq!(body["error"], "This signing request has been cancelled");
    }
}
