pub use crate::files::authenticated_files;
use crate::documents::MAX_UPLOAD_BYTES;
use crate::error::{ErrorBody, SigningError};
use crate::layout::FieldDraft;
use crate::ratelimit::RateLimiter;
use crate::signing::{SigningService, Submission};
use crate::{models, Config};
use rocket::data::ToByteUnit;
use rocket::{catch, delete, get, post, put};
use rocket::serde::json::Json;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ClientMeta {
    pub ip: Option<std::net::IpAddr>,
    pub user_agent: Option<String>,
}

impl ClientMeta {
    /// Activity metadata about an action concerning `recipient_email`.
    pub fn metadata(&self, recipient_email: &str) -> serde_json::Value {
        serde_json::json!({
            "recipient_email": recipient_email,
            "ip": self.ip,
            "user_agent": self.user_agent,
        })
    }
}

#[rocket::async_trait]
impl<'r> rocket::request::FromRequest<'r> for ClientMeta {
    type Error = std::convert::Infallible;

    async fn from_request(request: &'r rocket::Request<'_>) -> rocket::request::Outcome<Self, Self::Error> {
        let mut ip = request.client_ip();
        if let Some(std::net::IpAddr::V6(v6_ip)) = ip {
            if let Some(v4_ip) = v6_ip.to_ipv4_mapped() {
                ip = Some(std::net::IpAddr::V4(v4_ip));
            }
        }

        rocket::request::Outcome::Success(ClientMeta {
            ip,
            user_agent: request.headers().get_one("User-Agent").map(str::to_string),
        })
    }
}

/// The signed-in sender, as asserted by the authenticating proxy in front of
/// this service.
#[derive(Debug, Clone, Copy)]
pub struct Sender(pub uuid::Uuid);

#[rocket::async_trait]
impl<'r> rocket::request::FromRequest<'r> for Sender {
    type Error = &'static str;

    async fn from_request(request: &'r rocket::Request<'_>) -> rocket::request::Outcome<Self, Self::Error> {
        let config = match request.guard::<&rocket::State<Config>>().await {
            rocket::request::Outcome::Success(c) => c,
            rocket::request::Outcome::Forward(f) => return rocket::request::Outcome::Forward(f),
            rocket::request::Outcome::Error(_) => return rocket::request::Outcome::Error((rocket::http::Status::InternalServerError, "Unable to get config")),
        };

        match request.headers().get_one(&config.sender_header).and_then(|v| uuid::Uuid::parse_str(v.trim()).ok()) {
            Some(id) => rocket::request::Outcome::Success(Sender(id)),
            None => rocket::request::Outcome::Error((rocket::http::Status::Unauthorized, "Missing sender identity")),
        }
    }
}

fn throttle(limiter: &RateLimiter, client: &ClientMeta, token: &str) -> Result<(), SigningError> {
    let ip = client.ip.map(|ip| ip.to_string()).unwrap_or_else(|| "unknown".to_string());
    if limiter.check(&format!("{}:{}", ip, token)) {
        Ok(())
    } else {
        warn!("Rate limited {} on a signing token", ip);
        Err(SigningError::RateLimited)
    }
}

#[get("/api/field-types")]
pub fn field_types() -> Json<&'static [crate::fields::FieldConfig]> {
    Json(&crate::fields::CATALOG)
}

#[get("/api/sign/<token>")]
pub async fn sign_session(
    token: &str, service: &rocket::State<SigningService>, limiter: &rocket::State<std::sync::Arc<RateLimiter>>,
    client_meta: ClientMeta,
) -> Result<Json<crate::signing::Session>, SigningError> {
    throttle(limiter, &client_meta, token)?;
    Ok(Json(service.resolve(token, &client_meta).await?))
}

#[post("/api/sign/<token>/submit", data = "<data>", format = "application/json")]
pub async fn sign_submit(
    token: &str, data: Json<Submission>, service: &rocket::State<SigningService>,
    limiter: &rocket::State<std::sync::Arc<RateLimiter>>, client_meta: ClientMeta,
) -> Result<Json<crate::signing::SubmitOutcome>, SigningError> {
    throttle(limiter, &client_meta, token)?;
    Ok(Json(service.submit(token, data.into_inner(), &client_meta).await?))
}

#[post("/api/documents?<title>", data = "<data>")]
pub async fn document_create(
    title: &str, data: rocket::Data<'_>, sender: Sender, service: &rocket::State<SigningService>,
    client_meta: ClientMeta,
) -> Result<(rocket::http::Status, Json<models::Document>), SigningError> {
    let body = data.open((MAX_UPLOAD_BYTES + 1).bytes()).into_bytes().await
        .map_err(|e| SigningError::InvalidInput(format!("unable to read upload: {}", e)))?;
    let document = service.documents().create(sender.0, title, body.into_inner(), &client_meta).await?;
    Ok((rocket::http::Status::Created, Json(document)))
}

#[get("/api/documents/<id>")]
pub async fn document_detail(
    id: uuid::Uuid, sender: Sender, service: &rocket::State<SigningService>,
) -> Result<Json<crate::documents::DocumentDetail>, SigningError> {
    Ok(Json(service.documents().detail(sender.0, id).await?))
}

#[delete("/api/documents/<id>")]
pub async fn document_delete(
    id: uuid::Uuid, sender: Sender, service: &rocket::State<SigningService>,
) -> Result<rocket::http::Status, SigningError> {
    service.documents().delete(sender.0, id).await?;
    Ok(rocket::http::Status::NoContent)
}

#[get("/api/documents/<id>/fields")]
pub async fn document_fields(
    id: uuid::Uuid, sender: Sender, service: &rocket::State<SigningService>,
) -> Result<Json<Vec<models::DocumentField>>, SigningError> {
    Ok(Json(service.documents().fields(sender.0, id).await?))
}

#[put("/api/documents/<id>/fields", data = "<data>", format = "application/json")]
pub async fn document_fields_save(
    id: uuid::Uuid, data: Json<Vec<FieldDraft>>, sender: Sender, service: &rocket::State<SigningService>,
    client_meta: ClientMeta,
) -> Result<Json<Vec<models::DocumentField>>, SigningError> {
    Ok(Json(service.documents().save_fields(sender.0, id, data.into_inner(), &client_meta).await?))
}

#[derive(Deserialize)]
pub struct RequestsData {
    recipients: Vec<String>,
    #[serde(default)]
    message: Option<String>,
}

#[post("/api/documents/<id>/requests", data = "<data>", format = "application/json")]
pub async fn document_requests(
    id: uuid::Uuid, data: Json<RequestsData>, sender: Sender, service: &rocket::State<SigningService>,
    client_meta: ClientMeta,
) -> Result<Json<Vec<crate::signing::IssuedRequest>>, SigningError> {
    let data = data.into_inner();
    Ok(Json(service.create_requests(sender.0, id, data.recipients, data.message, &client_meta).await?))
}

#[get("/api/documents/<id>/activity")]
pub async fn document_activity(
    id: uuid::Uuid, sender: Sender, service: &rocket::State<SigningService>,
) -> Result<Json<Vec<models::ActivityLog>>, SigningError> {
    Ok(Json(service.documents().activity(sender.0, id).await?))
}

#[post("/api/requests/<id>/cancel")]
pub async fn request_cancel(
    id: uuid::Uuid, sender: Sender, service: &rocket::State<SigningService>, client_meta: ClientMeta,
) -> Result<Json<crate::signing::CancelOutcome>, SigningError> {
    Ok(Json(service.cancel(sender.0, id, &client_meta).await?))
}

#[post("/api/requests/<id>/resend")]
pub async fn request_resend(
    id: uuid::Uuid, sender: Sender, service: &rocket::State<SigningService>,
) -> Result<rocket::http::Status, SigningError> {
    service.resend(sender.0, id).await?;
    Ok(rocket::http::Status::NoContent)
}

#[derive(Serialize)]
pub struct DownloadLink {
    url: String,
}

#[get("/api/requests/<id>/download")]
pub async fn request_download(
    id: uuid::Uuid, sender: Sender, service: &rocket::State<SigningService>,
) -> Result<Json<DownloadLink>, SigningError> {
    Ok(Json(DownloadLink {
        url: service.signed_file_link(sender.0, id).await?,
    }))
}

#[catch(default)]
pub fn default_catcher(status: rocket::http::Status, _req: &rocket::Request<'_>) -> (rocket::http::Status, Json<ErrorBody>) {
    (status, Json(ErrorBody {
        error: status.reason_lossy().to_string(),
        status: None,
        signed_at: None,
        errors: vec![],
    }))
}

pub fn routes() -> Vec<rocket::Route> {
    rocket::routes![
        field_types,
        sign_session,
        sign_submit,
        document_create,
        document_detail,
        document_delete,
        document_fields,
        document_fields_save,
        document_requests,
        document_activity,
        request_cancel,
        request_resend,
        request_download,
        authenticated_files,
    ]
}
