//! HTTP-level tests driving the assembled app through Rocket's local client
//! against the in-memory stores.

mod common;

use common::*;
use docseal::schema::SigningStatus;
use docseal::store::Store;
use rocket::http::{ContentType, Status};

fn layout() -> serde_json::Value {
    serde_json::json!([
        { "type": "signature", "page_number": 1, "position_x": 10.0, "position_y": 70.0, "width": 30.0, "height": 8.0 },
        { "type": "text", "label": "Email", "validation": "email", "required": false,
          "page_number": 1, "position_x": 10.0, "position_y": 10.0, "width": 40.0, "height": 5.0 },
        { "type": "checkbox", "label": "I agree", "required": false,
          "page_number": 2, "position_x": 10.0, "position_y": 20.0, "width": 30.0, "height": 5.0 },
    ])
}

fn field_id(fields: &serde_json::Value, field_type: &str) -> String {
    fields.as_array().unwrap().iter()
        .find(|f| f["type"] == field_type)
        .and_then(|f| f["id"].as_str())
        .expect("field present")
        .to_string()
}

fn submission(fields: &serde_json::Value, email: &str) -> serde_json::Value {
    serde_json::json!({
        "field_values": [
            { "document_field_id": field_id(fields, "text"), "value": email },
            { "document_field_id": field_id(fields, "checkbox"), "value": "true" },
        ],
        "signature_data": [
            { "document_field_id": field_id(fields, "signature"), "data_url": signature_data_url() },
        ],
    })
}

#[tokio::test]
async fn document_is_prepared_sent_and_signed() {
    let app = build_test_app().await;
    let document = upload(&app, "Lease", 2).await;
    let document_id = document["id"].as_str().unwrap();
    assert_eq!(document["status"], "draft");

    let fields = save_fields(&app, document_id, layout()).await;
    assert_eq!(fields.as_array().unwrap().len(), 3);

    let issued = send(&app, document_id, &["bob@example.com"]).await;
    let (request_id, token) = &issued[0];
    assert_eq!(app.transport.sent().len(), 1);

    let response = app.client.get(format!("/api/sign/{}", token)).dispatch().await;
    assert_eq!(response.status(), Status::Ok);
    let session = body_json(response).await;
    assert_eq!(session["request"]["status"], "viewed");
    assert_eq!(session["document"]["sender_name"], "Alice Sender");
    assert_eq!(session["fields"].as_array().unwrap().len(), 3);

    let file = app.client.get(local_path(session["document"]["file_url"].as_str().unwrap())).dispatch().await;
    assert_eq!(file.status(), Status::Ok);
    assert_eq!(file.content_type(), Some(ContentType::PDF));

    let response = app.client.post(format!("/api/sign/{}/submit", token))
        .json(&submission(&fields, "bob@example.com"))
        .dispatch().await;
    assert_eq!(response.status(), Status::Ok);
    let outcome = body_json(response).await;
    assert_eq!(outcome["document_status"], "completed");
    assert!(outcome["skipped_fields"].as_array().unwrap().is_empty());

    let signed = app.client.get(local_path(outcome["download_url"].as_str().unwrap())).dispatch().await;
    assert_eq!(signed.status(), Status::Ok);
    assert!(signed.into_bytes().await.unwrap().starts_with(b"%PDF-"));

    let again = app.client.post(format!("/api/sign/{}/submit", token))
        .json(&submission(&fields, "bob@example.com"))
        .dispatch().await;
    assert_eq!(again.status(), Status::Conflict);
    let body = body_json(again).await;
    assert_eq!(body["status"], "signed");
    assert_eq!(body["signed_at"], outcome["signed_at"]);

    let response = app.client.get(format!("/api/sign/{}", token)).dispatch().await;
    assert_eq!(response.status(), Status::Conflict);

    let link = app.client.get(format!("/api/requests/{}/download", request_id))
        .header(as_sender(SENDER))
        .dispatch().await;
    assert_eq!(link.status(), Status::Ok);

    let activity = app.client.get(format!("/api/documents/{}/activity", document_id))
        .header(as_sender(SENDER))
        .dispatch().await;
    let actions = body_json(activity).await.as_array().unwrap().iter()
        .map(|a| a["action"].as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert_eq!(actions, vec![
        "document_signed", "document_viewed", "signature_requested", "document_prepared", "document_uploaded",
    ]);

    let copies = app.transport.sent().into_iter().filter(|m| m.raw.contains("Subject: Signed: Lease")).count();
    assert_eq!(copies, 2);
}

#[tokio::test]
async fn sender_routes_need_the_owner() {
    let app = build_test_app().await;
    let document = upload(&app, "Lease", 1).await;
    let document_id = document["id"].as_str().unwrap();

    let anonymous = app.client.get(format!("/api/documents/{}/fields", document_id)).dispatch().await;
    assert_eq!(anonymous.status(), Status::Unauthorized);
    assert!(body_json(anonymous).await["error"].is_string());

    let stranger = app.client.get(format!("/api/documents/{}/fields", document_id))
        .header(as_sender(uuid::Uuid::new_v4()))
        .dispatch().await;
    assert_eq!(stranger.status(), Status::NotFound);

    let owner = app.client.get(format!("/api/documents/{}", document_id))
        .header(as_sender(SENDER))
        .dispatch().await;
    assert_eq!(owner.status(), Status::Ok);
    assert_eq!(body_json(owner).await["title"], "Lease");
}

#[tokio::test]
async fn uploads_must_be_pdf() {
    let app = build_test_app().await;
    let response = app.client.post("/api/documents?title=Notes")
        .header(as_sender(SENDER))
        .body("just some text")
        .dispatch().await;
    assert_eq!(response.status(), Status::BadRequest);
    assert!(app.files.paths().await.is_empty());
}

#[tokio::test]
async fn fields_off_the_document_are_rejected() {
    let app = build_test_app().await;
    let document = upload(&app, "Lease", 1).await;
    let document_id = document["id"].as_str().unwrap();

    let response = app.client.put(format!("/api/documents/{}/fields", document_id))
        .header(as_sender(SENDER))
        .json(&layout())
        .dispatch().await;
    assert_eq!(response.status(), Status::UnprocessableEntity);
}

#[tokio::test]
async fn invalid_values_are_reported_per_field() {
    let app = build_test_app().await;
    let document = upload(&app, "Lease", 2).await;
    let document_id = document["id"].as_str().unwrap();
    let fields = save_fields(&app, document_id, layout()).await;
    let issued = send(&app, document_id, &["bob@example.com"]).await;
    let (request_id, token) = &issued[0];

    let response = app.client.post(format!("/api/sign/{}/submit", token))
        .json(&submission(&fields, "not-an-email"))
        .dispatch().await;
    assert_eq!(response.status(), Status::UnprocessableEntity);
    let body = body_json(response).await;
    assert_eq!(body["errors"].as_array().unwrap().len(), 1);
    assert_eq!(body["errors"][0]["field_id"], field_id(&fields, "text"));
    assert_eq!(body["errors"][0]["reason"], "email");

    let request_id = uuid::Uuid::parse_str(request_id).unwrap();
    assert!(app.store.field_values(request_id).await.unwrap().is_empty());
    assert_eq!(app.store.request(request_id).await.unwrap().unwrap().status, SigningStatus::Pending);
}

#[tokio::test]
async fn sender_cancels_the_last_recipient() {
    let app = build_test_app().await;
    let document = upload(&app, "Lease", 2).await;
    let document_id = document["id"].as_str().unwrap();
    let fields = save_fields(&app, document_id, layout()).await;
    let issued = send(&app, document_id, &["a@example.com", "b@example.com"]).await;
    let (_, token_a) = &issued[0];
    let (request_b, token_b) = &issued[1];

    let response = app.client.post(format!("/api/sign/{}/submit", token_a))
        .json(&submission(&fields, "a@example.com"))
        .dispatch().await;
    assert_eq!(body_json(response).await["document_status"], "pending");

    let no_recipient_cancel = app.client.post(format!("/api/sign/{}/cancel", token_b)).dispatch().await;
    assert_eq!(no_recipient_cancel.status(), Status::NotFound);

    let cancelled = app.client.post(format!("/api/requests/{}/cancel", request_b))
        .header(as_sender(SENDER))
        .dispatch().await;
    assert_eq!(cancelled.status(), Status::Ok);
    let body = body_json(cancelled).await;
    assert_eq!(body["request"]["status"], "cancelled");
    assert_eq!(body["document_status"], "completed");

    let gone = app.client.get(format!("/api/sign/{}", token_b)).dispatch().await;
    assert_eq!(gone.status(), Status::Gone);
    assert_eq!(body_json(gone).await["status"], "cancelled");

    let resend = app.client.post(format!("/api/requests/{}/resend", request_b))
        .header(as_sender(SENDER))
        .dispatch().await;
    assert_eq!(resend.status(), Status::Conflict);
}

#[tokio::test]
async fn token_routes_are_rate_limited() {
    let app = build_test_app().await;
    for _ in 0..5 {
        let response = app.client.get("/api/sign/unknown-token").dispatch().await;
        assert_eq!(response.status(), Status::NotFound);
    }
    let response = app.client.get("/api/sign/unknown-token").dispatch().await;
    assert_eq!(response.status(), Status::TooManyRequests);

    let other = app.client.get("/api/sign/another-token").dispatch().await;
    assert_eq!(other.status(), Status::NotFound);
}

#[tokio::test]
async fn file_links_are_checked() {
    let app = build_test_app().await;
    let document = upload(&app, "Lease", 1).await;
    let path = document["file_url"].as_str().unwrap();

    let forged = app.client.get(format!("/files/{}?key=4102444800;AAAA", path)).dispatch().await;
    assert_eq!(forged.status(), Status::Forbidden);

    let malformed = app.client.get(format!("/files/{}?key=nonsense", path)).dispatch().await;
    assert_eq!(malformed.status(), Status::UnprocessableEntity);
}
