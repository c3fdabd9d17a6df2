use std::sync::Arc;

use docseal::files::MemoryFileStore;
use docseal::mail::RecordingTransport;
use docseal::models::Profile;
use docseal::store::MemoryStore;
use rocket::http::{ContentType, Header};
use rocket::local::asynchronous::{Client, LocalResponse};

pub const SENDER: uuid::Uuid = uuid::Uuid::from_u128(0xa11ce);
pub const EXTERNAL_URI: &str = "https://sign.test";

pub struct TestApp {
    pub client: Client,
    pub store: Arc<MemoryStore>,
    pub files: Arc<MemoryFileStore>,
    pub transport: Arc<RecordingTransport>,
}

/// Configuration the app is assembled with: in-memory everything and a
/// tight rate limit.
pub fn test_figment() -> rocket::figment::Figment {
    rocket::Config::figment()
        .merge(("files_key", base64::encode([5u8; 32])))
        .merge(("external_uri", EXTERNAL_URI))
        .merge(("mail.from", "DocSeal <noreply@sign.test>"))
        .merge(("rate_limit.requests", 5))
        .merge(("rate_limit.window_secs", 60))
        .merge(("log_level", "off"))
}

pub async fn build_test_app() -> TestApp {
    let figment = test_figment();
    let config: docseal::Config = figment.extract().expect("valid test config");

    let store = Arc::new(MemoryStore::new());
    store.insert_profile(Profile {
        id: SENDER,
        email: "alice@example.com".to_string(),
        full_name: Some("Alice Sender".to_string()),
    }).await;
    let files = Arc::new(MemoryFileStore::new(config.link_signer()));
    let transport = Arc::new(RecordingTransport::default());

    let rocket = docseal::assemble(
        rocket::custom(figment), config, store.clone(), files.clone(), transport.clone(),
    ).expect("app assembles");
    let client = Client::tracked(rocket).await.expect("valid rocket instance");

    TestApp { client, store, files, transport }
}

pub fn as_sender(id: uuid::Uuid) -> Header<'static> {
    Header::new("X-Sender-Id", id.to_string())
}

pub fn blank_pdf(pages: usize) -> Vec<u8> {
    use lopdf::{dictionary, Object, Stream};

    let mut doc = lopdf::Document::with_version("1.7");
    let pages_id = doc.new_object_id();
    let kids = (0..pages).map(|_| {
        let content_id = doc.add_object(Stream::new(dictionary! {}, b"0 0 m".to_vec()));
        Object::Reference(doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {},
        }))
    }).collect::<Vec<_>>();
    doc.objects.insert(pages_id, Object::Dictionary(dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => pages as i64,
    }));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

pub fn signature_data_url() -> String {
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, 60, 20);
        encoder.set_color(png::ColorType::GrayscaleAlpha);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header().unwrap();
        let data = (0..60 * 20).flat_map(|i| [0u8, (i % 200) as u8]).collect::<Vec<u8>>();
        writer.write_image_data(&data).unwrap();
    }
    format!("data:image/png;base64,{}", base64::encode(out))
}

pub async fn body_json(response: LocalResponse<'_>) -> serde_json::Value {
    response.into_json::<serde_json::Value>().await.expect("JSON body")
}

/// Uploads a PDF with `pages` pages and returns the created document.
pub async fn upload(app: &TestApp, title: &str, pages: usize) -> serde_json::Value {
    let response = app.client
        .post(format!("/api/documents?title={}", title))
        .header(as_sender(SENDER))
        .header(ContentType::PDF)
        .body(blank_pdf(pages))
        .dispatch().await;
    assert_eq!(response.status().code, 201);
    body_json(response).await
}

/// Saves `fields` on a document and returns the stored layout.
pub async fn save_fields(app: &TestApp, document_id: &str, fields: serde_json::Value) -> serde_json::Value {
    let response = app.client
        .put(format!("/api/documents/{}/fields", document_id))
        .header(as_sender(SENDER))
        .json(&fields)
        .dispatch().await;
    assert_eq!(response.status().code, 200);
    body_json(response).await
}

/// Sends the document to `recipients`, returning each signing token.
pub async fn send(app: &TestApp, document_id: &str, recipients: &[&str]) -> Vec<(String, String)> {
    let response = app.client
        .post(format!("/api/documents/{}/requests", document_id))
        .header(as_sender(SENDER))
        .json(&serde_json::json!({ "recipients": recipients, "message": "Please sign" }))
        .dispatch().await;
    assert_eq!(response.status().code, 200);
    body_json(response).await
        .as_array().expect("issued requests")
        .iter()
        .map(|r| {
            let url = r["signing_url"].as_str().expect("signing url");
            let token = url.rsplit("/sign/").next().expect("token").to_string();
            (r["id"].as_str().expect("request id").to_string(), token)
        })
        .collect()
}

/// Path and query of a link handed out by the app.
pub fn local_path(url: &str) -> String {
    url.strip_prefix(EXTERNAL_URI).expect("link on the external uri").to_string()
}
