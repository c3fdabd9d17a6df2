#![crate_type = "rlib"]

#[macro_use]
extern crate log;
#[macro_use]
extern crate diesel;
#[macro_use]
extern crate serde;
#[macro_use]
extern crate lopdf;

use std::sync::Arc;

pub mod documents;
pub mod error;
pub mod fields;
pub mod files;
pub mod geometry;
pub mod layout;
pub mod mail;
pub mod models;
pub mod pdf;
pub mod ratelimit;
pub mod schema;
pub mod signatures;
pub mod signing;
pub mod store;
pub mod views;

#[derive(Deserialize)]
pub struct Config {
    #[serde(deserialize_with = "from_base64")]
    pub files_key: Vec<u8>,
    #[serde(default = "default_files_dir")]
    pub files_dir: String,
    pub external_uri: rocket::http::uri::Reference<'static>,
    pub mail: MailConfig,
    #[serde(default = "default_sender_header")]
    pub sender_header: String,
    #[serde(default)]
    pub rate_limit: ratelimit::RateLimitConfig,
    #[serde(default)]
    pub links: LinkConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

#[derive(Deserialize, Clone)]
pub struct MailConfig {
    pub from: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub transport: mail::TransportConfig,
}

/// Link lifetimes in seconds.
#[derive(Deserialize, Clone, Copy)]
pub struct LinkConfig {
    pub document_secs: i64,
    pub saved_signature_secs: i64,
    pub signed_download_secs: i64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            document_secs: 3600,
            saved_signature_secs: 3600,
            signed_download_secs: 7 * 24 * 3600,
        }
    }
}

impl From<LinkConfig> for signing::LinkTtls {
    fn from(c: LinkConfig) -> Self {
        Self {
            document: chrono::Duration::seconds(c.document_secs),
            saved_signature: chrono::Duration::seconds(c.saved_signature_secs),
            signed_download: chrono::Duration::seconds(c.signed_download_secs),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_files_dir() -> String {
    "./files/".to_string()
}

fn default_sender_header() -> String {
    "X-Sender-Id".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn from_base64<'a, D: serde::Deserializer<'a>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    use serde::de::Error;
    use serde::Deserialize;
    String::deserialize(deserializer)
        .and_then(|string| base64::decode(&string).map_err(|err| Error::custom(err.to_string())))
}

impl Config {
    pub fn link_signer(&self) -> files::LinkSigner {
        files::LinkSigner::new(self.files_key.clone(), &self.external_uri.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("unable to read config: {0}")]
    Config(#[from] figment::Error),
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Mail(#[from] mail::MailError),
}

pub struct App {
    pub rocket: rocket::Rocket<rocket::Build>,
}

/// Wires the services into `rocket`: managed state, routes, catchers and the
/// rate limit sweeper.
pub fn assemble(
    rocket: rocket::Rocket<rocket::Build>, config: Config, store: Arc<dyn store::Store>,
    files: Arc<dyn files::FileStore>, transport: mail::EmailTransportType,
) -> Result<rocket::Rocket<rocket::Build>, SetupError> {
    let mailer = mail::Mailer::new(transport, &config.mail.from, config.mail.reply_to.as_deref())?;
    let service = signing::SigningService::new(
        store, files.clone(), Arc::new(mailer), &config.external_uri.to_string(), config.links.into(),
    );
    let limiter = Arc::new(ratelimit::RateLimiter::new(config.rate_limit));

    Ok(rocket
        .manage(service)
        .manage(files)
        .manage(limiter)
        .manage(config)
        .attach(ratelimit::sweeper())
        .mount("/", views::routes())
        .register("/", rocket::catchers![views::default_catcher]))
}

pub async fn setup() -> Result<App, SetupError> {
    let rocket = rocket::build();
    let config = rocket.figment().extract::<Config>()?;

    let store: Arc<dyn store::Store> = match &config.database {
        Some(db) => {
            let pg = store::PgStore::connect(&db.url, db.pool_size)?;
            let migrator = pg.clone();
            tokio::task::spawn_blocking(move || migrator.run_migrations()).await
                .map_err(|e| store::StoreError::Task(e.to_string()))??;
            Arc::new(pg)
        }
        None => {
            warn!("No database configured, keeping everything in memory");
            Arc::new(store::MemoryStore::new())
        }
    };

    info!("Storing files in {}", config.files_dir);
    let files = Arc::new(files::LocalFileStore::new(&config.files_dir, config.link_signer()));
    let transport = config.mail.transport.build()?;

    Ok(App {
        rocket: assemble(rocket, config, store, files, transport)?,
    })
}
