use std::sync::Arc;

lazy_static::lazy_static! {
    static ref TEMPLATES: tera::Tera = {
        let mut tera = tera::Tera::default();
        if let Err(e) = tera.add_raw_templates(vec![
            ("signing_request.html", include_str!("../templates_email/signing_request.html.tera")),
            ("signing_request.txt", include_str!("../templates_email/signing_request.txt.tera")),
            ("signed_copy.html", include_str!("../templates_email/signed_copy.html.tera")),
            ("signed_copy.txt", include_str!("../templates_email/signed_copy.txt.tera")),
        ]) {
            error!("Parsing error(s): {}", e);
            ::std::process::exit(1);
        }
        tera.autoescape_on(vec![".html"]);
        tera
    };
    static ref FILENAME_RE: regex::Regex = regex::Regex::new(r"(?i)[^a-z0-9\-_]+").unwrap();
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("unable to render template: {0}")]
    Template(#[from] tera::Error),
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("unable to generate email: {0}")]
    Build(String),
    #[error("unable to send email: {0}")]
    Transport(String),
}

#[rocket::async_trait]
pub trait EmailTransport {
    async fn send(&self, msg: lettre::Message) -> Result<(), MailError>;
}

#[rocket::async_trait]
impl EmailTransport for lettre::transport::stub::AsyncStubTransport {
    async fn send(&self, msg: lettre::Message) -> Result<(), MailError> {
        lettre::AsyncTransport::send(self, msg).await
            .map_err(|err| MailError::Transport(err.to_string()))
    }
}

#[rocket::async_trait]
impl EmailTransport for lettre::transport::file::AsyncFileTransport<lettre::Tokio1Executor> {
    async fn send(&self, msg: lettre::Message) -> Result<(), MailError> {
        match lettre::AsyncTransport::send(self, msg).await {
            Ok(_) => Ok(()),
            Err(err) => Err(MailError::Transport(format!("Unable to save email to file: {}", err)))
        }
    }
}

#[rocket::async_trait]
impl EmailTransport for lettre::transport::smtp::AsyncSmtpTransport<lettre::Tokio1Executor> {
    async fn send(&self, msg: lettre::Message) -> Result<(), MailError> {
        match lettre::AsyncTransport::send(self, msg).await {
            Ok(_) => Ok(()),
            Err(err) => Err(MailError::Transport(format!("Unable to send email with SMTP: {}", err)))
        }
    }
}

/// A message captured by [`RecordingTransport`].
#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: Vec<String>,
    pub raw: String,
}

/// Keeps every message in memory instead of delivering it.
#[derive(Default)]
pub struct RecordingTransport {
    sent: std::sync::Mutex<Vec<SentMail>>,
    failing: std::sync::atomic::AtomicBool,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[rocket::async_trait]
impl EmailTransport for RecordingTransport {
    async fn send(&self, msg: lettre::Message) -> Result<(), MailError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(MailError::Transport("transport unavailable".to_string()));
        }
        let mail = SentMail {
            to: msg.envelope().to().iter().map(|a| a.to_string()).collect(),
            raw: String::from_utf8_lossy(&msg.formatted()).into_owned(),
        };
        self.sent.lock().map_err(|_| MailError::Transport("poisoned".to_string()))?.push(mail);
        Ok(())
    }
}

pub type EmailTransportType = Arc<dyn EmailTransport + Send + Sync>;

#[derive(Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    Stub,
    File { path: String },
    Smtp(SMTPConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Stub
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct SMTPConfig {
    pub server: String,
    pub port: u16,
    pub use_tls: bool,
    pub auth: Option<SMTPAuth>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SMTPAuth {
    pub username: String,
    pub password: String,
}

impl TransportConfig {
    pub fn build(&self) -> Result<EmailTransportType, MailError> {
        Ok(match self {
            TransportConfig::Stub => Arc::new(lettre::transport::stub::AsyncStubTransport::new_ok()),
            TransportConfig::File { path } => Arc::new(
                lettre::transport::file::AsyncFileTransport::<lettre::Tokio1Executor>::new(path)
            ),
            TransportConfig::Smtp(smtp_conf) => {
                let mut smtp_transport_builder =
                    lettre::transport::smtp::AsyncSmtpTransport::<lettre::Tokio1Executor>::builder_dangerous(&smtp_conf.server)
                        .port(smtp_conf.port);
                if smtp_conf.use_tls {
                    smtp_transport_builder = smtp_transport_builder.tls(
                        lettre::transport::smtp::client::Tls::Required(
                            lettre::transport::smtp::client::TlsParameters::new(smtp_conf.server.clone())
                                .map_err(|e| MailError::Transport(format!("Unable to setup SMTP TLS parameters: {}", e)))?
                        )
                    );
                }
                if let Some(auth) = &smtp_conf.auth {
                    smtp_transport_builder = smtp_transport_builder.credentials(
                        lettre::transport::smtp::authentication::Credentials::new(
                            auth.username.clone(), auth.password.clone(),
                        )
                    )
                }
                Arc::new(smtp_transport_builder.build())
            }
        })
    }
}

#[derive(Serialize)]
struct SigningRequestContext<'a> {
    sender_name: &'a str,
    document_title: &'a str,
    message: Option<&'a str>,
    signing_url: &'a str,
}

#[derive(Serialize)]
struct SignedCopyContext<'a> {
    document_title: &'a str,
    signer_email: &'a str,
    sender_name: &'a str,
    download_url: Option<&'a str>,
}

/// File name for an emailed copy of a document.
pub fn attachment_name(title: &str) -> String {
    let base = title.trim();
    let base = if base.is_empty() { "signed-document" } else { base };
    format!("{}.pdf", FILENAME_RE.replace_all(base, "_"))
}

pub struct Mailer {
    transport: EmailTransportType,
    from: lettre::message::Mailbox,
    reply_to: Option<lettre::message::Mailbox>,
}

impl Mailer {
    pub fn new(transport: EmailTransportType, from: &str, reply_to: Option<&str>) -> Result<Self, MailError> {
        Ok(Self {
            transport,
            from: from.parse()?,
            reply_to: reply_to.map(|r| r.parse()).transpose()?,
        })
    }

    fn builder(&self, to: &str, subject: String) -> Result<lettre::message::MessageBuilder, MailError> {
        let mut builder = lettre::message::Message::builder()
            .from(self.from.clone())
            .to(lettre::message::Mailbox {
                name: None,
                email: to.parse()?,
            })
            .subject(subject);
        if let Some(reply_to) = &self.reply_to {
            builder = builder.reply_to(reply_to.clone());
        }
        Ok(builder)
    }

    fn render<C: serde::Serialize>(name: &str, context: &C) -> Result<(String, String), MailError> {
        let context = tera::Context::from_serialize(context)?;
        let email_html = TEMPLATES.render(&format!("{}.html", name), &context)?;
        let email_txt = TEMPLATES.render(&format!("{}.txt", name), &context)?;
        Ok((email_html, email_txt))
    }

    pub async fn send_signing_request(
        &self, to: &str, sender_name: &str, document_title: &str, message: Option<&str>, signing_url: &str,
    ) -> Result<(), MailError> {
        let (email_html, email_txt) = Self::render("signing_request", &SigningRequestContext {
            sender_name,
            document_title,
            message: message.filter(|m| !m.trim().is_empty()),
            signing_url,
        })?;

        let m = self.builder(to, format!("Please sign: {}", document_title))?
            .multipart(lettre::message::MultiPart::alternative_plain_html(email_txt, email_html))
            .map_err(|e| MailError::Build(e.to_string()))?;

        self.transport.send(m).await
    }

    pub async fn send_signed_copy(
        &self, to: &str, document_title: &str, signer_email: &str, sender_name: &str,
        download_url: Option<&str>, pdf: Vec<u8>,
    ) -> Result<(), MailError> {
        let (email_html, email_txt) = Self::render("signed_copy", &SignedCopyContext {
            document_title,
            signer_email,
            sender_name,
            download_url,
        })?;

        let content_type = lettre::message::header::ContentType::parse("application/pdf")
            .map_err(|e| MailError::Build(e.to_string()))?;
        let m = self.builder(to, format!("Signed: {}", document_title))?
            .multipart(lettre::message::MultiPart::mixed()
                .multipart(lettre::message::MultiPart::alternative_plain_html(email_txt, email_html))
                .singlepart(lettre::message::Attachment::new(attachment_name(document_title)).body(pdf, content_type))
            )
            .map_err(|e| MailError::Build(e.to_string()))?;

        self.transport.send(m).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailer() -> (Arc<RecordingTransport>, Mailer) {
        let transport = Arc::new(RecordingTransport::default());
        let mailer = Mailer::new(transport.clone(), "DocSeal <noreply@docseal.test>", None).unwrap();
        (transport, mailer)
    }

    #[test]
    fn attachment_names_are_sanitised() {
        assert_eq!(attachment_name("Lease 2024/05 (final)"), "Lease_2024_05_final_.pdf");
        assert_eq!(attachment_name("  "), "signed-document.pdf");
        assert_eq!(attachment_name("nda-v2_b"), "nda-v2_b.pdf");
    }

    #[tokio::test]
    async fn signing_request_contains_link() {
        let (transport, mailer) = mailer();
        mailer.send_signing_request(
            "bob@example.com", "Alice", "Lease", Some("Please sign by Friday"), "https://sign.test/sign/abc",
        ).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["bob@example.com".to_string()]);
        assert!(sent[0].raw.contains("Subject: Please sign: Lease"));
        assert!(sent[0].raw.contains("Sign the document here: https://sign.test/sign/abc"));
        assert!(sent[0].raw.contains("Please sign by Friday"));
    }

    #[tokio::test]
    async fn signed_copy_attaches_pdf() {
        let (transport, mailer) = mailer();
        mailer.send_signed_copy(
            "alice@example.com", "Lease", "bob@example.com", "Alice", None, b"%PDF-1.7".to_vec(),
        ).await.unwrap();

        let sent = transport.sent();
        assert!(sent[0].raw.contains("Subject: Signed: Lease"));
        assert!(sent[0].raw.contains("Lease.pdf"));
        assert!(sent[0].raw.contains("application/pdf"));
        assert!(!sent[0].raw.contains("Download the signed PDF"));
    }

    #[tokio::test]
    async fn invalid_recipient_is_an_error() {
        let (transport, mailer) = mailer();
        let res = mailer.send_signing_request("not an address", "A", "T", None, "https://x").await;
        assert!(matches!(res, Err(MailError::Address(_))));
        assert!(transport.sent().is_empty());
    }
}
