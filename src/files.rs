use rocket::get;
use hmac::{Mac, NewMac};

type HmacSha512 = hmac::Hmac<sha2::Sha512>;

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object path: {0}")]
    InvalidPath(String),
    #[error("storage is read only")]
    ReadOnly,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Checks that an object path is relative and made of plain segments.
pub fn check_path(path: &str) -> Result<(), FileError> {
    let ok = !path.is_empty()
        && !path.starts_with('/')
        && path.split('/').all(|seg| {
            !seg.is_empty() && seg != "." && seg != ".."
                && seg.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        });
    if ok {
        Ok(())
    } else {
        Err(FileError::InvalidPath(path.to_string()))
    }
}

pub struct FileKey<'a> {
    file_path: &'a str,
    key: &'a [u8],
    expiry: chrono::DateTime<chrono::Utc>,
}

impl<'a> FileKey<'a> {
    pub fn new(file_path: &'a str, key: &'a [u8], ttl: chrono::Duration) -> FileKey<'a> {
        FileKey {
            file_path,
            key,
            expiry: chrono::Utc::now() + ttl,
        }
    }

    fn mac(file_path: &str, key: &[u8], expiry: &str) -> HmacSha512 {
        let file_path = base64::encode_config(file_path.as_bytes(), base64::URL_SAFE_NO_PAD);
        let mut mac = HmacSha512::new_from_slice(key).expect("HMAC accepts keys of any length");
        let msg = format!("{};{}", file_path, expiry);
        mac.update(msg.as_bytes());
        mac
    }
}

impl std::fmt::Display for FileKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let expiry = self.expiry.timestamp().to_string();
        let mac = Self::mac(self.file_path, self.key, &expiry);
        let code_bytes = base64::encode_config(mac.finalize().into_bytes(), base64::URL_SAFE_NO_PAD);
        write!(f, "{};{}", expiry, code_bytes)
    }
}

/// Why a link key was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    Malformed,
    Forged,
    Expired,
}

impl From<KeyError> for rocket::http::Status {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::Malformed => rocket::http::Status::UnprocessableEntity,
            KeyError::Forged => rocket::http::Status::Forbidden,
            KeyError::Expired => rocket::http::Status::NotFound,
        }
    }
}

/// Issues and checks expiring links to stored objects.
#[derive(Clone)]
pub struct LinkSigner {
    key: Vec<u8>,
    base_uri: String,
}

impl LinkSigner {
    pub fn new(key: Vec<u8>, external_uri: &str) -> Self {
        Self {
            key,
            base_uri: external_uri.trim_end_matches('/').to_string(),
        }
    }

    pub fn link(&self, path: &str, ttl: chrono::Duration) -> String {
        format!("{}/files/{}?key={}", self.base_uri, path, FileKey::new(path, &self.key, ttl))
    }

    pub fn verify(&self, path: &str, key: &str) -> Result<(), KeyError> {
        let mut key_parts = key.split(';');
        let (part_1, part_2) = match (key_parts.next(), key_parts.next(), key_parts.next()) {
            (Some(a), Some(b), None) => (a, b),
            _ => return Err(KeyError::Malformed),
        };

        let expiry = part_1.parse::<i64>().ok()
            .and_then(|c| chrono::DateTime::<chrono::Utc>::from_timestamp(c, 0))
            .ok_or(KeyError::Malformed)?;
        let code_bytes = base64::decode_config(part_2, base64::URL_SAFE_NO_PAD)
            .map_err(|_| KeyError::Malformed)?;

        let mac = FileKey::mac(path, &self.key, part_1);
        if mac.verify(&code_bytes).is_err() {
            return Err(KeyError::Forged);
        }

        if expiry < chrono::Utc::now() {
            return Err(KeyError::Expired);
        }

        Ok(())
    }
}

/// Object storage for documents, signature images and signed output.
#[rocket::async_trait]
pub trait FileStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Vec<u8>, FileError>;

    /// Writes `bytes` at `path`, replacing any existing object.
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), FileError>;

    async fn exists(&self, path: &str) -> Result<bool, FileError>;

    async fn delete(&self, path: &str) -> Result<(), FileError>;

    fn links(&self) -> &LinkSigner;

    /// A time limited link to an existing object.
    async fn signed_url(&self, path: &str, ttl: chrono::Duration) -> Result<String, FileError> {
        check_path(path)?;
        if !self.exists(path).await? {
            return Err(FileError::NotFound(path.to_string()));
        }
        Ok(self.links().link(path, ttl))
    }
}

pub struct LocalFileStore {
    root: std::path::PathBuf,
    links: LinkSigner,
}

impl LocalFileStore {
    pub fn new<P: Into<std::path::PathBuf>>(root: P, links: LinkSigner) -> Self {
        Self {
            root: root.into(),
            links,
        }
    }

    fn full_path(&self, path: &str) -> Result<std::path::PathBuf, FileError> {
        check_path(path)?;
        Ok(self.root.join(path))
    }
}

#[rocket::async_trait]
impl FileStore for LocalFileStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>, FileError> {
        match tokio::fs::read(self.full_path(path)?).await {
            Ok(b) => Ok(b),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(FileError::NotFound(path.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), FileError> {
        let full_path = self.full_path(path)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = full_path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &full_path).await?;
        trace!("Wrote {} bytes to {}", bytes.len(), path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, FileError> {
        Ok(tokio::fs::try_exists(self.full_path(path)?).await?)
    }

    async fn delete(&self, path: &str) -> Result<(), FileError> {
        match tokio::fs::remove_file(self.full_path(path)?).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn links(&self) -> &LinkSigner {
        &self.links
    }
}

/// In-process object storage for tests and local runs.
pub struct MemoryFileStore {
    objects: tokio::sync::RwLock<std::collections::HashMap<String, Vec<u8>>>,
    read_only: std::sync::atomic::AtomicBool,
    links: LinkSigner,
}

impl MemoryFileStore {
    pub fn new(links: LinkSigner) -> Self {
        Self {
            objects: Default::default(),
            read_only: std::sync::atomic::AtomicBool::new(false),
            links,
        }
    }

    /// Makes every following write fail, to exercise storage outages.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn paths(&self) -> Vec<String> {
        let mut paths = self.objects.read().await.keys().cloned().collect::<Vec<_>>();
        paths.sort();
        paths
    }
}

#[rocket::async_trait]
impl FileStore for MemoryFileStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>, FileError> {
        check_path(path)?;
        self.objects.read().await.get(path).cloned().ok_or_else(|| FileError::NotFound(path.to_string()))
    }

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), FileError> {
        check_path(path)?;
        if self.read_only.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(FileError::ReadOnly);
        }
        self.objects.write().await.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, FileError> {
        check_path(path)?;
        Ok(self.objects.read().await.contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<(), FileError> {
        check_path(path)?;
        if self.read_only.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(FileError::ReadOnly);
        }
        self.objects.write().await.remove(path);
        Ok(())
    }

    fn links(&self) -> &LinkSigner {
        &self.links
    }
}

#[get("/files/<file..>?<key>")]
pub async fn authenticated_files(
    file: std::path::PathBuf, key: &str, files: &rocket::State<std::sync::Arc<dyn FileStore>>,
) -> Result<(rocket::http::ContentType, Vec<u8>), rocket::http::Status> {
    let path = file.to_string_lossy().replace('\\', "/");
    if check_path(&path).is_err() {
        return Err(rocket::http::Status::NotFound);
    }

    files.links().verify(&path, key)?;

    let content_type = match file.extension().and_then(|e| e.to_str()) {
        Some("pdf") => rocket::http::ContentType::PDF,
        Some("png") => rocket::http::ContentType::PNG,
        _ => rocket::http::ContentType::Binary,
    };

    match files.get(&path).await {
        Ok(b) => Ok((content_type, b)),
        Err(FileError::NotFound(_)) => Err(rocket::http::Status::NotFound),
        Err(err) => {
            warn!("Unable to read {}: {}", path, err);
            Err(rocket::http::Status::InternalServerError)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> LinkSigner {
        LinkSigner::new(b"test-key".to_vec(), "https://sign.example.com/")
    }

    fn key_of(link: &str) -> &str {
        link.split("?key=").nth(1).unwrap()
    }

    #[test]
    fn link_round_trip() {
        let links = signer();
        let link = links.link("signed/a/b.pdf", chrono::Duration::minutes(5));
        assert!(link.starts_with("https://sign.example.com/files/signed/a/b.pdf?key="));
        assert_eq!(links.verify("signed/a/b.pdf", key_of(&link)), Ok(()));
    }

    #[test]
    fn link_is_bound_to_path_and_key() {
        let links = signer();
        let link = links.link("signed/a/b.pdf", chrono::Duration::minutes(5));
        assert_eq!(links.verify("signed/a/c.pdf", key_of(&link)), Err(KeyError::Forged));

        let other = LinkSigner::new(b"other-key".to_vec(), "https://sign.example.com");
        assert_eq!(other.verify("signed/a/b.pdf", key_of(&link)), Err(KeyError::Forged));
        assert_eq!(links.verify("signed/a/b.pdf", "garbage"), Err(KeyError::Malformed));
    }

    #[test]
    fn expired_link_is_missing() {
        let links = signer();
        let link = links.link("saved/x/signature.png", chrono::Duration::minutes(-1));
        assert_eq!(links.verify("saved/x/signature.png", key_of(&link)), Err(KeyError::Expired));
        assert_eq!(rocket::http::Status::from(KeyError::Expired), rocket::http::Status::NotFound);
    }

    #[test]
    fn rejects_escaping_paths() {
        assert!(check_path("documents/a/b.pdf").is_ok());
        assert!(check_path("../etc/passwd").is_err());
        assert!(check_path("/abs").is_err());
        assert!(check_path("a//b").is_err());
        assert!(check_path("").is_err());
    }

    #[tokio::test]
    async fn local_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path(), signer());
        store.put("requests/r/f.png", b"png".to_vec()).await.unwrap();
        assert_eq!(store.get("requests/r/f.png").await.unwrap(), b"png".to_vec());
        store.put("requests/r/f.png", b"png2".to_vec()).await.unwrap();
        assert_eq!(store.get("requests/r/f.png").await.unwrap(), b"png2".to_vec());

        assert!(store.signed_url("requests/r/f.png", chrono::Duration::minutes(5)).await.is_ok());
        assert!(matches!(
            store.signed_url("requests/r/missing.png", chrono::Duration::minutes(5)).await,
            Err(FileError::NotFound(_))
        ));

        store.delete("requests/r/f.png").await.unwrap();
        assert!(matches!(store.get("requests/r/f.png").await, Err(FileError::NotFound(_))));
    }

    #[tokio::test]
    async fn memory_store_can_fail_writes() {
        let store = MemoryFileStore::new(signer());
        store.put("a.pdf", vec![1]).await.unwrap();
        store.set_read_only(true);
        assert!(matches!(store.put("b.pdf", vec![2]).await, Err(FileError::ReadOnly)));
        assert_eq!(store.paths().await, vec!["a.pdf".to_string()]);
    }
}
