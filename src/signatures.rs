//! Saved signature and initials images, keyed by recipient email.

use sha2::Digest;
use crate::files::{FileError, FileStore};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Signature,
    Initials,
}

impl Kind {
    fn file_name(self) -> &'static str {
        match self {
            Kind::Signature => "signature.png",
            Kind::Initials => "initials.png",
        }
    }
}

/// A saved image as handed to the signing page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedImage {
    pub url: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SavedImages {
    pub signature: Option<SavedImage>,
    pub initials: Option<SavedImage>,
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("not a saved image of this recipient")]
    Foreign,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Files(#[from] FileError),
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn email_hash(email: &str) -> String {
    hex::encode(sha2::Sha256::digest(normalize_email(email).as_bytes()))
}

pub fn saved_path(email: &str, kind: Kind) -> String {
    format!("saved/{}/{}", email_hash(email), kind.file_name())
}

/// Where one submission attempt stores the image drawn for a field.
pub fn request_image_path(request_id: uuid::Uuid, attempt: uuid::Uuid, field_id: uuid::Uuid) -> String {
    format!("requests/{}/{}/{}.png", request_id, attempt, field_id)
}

pub struct SignatureStore<'a> {
    pub store: &'a dyn Store,
    pub files: &'a dyn FileStore,
}

impl SignatureStore<'_> {
    /// Links to the recipient's saved images. Rows pointing at objects that
    /// no longer exist are treated as absent.
    pub async fn lookup(&self, email: &str, ttl: chrono::Duration) -> Result<SavedImages, SignatureError> {
        let row = match self.store.saved_signature(&normalize_email(email)).await? {
            Some(r) => r,
            None => return Ok(SavedImages::default()),
        };

        Ok(SavedImages {
            signature: self.link(row.signature_path, ttl).await?,
            initials: self.link(row.initials_path, ttl).await?,
        })
    }

    async fn link(&self, path: Option<String>, ttl: chrono::Duration) -> Result<Option<SavedImage>, SignatureError> {
        let path = match path {
            Some(p) => p,
            None => return Ok(None),
        };
        match self.files.signed_url(&path, ttl).await {
            Ok(url) => Ok(Some(SavedImage { url, path })),
            Err(FileError::NotFound(_)) => {
                warn!("Saved image {} is missing from storage", path);
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Overwrites whichever images are given.
    pub async fn save(&self, email: &str, signature: Option<Vec<u8>>, initials: Option<Vec<u8>>) -> Result<(), SignatureError> {
        let mut signature_path = None;
        let mut initials_path = None;
        if let Some(bytes) = signature {
            let path = saved_path(email, Kind::Signature);
            self.files.put(&path, bytes).await?;
            signature_path = Some(path);
        }
        if let Some(bytes) = initials {
            let path = saved_path(email, Kind::Initials);
            self.files.put(&path, bytes).await?;
            initials_path = Some(path);
        }
        self.store.upsert_saved_signature(&normalize_email(email), signature_path, initials_path).await?;
        Ok(())
    }

    /// Reads a saved image the recipient refers to by path.
    pub async fn load_own(&self, email: &str, path: &str) -> Result<Vec<u8>, SignatureError> {
        if path != saved_path(email, Kind::Signature) && path != saved_path(email, Kind::Initials) {
            return Err(SignatureError::Foreign);
        }
        Ok(self.files.get(path).await?)
    }
}
