//! TLS key-pair providers for the webhook server.

use std::path::PathBuf;

use async_trait::async_trait;

use super::WebhookError;

const PEM_MARKER: &[u8] = b"-----BEGIN ";

/// PEM-encoded certificate chain and private key.
#[derive(Clone)]
pub struct KeyPair {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Reject material that is obviously not PEM.
    pub fn new(cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Result<Self, WebhookError> {
        if !contains(&cert_pem, PEM_MARKER) {
            return Err(WebhookError::TlsConfig(
                "certificate is not PEM encoded".to_string(),
            ));
        }
        if !contains(&key_pem, PEM_MARKER) {
            return Err(WebhookError::TlsConfig(
                "private key is not PEM encoded".to_string(),
            ));
        }
        Ok(Self { cert_pem, key_pem })
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Source of the serving key pair.
#[async_trait]
pub trait KeyPairProvider: Send + Sync {
    async fn key_pair(&self) -> Result<KeyPair, WebhookError>;
}

/// Key pair read from PEM files, e.g. a mounted Secret.
#[derive(Debug, Clone)]
pub struct FileKeyPair {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl FileKeyPair {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

#[async_trait]
impl KeyPairProvider for FileKeyPair {
    async fn key_pair(&self) -> Result<KeyPair, WebhookError> {
        let read = |path: PathBuf| async move {
            tokio::fs::read(&path).await.map_err(|e| {
                WebhookError::TlsConfig(format!("failed to read {}: {}", path.display(), e))
            })
        };
        let cert_pem = read(self.cert_path.clone()).await?;
        let key_pem = read(self.key_path.clone()).await?;
        KeyPair::new(cert_pem, key_pem)
    }
}
