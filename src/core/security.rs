//! Bearer token kept in a file next to the database.
//!
//! The file is re-read on every check, so replacing it rotates the token
//! without restarting the server.

use anyhow::Context;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a fresh random token (16 bytes, hex) and returns it.
    pub async fn create(&self) -> anyhow::Result<String> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create_dir_all {}", parent.display()))?;
            }
        }
        let token = random_token();
        tokio::fs::write(&self.path, &token)
            .await
            .with_context(|| format!("write token {}", self.path.display()))?;
        info!(path = %self.path.display(), "generated new access token");
        Ok(token)
    }

    /// Current token; a missing or empty file is replaced with a new one.
    pub async fn load_or_create(&self) -> anyhow::Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            Ok(_) => {
                warn!(path = %self.path.display(), "token file empty, regenerating");
                self.create().await
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.create().await,
            Err(e) => Err(e).with_context(|| format!("read token {}", self.path.display())),
        }
    }

    pub async fn verify(&self, presented: &str) -> bool {
        let expected = match self.load_or_create().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "token unavailable, rejecting request");
                return false;
            }
        };
        let ok = constant_time_eq(presented.trim().as_bytes(), expected.as_bytes());
        if !ok {
            warn!("bearer token rejected");
        }
        ok
    }

    /// SHA-256 of the token, hex. Safe to show in diagnostics.
    pub async fn digest(&self) -> anyhow::Result<String> {
        let token = self.load_or_create().await?;
        Ok(hex::encode(Sha256::digest(token.as_bytes())))
    }
}

/// 16 random bytes, hex. Two v4 uuids carry 244 random bits; hashing them
/// leaves no fixed version nibbles in the output.
fn random_token() -> String {
    let mut h = Sha256::new();
    h.update(uuid::Uuid::new_v4().as_bytes());
    h.update(uuid::Uuid::new_v4().as_bytes());
    hex::encode(&h.finalize()[..16])
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    // compare digests so the loop length never depends on the secret
    let da = Sha256::digest(a);
    let db = Sha256::digest(b);
    da.iter().zip(db.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
