// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Shared-secret bearer auth for the JSON-RPC and WebSocket surfaces.
//!
//! Auth is opt-in: with no `auth.tokenFile` configured the hub is open,
//! which is the right default for a loopback bind.  When a token file is
//! configured, `POST /`, `POST /shutdown` and the WebSocket upgrade must
//! carry `Authorization: Bearer <token>`; the discovery card and `/health`
//! stay open so clients can still find the hub.
//!
//! Only the SHA-256 digest of the token ever touches disk.  [`provision`]
//! returns the plaintext exactly once; [`BearerAuth::check`] compares in
//! constant time, so a request can't probe the digest byte by byte.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Request-time guard: checks `Authorization` header values against the
/// digest loaded from the hub's token file.
pub struct BearerAuth {
    digest: [u8; 32],
}

impl BearerAuth {
    /// Load the guard from a token file written by [`provision`].
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading token file {}", path.display()))?;
        let file: HashFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing token file {}", path.display()))?;
        let bytes = hex::decode(&file.token_hash).context("token_hash is not hex")?;
        let digest = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("token_hash must be a 32-byte SHA-256 digest"))?;
        Ok(Self { digest })
    }

    /// Guard for a known plaintext token.
    pub fn from_token(token: &str) -> Self {
        Self {
            digest: digest(token),
        }
    }

    /// Check one request's `Authorization` header value.
    ///
    /// Accepts exactly the `Bearer <token>` scheme.  A missing header, a
    /// different scheme and a wrong token all fail the same way — the
    /// caller answers 401 without distinguishing why.
    pub fn check(&self, authorization: Option<&str>) -> bool {
        let Some(token) = authorization.and_then(|value| value.strip_prefix("Bearer ")) else {
            return false;
        };
        digest(token.trim()).ct_eq(&self.digest).into()
    }
}

/// On-disk shape of the token file — a single hex digest, never plaintext:
///
/// ```yaml
/// token_hash: "a3f2…b7"
/// ```
#[derive(Debug, Serialize, Deserialize)]
struct HashFile {
    token_hash: String,
}

/// Mint a fresh bearer token: store its digest at `path` and return the
/// plaintext.  The caller (`agora token generate`) shows it once and drops
/// it; it cannot be recovered from the file afterwards.
pub fn provision(path: &Path) -> anyhow::Result<String> {
    use rand::RngCore;

    // 256 bits from the OS CSPRNG, base64url: 43 chars, shell-safe.
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    let token = base64url(&secret);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating token directory {}", parent.display()))?;
    }
    let file = HashFile {
        token_hash: hex::encode(digest(&token)),
    };
    let yaml = serde_yaml::to_string(&file).context("serializing token file")?;
    write_owner_only(path, yaml.as_bytes())?;

    Ok(token)
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

fn base64url(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// The token file is a secret; keep it owner-only where the OS can.
fn write_owner_only(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("writing {}", path.display()))?;
        f.write_all(data)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_requires_the_bearer_scheme() {
        let auth = BearerAuth::from_token("secret-token");
        assert!(auth.check(Some("Bearer secret-token")));
        assert!(!auth.check(Some("secret-token")), "bare token is refused");
        assert!(!auth.check(Some("Basic secret-token")));
        assert!(!auth.check(None));
    }

    #[test]
    fn wrong_and_empty_tokens_fail() {
        let auth = BearerAuth::from_token("secret-token");
        assert!(!auth.check(Some("Bearer nope")));
        assert!(!auth.check(Some("Bearer ")));
    }

    #[test]
    fn trailing_whitespace_in_the_header_is_tolerated() {
        let auth = BearerAuth::from_token("secret-token");
        assert!(auth.check(Some("Bearer secret-token ")));
    }

    #[test]
    fn provisioned_token_round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.yaml");
        let token = provision(&path).unwrap();
        assert_eq!(token.len(), 43, "base64url of 32 bytes, no padding");

        let auth = BearerAuth::load(&path).unwrap();
        assert!(auth.check(Some(&format!("Bearer {token}"))));
        assert!(!auth.check(Some("Bearer something-else")));
    }

    #[test]
    fn the_file_stores_a_digest_not_the_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.yaml");
        let token = provision(&path).unwrap();
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(!on_disk.contains(&token));
        assert!(on_disk.contains("token_hash"));
    }

    #[test]
    fn two_provisioned_hubs_get_distinct_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let a = provision(&dir.path().join("a.yaml")).unwrap();
        let b = provision(&dir.path().join("b.yaml")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_hash_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.yaml");

        std::fs::write(&path, "token_hash: \"zz-not-hex\"\n").unwrap();
        assert!(BearerAuth::load(&path).is_err());

        std::fs::write(&path, "token_hash: \"abcd\"\n").unwrap();
        assert!(BearerAuth::load(&path).is_err(), "digest must be 32 bytes");
    }
}
