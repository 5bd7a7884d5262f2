// src/packager/signing.rs
//! Pack manifest signing
//!
//! Packs are signed with Ed25519 over the exact `MANIFEST.json` bytes. The
//! signature carries no timestamp so re-packing identical inputs produces
//! an identical `MANIFEST.sig`.

use crate::error::{Error, Result};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const ALGORITHM: &str = "ed25519";

/// Default location of the signing key
pub fn default_key_path() -> PathBuf {
    crate::config::chef_dir().join("signing.key")
}

/// Contents of `MANIFEST.sig`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackSignature {
    pub algorithm: String,
    /// Base64 signature bytes
    pub signature: String,
    /// Base64 verifying key
    pub public_key: String,
}

impl PackSignature {
    /// Check the signature against `content` with the embedded key
    pub fn verify(&self, content: &[u8]) -> Result<()> {
        if self.algorithm != ALGORITHM {
            return Err(Error::PackError(format!(
                "unsupported signature algorithm {}",
                self.algorithm
            )));
        }
        let key_bytes: [u8; 32] = decode_fixed(&self.public_key, "public key")?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| Error::PackError(format!("invalid public key: {}", e)))?;
        let sig_bytes: [u8; 64] = decode_fixed(&self.signature, "signature")?;
        key.verify_strict(content, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| Error::PackError("manifest signature does not verify".to_string()))
    }
}

fn decode_fixed<const N: usize>(text: &str, what: &str) -> Result<[u8; N]> {
    BASE64
        .decode(text)
        .map_err(|e| Error::PackError(format!("invalid base64 in {}: {}", what, e)))?
        .try_into()
        .map_err(|_| Error::PackError(format!("{} has the wrong length", what)))
}

/// An Ed25519 key used to sign packs
pub struct SigningKeyPair {
    signing_key: SigningKey,
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key().as_bytes())
    }

    pub fn sign(&self, content: &[u8]) -> PackSignature {
        let signature = self.signing_key.sign(content);
        PackSignature {
            algorithm: ALGORITHM.to_string(),
            signature: BASE64.encode(signature.to_bytes()),
            public_key: self.public_key_base64(),
        }
    }

    /// Write the private key, readable by the owner only
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = KeyFile {
            algorithm: ALGORITHM.to_string(),
            key: BASE64.encode(self.signing_key.to_bytes()),
        };
        let text = toml::to_string_pretty(&data)
            .map_err(|e| Error::IoError(format!("encode signing key: {}", e)))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let key_file: KeyFile = toml::from_str(&content).map_err(|e| {
            Error::PackError(format!("invalid key file {}: {}", path.display(), e))
        })?;
        if key_file.algorithm != ALGORITHM {
            return Err(Error::PackError(format!(
                "unsupported key algorithm: {}",
                key_file.algorithm
            )));
        }
        let bytes: [u8; 32] = decode_fixed(&key_file.key, "signing key")?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    /// Load the key at `path`, creating one on first use
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let pair = Self::generate();
        pair.save(path)?;
        info!("Generated signing key {}", path.display());
        Ok(pair)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    algorithm: String,
    key: String,
}
