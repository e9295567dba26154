//! Fixed test key material and the server host key.
//!
//! The client keys are compiled in from `testdata/` and parsed once at
//! startup; a malformed entry aborts startup. In russh a [`PrivateKey`] is its
//! own signer, so each entry keeps the private key next to its public half.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use russh::keys::ssh_key::LineEnding;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey, PublicKey};
use tracing::info;

use crate::auth::AuthorizedKeySet;

/// Built-in test keys as `(label, OpenSSH private key)`.
pub const TEST_KEY_MATERIAL: &[(&str, &str)] = &[
    ("ecdsa", include_str!("../testdata/ecdsa.pem")),
    ("ed25519", include_str!("../testdata/ed25519.pem")),
    ("rsa", include_str!("../testdata/rsa.pem")),
];

#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub label: String,
    pub private_key: PrivateKey,
    pub public_key: PublicKey,
}

impl KeyEntry {
    fn parse(label: &str, pem: &str) -> Result<Self> {
        let private_key = PrivateKey::from_openssh(pem)
            .map_err(|e| anyhow!("Unable to parse test key {label}: {e}"))?;
        let public_key = private_key.public_key().clone();
        Ok(Self {
            label: label.to_string(),
            private_key,
            public_key,
        })
    }

    /// `authorized_keys`-style line for the public half.
    pub fn public_openssh(&self) -> Result<String> {
        self.public_key
            .to_openssh()
            .with_context(|| format!("Failed to encode public key {}", self.label))
    }

    pub fn private_openssh(&self) -> Result<String> {
        let pem = self
            .private_key
            .to_openssh(LineEnding::LF)
            .with_context(|| format!("Failed to encode private key {}", self.label))?;
        Ok(pem.to_string())
    }
}

/// The provisioned set of client keys, ordered by label.
#[derive(Debug, Clone)]
pub struct TestKeys {
    entries: Vec<KeyEntry>,
}

impl TestKeys {
    /// Parse the built-in key material.
    pub fn provision() -> Result<Self> {
        Self::from_material(TEST_KEY_MATERIAL.iter().copied())
    }

    pub fn from_material<'a>(material: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let mut entries = material
            .into_iter()
            .map(|(label, pem)| KeyEntry::parse(label, pem))
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(Self { entries })
    }

    pub fn get(&self, label: &str) -> Option<&KeyEntry> {
        self.entries.iter().find(|e| e.label == label)
    }

    pub fn labels(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.label.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Public halves keyed by label, for the auth policy.
    pub fn authorized(&self) -> AuthorizedKeySet {
        AuthorizedKeySet::new(
            self.entries
                .iter()
                .map(|e| (e.label.clone(), e.public_key.clone())),
        )
    }
}

/// Load the host key from `path`, or generate an ephemeral Ed25519 key.
pub fn load_host_key(path: Option<&Path>) -> Result<PrivateKey> {
    match path {
        Some(path) => {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read host key {}", path.display()))?;
            let key = PrivateKey::from_openssh(&pem)
                .map_err(|e| anyhow!("Failed to parse host key {}: {}", path.display(), e))?;
            info!("Loaded SSH host key from {}", path.display());
            Ok(key)
        }
        None => {
            let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
                .map_err(|e| anyhow!("Failed to generate host key: {}", e))?;
            info!("Generated ephemeral SSH host key");
            Ok(key)
        }
    }
}
