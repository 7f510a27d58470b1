//! Strong identities for components granted full trust inside a boundary.
//!
//! A component is identified by name, version and a SHA-256 digest of its
//! content. It is "strongly named" when it also carries an Ed25519 public key
//! and a signature over the canonical identity bytes
//! (`name \n version \n hex(digest)`).

use crate::BoundaryError;
use ed25519_dalek::{
    Signature as DalekSignature, Signer as _, SigningKey as DalekSigningKey, Verifier as _,
    VerifyingKey as DalekVerifyingKey,
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

/// Ed25519 signing key (secret). Used to sign component identities.
pub struct SigningKey(DalekSigningKey);

/// A keypair for signing and verification.
pub struct KeyPair {
    pub signing_key: SigningKey,
    pub public_key: [u8; 32],
}

impl KeyPair {
    /// Generates a new random Ed25519 keypair.
    pub fn generate() -> Self {
        let signing = DalekSigningKey::generate(&mut OsRng);
        let public_key = signing.verifying_key().to_bytes();
        Self {
            signing_key: SigningKey(signing),
            public_key,
        }
    }

    /// Hex encoded public key, the form used in policy allowlists.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }
}

impl SigningKey {
    /// Creates a signing key from raw 32-byte secret.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(DalekSigningKey::from_bytes(bytes))
    }

    /// Returns the raw 32-byte public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.0.verifying_key().to_bytes()
    }

    fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.0.sign(message).to_bytes()
    }
}

/// Identity of a component that may be granted full trust.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentIdentity {
    pub name: String,
    pub version: String,
    pub digest: [u8; 32],
    pub public_key: Option<[u8; 32]>,
    pub signature: Option<[u8; 64]>,
}

impl ComponentIdentity {
    /// Identity of a component without a signature.
    pub fn unsigned(name: impl Into<String>, version: impl Into<String>, content: &[u8]) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            digest: Sha256::digest(content).into(),
            public_key: None,
            signature: None,
        }
    }

    /// Signs the identity, attaching the public key and signature.
    #[must_use]
    pub fn signed_by(mut self, key: &SigningKey) -> Self {
        let signature = key.sign(&self.canonical_bytes());
        self.public_key = Some(key.public_key());
        self.signature = Some(signature);
        self
    }

    pub fn is_signed(&self) -> bool {
        self.public_key.is_some() && self.signature.is_some()
    }

    /// Bytes covered by the signature.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        format!("{}\n{}\n{}", self.name, self.version, hex::encode(self.digest)).into_bytes()
    }
}

/// A verified identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StrongName {
    pub name: String,
    pub version: String,
    pub public_key_hex: String,
}

impl fmt::Display for StrongName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = &self.public_key_hex[..self.public_key_hex.len().min(16)];
        write!(f, "{}, Version={}, PublicKeyToken={}", self.name, self.version, token)
    }
}

/// Validates strong identities of components requesting full trust.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, component: &ComponentIdentity) -> Result<StrongName, BoundaryError>;
}

/// Checks the Ed25519 signature and, when an allowlist is configured, the signing key.
#[derive(Debug, Clone, Default)]
pub struct Ed25519Verifier {
    /// Lowercase hex public keys. Empty accepts any key with a valid signature.
    allowed_keys: HashSet<String>,
}

impl Ed25519Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allowed_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_keys: keys
                .into_iter()
                .map(|k| k.as_ref().trim().to_ascii_lowercase())
                .collect(),
        }
    }

    fn untrusted(component: &ComponentIdentity, reason: &str) -> BoundaryError {
        BoundaryError::UntrustedComponent {
            component: component.name.clone(),
            reason: reason.to_string(),
        }
    }
}

impl IdentityVerifier for Ed25519Verifier {
    fn verify(&self, component: &ComponentIdentity) -> Result<StrongName, BoundaryError> {
        let (Some(public_key), Some(signature)) = (component.public_key, component.signature)
        else {
            return Err(Self::untrusted(component, "component is not strongly named"));
        };

        let key = DalekVerifyingKey::from_bytes(&public_key)
            .map_err(|_| Self::untrusted(component, "invalid public key"))?;
        key.verify(
            &component.canonical_bytes(),
            &DalekSignature::from_bytes(&signature),
        )
        .map_err(|_| Self::untrusted(component, "signature verification failed"))?;

        let public_key_hex = hex::encode(public_key);
        if !self.allowed_keys.is_empty() && !self.allowed_keys.contains(&public_key_hex) {
            return Err(Self::untrusted(component, "signing key not allowed by policy"));
        }

        Ok(StrongName {
            name: component.name.clone(),
            version: component.version.clone(),
            public_key_hex,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component() -> ComponentIdentity {
        ComponentIdentity::unsigned("Contoso.TestAsserts", "1.2.0", b"assembly bytes")
    }

    #[test]
    fn signed_component_verifies() {
        let kp = KeyPair::generate();
        let id = component().signed_by(&kp.signing_key);
        let strong = Ed25519Verifier::new().verify(&id).unwrap();
        assert_eq!(strong.name, "Contoso.TestAsserts");
        assert_eq!(strong.public_key_hex, kp.public_key_hex());
    }

    #[test]
    fn unsigned_component_rejected() {
        let err = Ed25519Verifier::new().verify(&component()).unwrap_err();
        assert!(matches!(err, BoundaryError::UntrustedComponent { .. }));
    }

    #[test]
    fn tampered_version_rejected() {
        let kp = KeyPair::generate();
        let mut id = component().signed_by(&kp.signing_key);
        id.version = "9.9.9".into();
        assert!(Ed25519Verifier::new().verify(&id).is_err());
    }

    #[test]
    fn tampered_content_rejected() {
        let kp = KeyPair::generate();
        let mut id = component().signed_by(&kp.signing_key);
        id.digest = Sha256::digest(b"other bytes").into();
        assert!(Ed25519Verifier::new().verify(&id).is_err());
    }

    #[test]
    fn allowlist_enforced() {
        let allowed = KeyPair::generate();
        let other = KeyPair::generate();
        let verifier = Ed25519Verifier::with_allowed_keys([allowed.public_key_hex().to_uppercase()]);

        assert!(verifier.verify(&component().signed_by(&allowed.signing_key)).is_ok());
        let err = verifier
            .verify(&component().signed_by(&other.signing_key))
            .unwrap_err();
        assert!(err.to_string().contains("not allowed by policy"));
    }

    #[test]
    fn signing_key_bytes_roundtrip() {
        let kp = KeyPair::generate();
        let restored = SigningKey::from_bytes(&kp.signing_key.0.to_bytes());
        assert_eq!(restored.public_key(), kp.public_key);
    }
}
