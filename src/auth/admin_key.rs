//! Admin key material
//!
//! The admin private key never leaves the operator. Its public half is
//! uploaded to the backend as a project credential, and the private half
//! signs the access tokens handed to the CSI driver.

use crate::error::{Error, Result};
use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::path::Path;

/// Parsed admin key with its derived public key
#[derive(Clone)]
pub struct AdminKey {
    encoding: EncodingKey,
    decoding: DecodingKey,
    public_pem: String,
}

impl std::fmt::Debug for AdminKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminKey")
            .field("public_pem", &self.public_pem)
            .finish_non_exhaustive()
    }
}

impl AdminKey {
    /// Parse a PEM encoded RSA private key (PKCS#1 or PKCS#8)
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(pem)
            .map_err(|_| Error::KeyMaterial("admin key is not valid PEM text".into()))?;

        let private = RsaPrivateKey::from_pkcs1_pem(text)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(text))
            .map_err(|e| Error::KeyMaterial(format!("failed to parse RSA private key: {}", e)))?;

        let public_pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::KeyMaterial(format!("failed to encode public key: {}", e)))?;

        let encoding = EncodingKey::from_rsa_pem(text.as_bytes())
            .map_err(|e| Error::KeyMaterial(format!("unusable signing key: {}", e)))?;
        let decoding = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| Error::KeyMaterial(format!("unusable verification key: {}", e)))?;

        Ok(Self {
            encoding,
            decoding,
            public_pem,
        })
    }

    /// Read and parse a key file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let pem = std::fs::read(path.as_ref())?;
        Self::from_pem(&pem)
    }

    /// PEM encoded public key, uploaded as the project credential
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }
}
