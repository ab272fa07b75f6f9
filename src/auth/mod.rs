//! Credentials and access tokens
//!
//! - [`admin_key`]: admin private key parsing and public key derivation
//! - [`token`]: issuing and parsing RS256 access tokens

pub mod admin_key;
pub mod token;

pub use admin_key::AdminKey;
pub use token::{AccessToken, TokenClaims};
