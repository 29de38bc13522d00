//! The "TRUST" Engine - Ed25519 provenance for published responses
//!
//! Every response a peer publishes (discovery listings, positions, render
//! info) is signed over its name, content, freshness and timestamp. The
//! receiver checks the signature against the key carried in the response
//! before any content is parsed; failures are logged and the response is
//! treated as never received.

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use matryoshka_env::{Name, SignedResponse, SyncContext};
use thiserror::Error;

/// Signing and verification errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustError {
    #[error("Invalid signature")]
    InvalidSignature,
    
    #[error("Malformed public key")]
    MalformedKey,
    
    #[error("Malformed signature bytes")]
    MalformedSignature,
    
    #[error("Signing failed: {0}")]
    SigningFailed(String),
}

/// Turns a payload into a wire-ready, signed response.
pub trait ResponseSigner: Send + Sync + 'static {
    fn sign(
        &self,
        name: Name,
        content: Vec<u8>,
        freshness: Duration,
        timestamp_ms: u64,
    ) -> Result<SignedResponse, TrustError>;
    
    /// Public key bytes published alongside signatures.
    fn public_key(&self) -> Vec<u8>;
}

/// Signer backed by an Ed25519 key.
pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }
    
    /// Derives the key through the context (random in production, seeded in
    /// simulation).
    pub fn from_context<Ctx: SyncContext>(ctx: &Ctx, seed_extension: u64) -> Arc<Self> {
        Arc::new(Self::new(ctx.derive_signing_key(seed_extension)))
    }
}

impl ResponseSigner for Ed25519Signer {
    fn sign(
        &self,
        name: Name,
        content: Vec<u8>,
        freshness: Duration,
        timestamp_ms: u64,
    ) -> Result<SignedResponse, TrustError> {
        let freshness_ms = u64::try_from(freshness.as_millis())
            .map_err(|_| TrustError::SigningFailed("freshness out of range".into()))?;
        let message = SignedResponse::signable(&name, &content, freshness_ms, timestamp_ms);
        let signature = self.signing_key.sign(&message);
        Ok(SignedResponse {
            name,
            content,
            freshness_ms,
            timestamp_ms,
            signature: signature.to_bytes().to_vec(),
            public_key: self.public_key(),
        })
    }
    
    fn public_key(&self) -> Vec<u8> {
        self.signing_key.verifying_key().to_bytes().to_vec()
    }
}

/// Checks the response signature against the key it carries.
pub fn verify_response(response: &SignedResponse) -> Result<(), TrustError> {
    let key_bytes: [u8; 32] = response
        .public_key
        .as_slice()
        .try_into()
        .map_err(|_| TrustError::MalformedKey)?;
    let public_key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| TrustError::MalformedKey)?;
    let signature =
        Signature::from_slice(&response.signature).map_err(|_| TrustError::MalformedSignature)?;
    public_key
        .verify(&response.signable_bytes(), &signature)
        .map_err(|_| TrustError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    
    fn signer() -> Ed25519Signer {
        Ed25519Signer::new(SigningKey::generate(&mut OsRng))
    }
    
    fn signed(signer: &Ed25519Signer) -> SignedResponse {
        signer
            .sign(
                Name::parse("/hub/players/a/position/3").unwrap(),
                b"1,2,3".to_vec(),
                Duration::from_secs(1),
                1_000,
            )
            .unwrap()
    }
    
    #[test]
    fn test_sign_and_verify() {
        let signer = signer();
        let response = signed(&signer);
        assert_eq!(response.freshness_ms, 1_000);
        assert_eq!(response.public_key, signer.public_key());
        assert!(verify_response(&response).is_ok());
    }
    
    #[test]
    fn test_tampered_content_rejected() {
        let mut response = signed(&signer());
        response.content = b"9,9,9".to_vec();
        assert_eq!(verify_response(&response), Err(TrustError::InvalidSignature));
    }
    
    #[test]
    fn test_tampered_name_rejected() {
        let mut response = signed(&signer());
        response.name = Name::parse("/hub/players/a/position/4").unwrap();
        assert_eq!(verify_response(&response), Err(TrustError::InvalidSignature));
    }
    
    #[test]
    fn test_wrong_key_rejected() {
        let mut response = signed(&signer());
        response.public_key = signer().public_key();
        assert_eq!(verify_response(&response), Err(TrustError::InvalidSignature));
    }
    
    #[test]
    fn test_malformed_material() {
        let mut response = signed(&signer());
        response.signature.truncate(10);
        assert_eq!(verify_response(&response), Err(TrustError::MalformedSignature));
        
        response.public_key = vec![1, 2, 3];
        assert_eq!(verify_response(&response), Err(TrustError::MalformedKey));
    }
}
