use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bitcoin::secp256k1::{Keypair, Message, PublicKey, Secp256k1, SecretKey};
use sec1::der::asn1::ObjectIdentifier;
use sec1::der::pem::LineEnding;
use sec1::der::{Decode, EncodePem};
use sec1::{EcParameters, EcPrivateKey};
use thiserror::Error;

/// Named curve OID for secp256k1 (SEC 2).
const SECP256K1_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.10");
const PEM_LABEL: &str = "EC PRIVATE KEY";
const SCALAR_LEN: usize = 32;
const KEYGEN_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("key encoding failed: {0}")]
    Encoding(String),
}

/// Keypair used to author events.
///
/// Both halves are held base64-encoded: `private_key` is the raw 32-byte scalar,
/// `public_key` the 33-byte compressed point.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    public_key: String,
    private_key: String,
}

impl Identity {
    /// Derive an identity from a base64 DER `ECPrivateKey` (SEC1), optionally
    /// still wrapped in its PEM header and footer.
    pub fn from_secret(secret: &str) -> Result<Self, IdentityError> {
        let body = strip_pem_framing(secret);
        let der = BASE64
            .decode(body.as_bytes())
            .map_err(|e| IdentityError::Derivation(format!("invalid base64: {e}")))?;
        let key = EcPrivateKey::from_der(&der)
            .map_err(|e| IdentityError::Derivation(format!("invalid EC private key: {e}")))?;

        if let Some(curve) = key.parameters.and_then(|params| params.named_curve())
            && curve != SECP256K1_OID
        {
            return Err(IdentityError::Derivation(format!(
                "unsupported curve {curve}, expected secp256k1"
            )));
        }

        let scalar = extract_scalar(key.private_key)?;
        let secp = Secp256k1::signing_only();
        let secret_key = SecretKey::from_slice(&scalar)
            .map_err(|e| IdentityError::Derivation(format!("invalid scalar: {e}")))?;
        let compressed = PublicKey::from_secret_key(&secp, &secret_key).serialize();

        Ok(Self {
            public_key: BASE64.encode(compressed),
            private_key: BASE64.encode(scalar),
        })
    }

    /// Build an identity from already-encoded halves. No consistency check is
    /// performed.
    pub fn from_pair(public_key: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            private_key: private_key.into(),
        }
    }

    /// Base64 compressed public key.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Base64 raw private scalar.
    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    /// Nostr `pubkey`: lowercase hex of the x coordinate.
    pub fn public_key_hex(&self) -> Result<String, IdentityError> {
        let compressed = BASE64
            .decode(self.public_key.as_bytes())
            .map_err(|e| IdentityError::Encoding(format!("invalid public key base64: {e}")))?;
        match compressed.split_first() {
            Some((_parity, x)) if x.len() == SCALAR_LEN => Ok(hex::encode(x)),
            _ => Err(IdentityError::Encoding(format!(
                "compressed public key must be 33 bytes, got {}",
                compressed.len()
            ))),
        }
    }

    /// BIP-340 Schnorr signature over a 32-byte digest.
    ///
    /// No auxiliary randomness is mixed into the nonce, so signing the same
    /// digest with the same key always yields the same signature.
    pub fn sign(&self, digest: &[u8; 32]) -> Result<[u8; 64], IdentityError> {
        let scalar = BASE64
            .decode(self.private_key.as_bytes())
            .map_err(|e| IdentityError::Signing(format!("invalid private key base64: {e}")))?;
        let secp = Secp256k1::signing_only();
        let secret_key = SecretKey::from_slice(&scalar)
            .map_err(|e| IdentityError::Signing(format!("invalid scalar: {e}")))?;
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        let signature = secp.sign_schnorr_no_aux_rand(&Message::from_digest(*digest), &keypair);
        Ok(signature.serialize())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Generate a fresh secp256k1 key and return it as the base64 body of a SEC1
/// PEM document (header and footer removed, lines joined).
pub fn generate_secret() -> Result<String, IdentityError> {
    let secp = Secp256k1::signing_only();
    let mut secret_key = None;
    for _ in 0..KEYGEN_ATTEMPTS {
        let candidate: [u8; SCALAR_LEN] = rand::random();
        if let Ok(key) = SecretKey::from_slice(&candidate) {
            secret_key = Some(key);
            break;
        }
    }
    let secret_key = secret_key.ok_or_else(|| {
        IdentityError::Encoding("random source produced no valid scalar".to_string())
    })?;

    let scalar = secret_key.secret_bytes();
    let public_key = PublicKey::from_secret_key(&secp, &secret_key).serialize_uncompressed();
    let document = EcPrivateKey {
        private_key: &scalar,
        parameters: Some(EcParameters::NamedCurve(SECP256K1_OID)),
        public_key: Some(&public_key),
    };
    let pem = document
        .to_pem(LineEnding::LF)
        .map_err(|e| IdentityError::Encoding(format!("failed to encode PEM: {e}")))?;

    let body = strip_pem_framing(&pem);
    if body.is_empty() {
        return Err(IdentityError::Encoding("empty PEM body".to_string()));
    }
    Ok(body)
}

/// Wrap a base64 key body in `EC PRIVATE KEY` PEM framing.
pub fn frame_pem(body: &str) -> String {
    format!("-----BEGIN {PEM_LABEL}-----\n{}\n-----END {PEM_LABEL}-----\n", body.trim())
}

/// Remove PEM header/footer lines and all whitespace, leaving the base64 body.
pub fn strip_pem_framing(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("-----"))
        .flat_map(|line| line.split_whitespace())
        .collect()
}

fn extract_scalar(raw: &[u8]) -> Result<[u8; SCALAR_LEN], IdentityError> {
    // Big-endian integer: tolerate stripped leading zeros, reject anything wider.
    let significant = match raw.iter().position(|byte| *byte != 0) {
        Some(start) => &raw[start..],
        None => return Err(IdentityError::Derivation("private key is zero".to_string())),
    };
    if significant.len() > SCALAR_LEN {
        return Err(IdentityError::Derivation(format!(
            "private key is {} bytes, expected at most {SCALAR_LEN}",
            significant.len()
        )));
    }
    let mut scalar = [0_u8; SCALAR_LEN];
    scalar[SCALAR_LEN - significant.len()..].copy_from_slice(significant);
    Ok(scalar)
}
