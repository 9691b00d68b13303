//! Hashing and signature verification primitives (RFC 6376 §3.3, RFC 8463).

use crate::DKIMError;
use base64::engine::general_purpose;
use base64::Engine;
use rsa::{pkcs1, pkcs8};
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha1::{Digest as _, Sha1};
use sha2::Sha256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    RsaSha1,
    RsaSha256,
    Ed25519Sha256,
}

impl HashAlgo {
    pub fn algo_name(&self) -> &'static str {
        match self {
            Self::RsaSha1 => "rsa-sha1",
            Self::RsaSha256 => "rsa-sha256",
            Self::Ed25519Sha256 => "ed25519-sha256",
        }
    }

    pub fn hash_name(&self) -> &'static str {
        match self {
            Self::RsaSha1 => "sha1",
            Self::RsaSha256 | Self::Ed25519Sha256 => "sha256",
        }
    }

    pub fn signature_algo_name(&self) -> &'static str {
        match self {
            Self::RsaSha1 | Self::RsaSha256 => "rsa",
            Self::Ed25519Sha256 => "ed25519",
        }
    }

    /// Parses an `a=`-style algorithm name (`rsa-sha1`, `rsa-sha256`,
    /// `ed25519-sha256`), as may appear in an ARH entry's `header.a`
    /// property.
    pub fn from_algo_name(name: &str) -> Option<Self> {
        match name {
            "rsa-sha1" => Some(Self::RsaSha1),
            "rsa-sha256" => Some(Self::RsaSha256),
            "ed25519-sha256" => Some(Self::Ed25519Sha256),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DkimPublicKey {
    Rsa(RsaPublicKey),
    Ed25519(ed25519_dalek::VerifyingKey),
    /// An empty `p=` tag: the key has been revoked by the signer.
    Revoked,
}

impl DkimPublicKey {
    /// Decodes a DER-encoded RSA SubjectPublicKeyInfo (or bare PKCS#1) blob,
    /// or a 32-byte raw Ed25519 key, per the DNS key record's `k=`.
    pub fn decode(key_type: &str, der: &[u8]) -> Result<Self, DKIMError> {
        if der.is_empty() {
            return Ok(Self::Revoked);
        }
        match key_type {
            "rsa" => {
                let key = pkcs8::DecodePublicKey::from_public_key_der(der)
                    .or_else(|_| pkcs1::DecodeRsaPublicKey::from_pkcs1_der(der))
                    .map_err(|err| DKIMError::KeyDecode(err.to_string()))?;
                Ok(Self::Rsa(key))
            }
            "ed25519" => {
                let bytes: [u8; 32] = der
                    .try_into()
                    .map_err(|_| DKIMError::KeyDecode("ed25519 key must be 32 bytes".into()))?;
                let key = ed25519_dalek::VerifyingKey::from_bytes(&bytes)
                    .map_err(|err| DKIMError::KeyDecode(err.to_string()))?;
                Ok(Self::Ed25519(key))
            }
            other => Err(DKIMError::UnknownKeyType(other.to_string())),
        }
    }

    /// Reports the key size in bits, used for the `KeySmall` policy (§4.4).
    pub fn key_length_bits(&self) -> Option<u32> {
        match self {
            Self::Rsa(key) => Some(rsa::traits::PublicKeyParts::size(key) as u32 * 8),
            Self::Ed25519(_) => Some(256),
            Self::Revoked => None,
        }
    }
}

/// Verifies a signature over already-canonicalized bytes. `signed_bytes` is
/// hashed here with the algorithm implied by `hash_algo`; callers must not
/// pre-hash.
pub fn verify_signature(
    hash_algo: HashAlgo,
    signed_bytes: &[u8],
    signature: &[u8],
    public_key: &DkimPublicKey,
) -> Result<bool, DKIMError> {
    match public_key {
        DkimPublicKey::Revoked => Err(DKIMError::KeyRevoked),
        DkimPublicKey::Rsa(key) => {
            let (scheme, hashed): (Pkcs1v15Sign, Vec<u8>) = match hash_algo {
                HashAlgo::RsaSha1 => (
                    Pkcs1v15Sign::new::<Sha1>(),
                    Sha1::digest(signed_bytes).to_vec(),
                ),
                HashAlgo::RsaSha256 => (
                    Pkcs1v15Sign::new::<Sha256>(),
                    Sha256::digest(signed_bytes).to_vec(),
                ),
                HashAlgo::Ed25519Sha256 => return Err(DKIMError::UnknownKeyType("rsa".into())),
            };
            Ok(key.verify(scheme, &hashed, signature).is_ok())
        }
        DkimPublicKey::Ed25519(key) => {
            if hash_algo != HashAlgo::Ed25519Sha256 {
                return Err(DKIMError::UnknownKeyType("ed25519".into()));
            }
            let sig_bytes: [u8; 64] = signature
                .try_into()
                .map_err(|_| DKIMError::BadSignature)?;
            let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
            use ed25519_dalek::Verifier as _;
            Ok(key.verify(signed_bytes, &sig).is_ok())
        }
    }
}

pub fn base64_decode(value: &str) -> Result<Vec<u8>, DKIMError> {
    general_purpose::STANDARD
        .decode(value)
        .map_err(|err| DKIMError::KeyDecode(format!("invalid base64: {}", err)))
}

pub fn base64_encode(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_algo_names() {
        assert_eq!(HashAlgo::RsaSha256.algo_name(), "rsa-sha256");
        assert_eq!(HashAlgo::Ed25519Sha256.hash_name(), "sha256");
        assert_eq!(HashAlgo::RsaSha1.signature_algo_name(), "rsa");
    }

    #[test]
    fn test_decode_revoked_key() {
        let key = DkimPublicKey::decode("rsa", &[]).unwrap();
        assert!(matches!(key, DkimPublicKey::Revoked));
    }

    #[test]
    fn test_decode_unknown_key_type() {
        let err = DkimPublicKey::decode("foo", &[1, 2, 3]).unwrap_err();
        assert_eq!(err, DKIMError::UnknownKeyType("foo".to_string()));
    }
}
