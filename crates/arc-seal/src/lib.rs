// Implementation of ARC: https://datatracker.ietf.org/doc/html/rfc8617

use ed25519_dalek::{Signer as _, SigningKey};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

#[macro_use]
extern crate quick_error;

pub mod canonicalization;
pub mod chain;
mod errors;
mod hash;
mod header;
mod parser;
mod public_key;

pub use chain::{
    analyze, ArcSealSet, ChainAnalysis, ChainStatus, Sealer, SealerBuilder,
    ARC_AUTHENTICATION_RESULTS_HEADER_NAME, ARC_MESSAGE_SIGNATURE_HEADER_NAME,
    ARC_SEAL_HEADER_NAME, MAX_INSTANCE,
};
pub use errors::{ArcError, Status};
pub use hash::{compute_body_hash, HashAlgo};
pub use header::{ArcMessageSignatureHeader, ArcSealHeader, TaggedHeader};
pub use parser::{tag_list as parse_tag_list, Tag};

const DNS_NAMESPACE: &str = "_domainkey";

/// RFC8301: verifiers MUST NOT consider signatures using RSA keys of
/// less than 1024 bits as valid.
const MIN_RSA_BITS: usize = 1024;

/// A header field as captured from the message, in arrival order.
/// The chain engine refers to headers by index into the session's list.
#[derive(Debug, Clone, PartialEq)]
pub struct RawHeader {
    pub name: String,
    pub value: String,
}

impl RawHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum ArcPublicKey {
    Rsa(RsaPublicKey),
    Ed25519(ed25519_dalek::VerifyingKey),
}

#[derive(Debug)]
pub enum ArcPrivateKey {
    Rsa(RsaPrivateKey),
    Ed25519(SigningKey),
}

impl ArcPrivateKey {
    /// Parse RSA key data into an ArcPrivateKey
    pub fn rsa_key(data: &[u8]) -> Result<Self, ArcError> {
        let mut errors = vec![];

        match Self::parse_rsa(data, &mut errors) {
            Some(key) => {
                let bits = key.size() * 8;
                if bits < MIN_RSA_BITS {
                    return Err(ArcError::KeyTooWeak(bits));
                }
                Ok(Self::Rsa(key))
            }
            None => Err(ArcError::PrivateKeyLoadError(errors.join(". "))),
        }
    }

    fn parse_rsa(data: &[u8], errors: &mut Vec<String>) -> Option<RsaPrivateKey> {
        match RsaPrivateKey::from_pkcs1_der(data) {
            Ok(key) => return Some(key),
            Err(err) => errors.push(format!("from_pkcs1_der: {err:#}")),
        }
        match RsaPrivateKey::from_pkcs8_der(data) {
            Ok(key) => return Some(key),
            Err(err) => errors.push(format!("from_pkcs8_der: {err:#}")),
        }

        match std::str::from_utf8(data) {
            Ok(s) => {
                match RsaPrivateKey::from_pkcs1_pem(s) {
                    Ok(key) => return Some(key),
                    Err(err) => errors.push(format!("from_pkcs1_pem: {err:#}")),
                }
                match RsaPrivateKey::from_pkcs8_pem(s) {
                    Ok(key) => return Some(key),
                    Err(err) => errors.push(format!("from_pkcs8_pem: {err:#}")),
                }
            }
            Err(err) => errors.push(format!("from_pkcs1_pem: data is not UTF-8: {err:#}")),
        }

        None
    }

    /// Parse PKCS8 encoded ed25519 key data into an ArcPrivateKey.
    /// Both DER and PEM are supported
    pub fn ed25519_key(data: &[u8]) -> Result<Self, ArcError> {
        let mut errors = vec![];

        match SigningKey::from_pkcs8_der(data) {
            Ok(key) => return Ok(Self::Ed25519(key)),
            Err(err) => errors.push(format!("Ed25519 SigningKey::from_pkcs8_der: {err:#}")),
        }

        match std::str::from_utf8(data) {
            Ok(s) => match SigningKey::from_pkcs8_pem(s) {
                Ok(key) => return Ok(Self::Ed25519(key)),
                Err(err) => errors.push(format!("Ed25519 SigningKey::from_pkcs8_pem: {err:#}")),
            },
            Err(err) => errors.push(format!("ed25519_key: data is not UTF-8: {err:#}")),
        }

        Err(ArcError::PrivateKeyLoadError(errors.join(". ")))
    }

    /// Load key data from a file, trying RSA first and then ed25519
    pub fn key_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ArcError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|err| {
            ArcError::PrivateKeyLoadError(format!("failed to read file {path:?}: {err:#}"))
        })?;

        match Self::rsa_key(&data) {
            Ok(key) => Ok(key),
            Err(ArcError::KeyTooWeak(bits)) => Err(ArcError::KeyTooWeak(bits)),
            Err(rsa_err) => Self::ed25519_key(&data).map_err(|ed_err| {
                ArcError::PrivateKeyLoadError(format!("{rsa_err}. {ed_err}"))
            }),
        }
    }

    pub fn hash_algo(&self) -> HashAlgo {
        match self {
            Self::Rsa(_) => HashAlgo::RsaSha256,
            Self::Ed25519(_) => HashAlgo::Ed25519Sha256,
        }
    }

    pub(crate) fn sign(&self, header_hash: &[u8]) -> Result<Vec<u8>, ArcError> {
        match self {
            Self::Rsa(private_key) => private_key
                .sign(Pkcs1v15Sign::new::<Sha256>(), header_hash)
                .map_err(|err| ArcError::FailedToSign(err.to_string())),
            Self::Ed25519(signing_key) => Ok(signing_key.sign(header_hash).to_bytes().to_vec()),
        }
    }
}

// https://datatracker.ietf.org/doc/html/rfc6376#section-6.1.3 Step 4
pub(crate) fn verify_signature(
    hash_algo: HashAlgo,
    header_hash: &[u8],
    signature: &[u8],
    public_key: &ArcPublicKey,
) -> Result<bool, ArcError> {
    Ok(match (hash_algo, public_key) {
        (HashAlgo::RsaSha256, ArcPublicKey::Rsa(public_key)) => public_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), header_hash, signature)
            .is_ok(),
        (HashAlgo::Ed25519Sha256, ArcPublicKey::Ed25519(public_key)) => {
            let mut sig_bytes = [0u8; ed25519_dalek::Signature::BYTE_SIZE];
            if signature.len() != sig_bytes.len() {
                return Err(ArcError::SignatureSyntaxError(format!(
                    "ed25519 signatures should be {} bytes in length, have: {}",
                    ed25519_dalek::Signature::BYTE_SIZE,
                    signature.len()
                )));
            }
            sig_bytes.copy_from_slice(signature);

            public_key
                .verify_strict(
                    header_hash,
                    &ed25519_dalek::Signature::from_bytes(&sig_bytes),
                )
                .is_ok()
        }
        _ => return Err(ArcError::InappropriateKeyAlgorithm),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_rsa_roundtrip() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = RsaPublicKey::from(&private);
        let key = ArcPrivateKey::Rsa(private);

        let digest: Vec<u8> = {
            use sha2::Digest as _;
            Sha256::digest(b"some hashed content").to_vec()
        };

        let sig = key.sign(&digest).unwrap();
        let public = ArcPublicKey::Rsa(public);
        assert!(verify_signature(HashAlgo::RsaSha256, &digest, &sig, &public).unwrap());

        let mut tampered = sig.clone();
        tampered[0] ^= 0xff;
        assert!(!verify_signature(HashAlgo::RsaSha256, &digest, &tampered, &public).unwrap());
    }

    #[test]
    fn test_sign_verify_ed25519_roundtrip() {
        let signing = SigningKey::from_bytes(&[42u8; 32]);
        let verifying = signing.verifying_key();
        let key = ArcPrivateKey::Ed25519(signing);

        let digest: Vec<u8> = {
            use sha2::Digest as _;
            Sha256::digest(b"some hashed content").to_vec()
        };

        let sig = key.sign(&digest).unwrap();
        assert!(verify_signature(
            HashAlgo::Ed25519Sha256,
            &digest,
            &sig,
            &ArcPublicKey::Ed25519(verifying)
        )
        .unwrap());
    }

    #[test]
    fn test_weak_rsa_key_refused() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 512).unwrap();
        use rsa::pkcs1::EncodeRsaPrivateKey as _;
        let der = private.to_pkcs1_der().unwrap();
        assert!(matches!(
            ArcPrivateKey::rsa_key(der.as_bytes()),
            Err(ArcError::KeyTooWeak(512))
        ));
    }
}
