use crate::{parser, ArcError, ArcPublicKey, DNS_NAMESPACE, MIN_RSA_BITS};
use arc_dns::Resolver;
use data_encoding::BASE64;
use rsa::traits::PublicKeyParts;
use rsa::{pkcs1, pkcs8};
use std::collections::HashMap;

const RSA_KEY_TYPE: &str = "rsa";
const ED25519_KEY_TYPE: &str = "ed25519";

/// An ed25519 key published as a full SubjectPublicKeyInfo blob carries
/// this many bytes of ASN.1 prefix ahead of the raw 32 byte key.
const ED25519_SPKI_PREFIX_LEN: usize = 12;

// https://datatracker.ietf.org/doc/html/rfc6376#section-6.1.2
pub(crate) async fn retrieve_public_key(
    resolver: &dyn Resolver,
    domain: &str,
    selector: &str,
) -> Result<ArcPublicKey, ArcError> {
    let dns_name = format!("{}.{}.{}", selector, DNS_NAMESPACE, domain);
    let answer = resolver.resolve_txt(&dns_name).await.map_err(|err| {
        if err.is_transient() {
            ArcError::KeyUnavailable(format!("failed to query DNS: {}", err))
        } else {
            ArcError::NoKeyForSignature
        }
    })?;
    if answer.nxdomain {
        return Err(ArcError::NoKeyForSignature);
    }
    let txt = answer.records.first().ok_or(ArcError::NoKeyForSignature)?;
    tracing::debug!("key record for {dns_name}: {txt:?}");

    parse_key_record(txt)
}

/// Parse the tag list inside a DKIM-style TXT key record.
/// Recognised tags are v, k, h, p, s, t and n; unknown tags are ignored.
pub(crate) fn parse_key_record(txt: &str) -> Result<ArcPublicKey, ArcError> {
    let (_, tags) = parser::tag_list(txt).map_err(|err| {
        tracing::warn!("key syntax error: {}", err);
        ArcError::KeySyntaxError
    })?;

    let mut tags_map = HashMap::new();
    for tag in &tags {
        if tags_map.insert(tag.name.clone(), tag.clone()).is_some() {
            return Err(ArcError::KeySyntaxError);
        }
    }

    // Check version
    if let Some(version) = tags_map.get("v") {
        if version.value != "DKIM1" {
            return Err(ArcError::KeyIncompatibleVersion);
        }
    }

    // Get key type
    let key_type = match tags_map.get("k") {
        Some(v) => {
            if v.value != RSA_KEY_TYPE && v.value != ED25519_KEY_TYPE {
                return Err(ArcError::InappropriateKeyAlgorithm);
            }
            v.value.clone()
        }
        None => RSA_KEY_TYPE.to_string(),
    };

    // The h= tag constrains the acceptable hash algorithms;
    // we only ever produce or verify sha256.
    if let Some(hashes) = tags_map.get("h") {
        if !hashes
            .value
            .split(':')
            .any(|h| h.trim().eq_ignore_ascii_case("sha256"))
        {
            return Err(ArcError::InappropriateHashAlgorithm);
        }
    }

    if let Some(service) = tags_map.get("s") {
        if !service
            .value
            .split(':')
            .any(|s| s.trim() == "*" || s.trim().eq_ignore_ascii_case("email"))
        {
            return Err(ArcError::InappropriateKeyAlgorithm);
        }
    }

    let tag = tags_map.get("p").ok_or(ArcError::NoKeyForSignature)?;
    if tag.value.is_empty() {
        // An empty p= signals that the key has been revoked
        return Err(ArcError::KeyRevoked);
    }
    let bytes = BASE64.decode(tag.value.as_bytes()).map_err(|err| {
        ArcError::KeyUnavailable(format!("failed to decode public key: {}", err))
    })?;

    if key_type == RSA_KEY_TYPE {
        let key: rsa::RsaPublicKey = pkcs8::DecodePublicKey::from_public_key_der(&bytes)
            .or_else(|_| pkcs1::DecodeRsaPublicKey::from_pkcs1_der(&bytes))
            .map_err(|err| {
                ArcError::KeyUnavailable(format!("failed to parse public key: {}", err))
            })?;
        let bits = key.size() * 8;
        if bits < MIN_RSA_BITS {
            return Err(ArcError::KeyTooWeak(bits));
        }
        Ok(ArcPublicKey::Rsa(key))
    } else {
        // DNS records may carry either the bare 32 byte key or a full
        // SubjectPublicKeyInfo blob; strip the ASN.1 prefix from the latter
        let raw = if bytes.len() == 32 + ED25519_SPKI_PREFIX_LEN {
            &bytes[ED25519_SPKI_PREFIX_LEN..]
        } else {
            &bytes[..]
        };
        let raw: &[u8; 32] = raw
            .try_into()
            .map_err(|_| ArcError::KeyUnavailable("invalid ed25519 key length".to_string()))?;
        Ok(ArcPublicKey::Ed25519(
            ed25519_dalek::VerifyingKey::from_bytes(raw).map_err(|err| {
                ArcError::KeyUnavailable(format!("failed to parse public key: {}", err))
            })?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arc_dns::TestResolver;

    const RSA_RECORD: &str = "v=DKIM1; k=rsa; p=MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEA6gmVDBSBJ0l1/33uAF0gwIsrjQV6nnYjL9DMX6+ez4NNJ2um0InYy128Rd+OlIhmdSld6g3tj3O6R+BwsYsQgU8RWE8VJaRybvPw2P3Asgms4uPrFWHSFiWMPH0P9i/oPwnUO9jZKHiz4+MzFC3bG8BacX7YIxCuWnDU8XNmNsRaLmrv9CHX4/3GHyoHSmDA1ETtyz9JHRCOC8ho8C7b4f2Auwedlau9Lid9LGBhozhgRFhrFwFMe93y34MO1clPbY6HwxpudKWBkMQCTlmXVRnkKxHlJ+fYCyC2jjpCIbGWj2oLxBtFOASWMESR4biW0ph2bsZXslcUSPMTVTkFxQIDAQAB";

    #[tokio::test]
    async fn test_retrieve_public_key() {
        let resolver =
            TestResolver::default().with_txt("dkim._domainkey.example.com", RSA_RECORD.to_string());
        let key = retrieve_public_key(&resolver, "example.com", "dkim")
            .await
            .unwrap();
        assert!(matches!(key, ArcPublicKey::Rsa(_)));
    }

    #[tokio::test]
    async fn test_retrieve_public_key_nxdomain() {
        let resolver = TestResolver::default();
        assert_eq!(
            retrieve_public_key(&resolver, "example.com", "dkim")
                .await
                .unwrap_err(),
            ArcError::NoKeyForSignature
        );
    }

    #[tokio::test]
    async fn test_retrieve_public_key_tempfail() {
        let resolver = TestResolver::default().with_tempfail("dkim._domainkey.example.com");
        let err = retrieve_public_key(&resolver, "example.com", "dkim")
            .await
            .unwrap_err();
        assert!(matches!(err, ArcError::KeyUnavailable(_)));
        assert_eq!(err.status(), crate::Status::Tempfail);
    }

    #[test]
    fn test_incompatible_version() {
        assert_eq!(
            parse_key_record("v=DKIM6; p=key").unwrap_err(),
            ArcError::KeyIncompatibleVersion
        );
    }

    #[test]
    fn test_inappropriate_key_algorithm() {
        assert_eq!(
            parse_key_record("v=DKIM1; p=key; k=foo").unwrap_err(),
            ArcError::InappropriateKeyAlgorithm
        );
    }

    #[test]
    fn test_revoked() {
        assert_eq!(
            parse_key_record("v=DKIM1; k=rsa; p=").unwrap_err(),
            ArcError::KeyRevoked
        );
    }

    #[test]
    fn test_hash_constraint() {
        assert_eq!(
            parse_key_record(&format!("v=DKIM1; k=rsa; h=sha1; {}", p_tag())).unwrap_err(),
            ArcError::InappropriateHashAlgorithm
        );
        parse_key_record(&format!("v=DKIM1; k=rsa; h=sha1:sha256; {}", p_tag())).unwrap();
    }

    fn p_tag() -> String {
        RSA_RECORD.split("p=").nth(1).map(|p| format!("p={p}")).unwrap()
    }

    #[test]
    fn test_ed25519_raw_and_spki() {
        // raw 32 byte form, from the RFC8463 example key
        let raw = "11qYAYKxCrfVS/7TyWQHOg7hcvPapiMlrwIaaPcHURo=";
        let key = parse_key_record(&format!("v=DKIM1; k=ed25519; p={raw}")).unwrap();
        let ArcPublicKey::Ed25519(raw_key) = key else {
            panic!("expected ed25519")
        };

        // the same key wrapped in a SubjectPublicKeyInfo prefix
        let mut spki = vec![
            0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
        ];
        spki.extend_from_slice(&BASE64.decode(raw.as_bytes()).unwrap());
        let spki_b64 = BASE64.encode(&spki);
        let key = parse_key_record(&format!("v=DKIM1; k=ed25519; p={spki_b64}")).unwrap();
        let ArcPublicKey::Ed25519(spki_key) = key else {
            panic!("expected ed25519")
        };

        assert_eq!(raw_key.as_bytes(), spki_key.as_bytes());
    }
}
