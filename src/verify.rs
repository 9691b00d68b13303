//! Verifier (C8, spec §4.7): orchestrates message splitting, signature
//! parsing, canonicalization, key retrieval and crypto to produce one
//! [`SignatureResult`] per `DKIM-Signature` header, then ranks them.

use crate::crypto::{self, HashAlgo};
use crate::hash;
use crate::keystore::KeyStore;
use crate::message::Message;
use crate::result::SignatureResult;
use crate::signature::DkimSignature;
use crate::signature::HEADER;
use crate::{DKIMError, Warning};
use std::sync::Arc;

/// Policy knobs affecting verification outcome (spec §4.4, §6).
#[derive(Debug, Clone)]
pub struct VerifyPolicy {
    pub rsa_sha1_treat_as: TreatAs,
    pub weak_rsa_key_treat_as: TreatAs,
    pub weak_rsa_key_floor_bits: u32,
    pub weak_rsa_key_warn_bits: u32,
    pub strict: bool,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            rsa_sha1_treat_as: TreatAs::Warning,
            weak_rsa_key_treat_as: TreatAs::Warning,
            weak_rsa_key_floor_bits: 1024,
            weak_rsa_key_warn_bits: 2048,
            strict: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreatAs {
    Error,
    Warning,
    Ignore,
}

/// One verified (or failed) signature, plus enough context to rank it
/// against its siblings (spec §4.7 tie-break).
pub struct VerifiedSignature {
    pub result: SignatureResult,
    pub header_index: usize,
}

/// Parses the message and verifies every `DKIM-Signature` header found,
/// returning results in header order (unranked; see [`sort_signatures`]).
pub async fn verify_message(
    raw: &[u8],
    keystore: &KeyStore,
    resolver: &dyn crate::dns::Resolver,
    policy: &VerifyPolicy,
    now: i64,
) -> Result<(Message, Vec<VerifiedSignature>), DKIMError> {
    let (message, _msg_warnings) = Message::parse(raw, policy.strict)?;

    let mut results = Vec::new();
    for (header_index, header) in message.get_headers().iter().enumerate() {
        if !header.get_key_ref().eq_ignore_ascii_case(HEADER) {
            continue;
        }
        let result =
            verify_one(&message, header.get_value_raw(), keystore, resolver, policy, now).await;
        results.push(VerifiedSignature {
            result,
            header_index,
        });
    }

    Ok((message, results))
}

async fn verify_one(
    message: &Message,
    raw_value: &[u8],
    keystore: &KeyStore,
    resolver: &dyn crate::dns::Resolver,
    policy: &VerifyPolicy,
    now: i64,
) -> SignatureResult {
    match verify_one_inner(message, raw_value, keystore, resolver, policy, now).await {
        Ok(result) => result,
        Err(err) => SignatureResult::from_error(err),
    }
}

async fn verify_one_inner(
    message: &Message,
    raw_value: &[u8],
    keystore: &KeyStore,
    resolver: &dyn crate::dns::Resolver,
    policy: &VerifyPolicy,
    now: i64,
) -> Result<SignatureResult, DKIMError> {
    // --- Parsing ------------------------------------------------------
    let sig = DkimSignature::parse(raw_value)?;
    let mut warnings = Vec::new();

    if sig.algorithm_hash == HashAlgo::RsaSha1 {
        match policy.rsa_sha1_treat_as {
            TreatAs::Error => {
                return Err(DKIMError::InsecureAlgorithm("rsa-sha1".to_string()))
            }
            TreatAs::Warning => warnings.push(Warning::InsecureAlgorithm("rsa-sha1")),
            TreatAs::Ignore => {}
        }
    }

    // --- HashingBody ----------------------------------------------------
    let (_, full_len) =
        hash::compute_body_hash(sig.canon_body, None, sig.algorithm_hash, message)?;
    let body_hash = match sig.body_length {
        Some(l) => {
            if l as usize > full_len {
                return Err(DKIMError::TooLargeL);
            }
            if (l as usize) < full_len {
                warnings.push(Warning::PartialBodySigned);
            }
            hash::compute_body_hash(sig.canon_body, Some(l), sig.algorithm_hash, message)?.0
        }
        None => hash::compute_body_hash(sig.canon_body, None, sig.algorithm_hash, message)?.0,
    };
    if body_hash != sig.body_hash {
        return Err(DKIMError::CorruptBodyHash);
    }

    // --- FetchingKey / DecodingKey --------------------------------------
    let now_str = now.to_string();
    let key = keystore
        .resolve(resolver, &sig.sdid, &sig.selector, &now_str)
        .await?;

    if !key.allows_hash(sig.algorithm_hash.hash_name()) {
        return Err(DKIMError::HashNotAllowed);
    }
    if key.key_type != sig.algorithm_signature {
        return Err(DKIMError::UnknownKeyType(key.key_type.clone()));
    }

    // --- VerifyingSignature ----------------------------------------------
    let signed_bytes = hash::compute_headers_hash(message, &sig, sig.algorithm_hash);
    let valid = crypto::verify_signature(
        sig.algorithm_hash,
        &signed_bytes,
        &sig.signature,
        &key.public_key,
    )?;
    if !valid {
        return Err(DKIMError::BadSignature);
    }

    // --- post-checks (§4.7 step 6) ---------------------------------------
    if key.strict {
        let domain_part = sig
            .auid
            .rsplit_once('@')
            .map(|(_, d)| d)
            .unwrap_or(&sig.auid)
            .to_lowercase();
        if domain_part != sig.sdid {
            return Err(DKIMError::SubdomainIWithSFlag);
        }
    }

    if let Some(key_bits) = key.public_key.key_length_bits() {
        if key_bits < policy.weak_rsa_key_floor_bits && policy.weak_rsa_key_treat_as == TreatAs::Error
        {
            return Err(DKIMError::KeyDecode(format!(
                "key too small: {} bits",
                key_bits
            )));
        }
        if key_bits < policy.weak_rsa_key_warn_bits && policy.weak_rsa_key_treat_as != TreatAs::Ignore
        {
            warnings.push(Warning::KeySmall(key_bits));
        }
    }

    if let Some(exp) = sig.expiration {
        if exp < now {
            if policy.strict {
                return Err(DKIMError::ExpiredBeforeTimestamp);
            }
            warnings.push(Warning::SignatureExpired);
        }
    }
    if let Some(ts) = sig.timestamp {
        if ts > now {
            warnings.push(Warning::SignatureFuture);
        }
    }

    if key.testing {
        return Ok(SignatureResult::PermFail {
            error_kind: "KeyTestMode",
            context: DKIMError::KeyTestMode.to_string(),
            hidefail: true,
        });
    }

    Ok(SignatureResult::Success {
        sdid: sig.sdid.clone(),
        auid: sig.auid.clone(),
        selector: sig.selector.clone(),
        algorithm_signature: sig.algorithm_signature,
        algorithm_hash: sig.algorithm_hash,
        key_length: key.public_key.key_length_bits(),
        timestamp: sig.timestamp,
        expiration: sig.expiration,
        signed_headers: sig.signed_headers.clone(),
        key_secure: key.secure,
        warnings,
    })
}

/// Tie-break ordering across all of a message's signatures (spec §4.7):
/// SUCCESS before TEMPFAIL before PERMFAIL before None; then SDID equal to
/// the From-domain first, then SDID a parent of the From-domain, then
/// alphabetical; stable by original header index.
pub fn sort_signatures(signatures: &mut [VerifiedSignature], from_domain: &str) {
    signatures.sort_by(|a, b| {
        let rank_a = result_rank(&a.result);
        let rank_b = result_rank(&b.result);
        rank_a
            .cmp(&rank_b)
            .then_with(|| sdid_rank(&a.result, from_domain).cmp(&sdid_rank(&b.result, from_domain)))
            .then_with(|| {
                a.result
                    .sdid()
                    .unwrap_or("")
                    .cmp(b.result.sdid().unwrap_or(""))
            })
            .then_with(|| a.header_index.cmp(&b.header_index))
    });
}

fn result_rank(result: &SignatureResult) -> u8 {
    match result {
        SignatureResult::Success { .. } => 0,
        SignatureResult::TempFail { .. } => 1,
        SignatureResult::PermFail { .. } => 2,
        SignatureResult::None => 3,
    }
}

fn sdid_rank(result: &SignatureResult, from_domain: &str) -> u8 {
    match result.sdid() {
        Some(sdid) if sdid.eq_ignore_ascii_case(from_domain) => 0,
        Some(sdid) if from_domain.ends_with(&format!(".{}", sdid)) => 1,
        _ => 2,
    }
}

/// Convenience constructor wiring a [`KeyStore`] in "off" mode with a given
/// resolver, for callers that do not need caching (e.g. one-shot checks).
pub fn bare_keystore() -> Result<Arc<KeyStore>, DKIMError> {
    Ok(Arc::new(KeyStore::open(
        ":memory:",
        crate::keystore::KeyStoreMode::Off,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::TestResolver;
    use crate::keystore::{KeyStore, KeyStoreMode};

    fn rfc6376_message() -> &'static str {
        "DKIM-Signature: v=1; a=rsa-sha256; c=relaxed/relaxed;\r\n        d=example.com; s=brisbane;\r\n        h=Received : From : To : Subject : Date : Message-ID;\r\n        bh=2jUSOH9NhtVGCQWNr9BrIAPreKQjO6Sn7XIkfJVOzv8=;\r\n        b=AuUoFEfDxTDkHlLXSZEpZj79LICEps6eda7W3deTVFOk4yAUoqOB\r\n        4nujc7YopdG5dWLSdNg6xNAZpOPr+kHxt1IrE+NahM6L/LbvaHut\r\n        KVdkLLkpVaVVQPzeRDI009SO2Il5Lu7rDNH6mZckBdrIx0orEtZV\r\n        4bmp/YzhwvcubU4=;\r\nFrom: Joe SixPack <joe@football.example.com>\r\nTo: Suzie Q <suzie@shopping.example.net>\r\nSubject: Is this a test?\r\nDate: Fri, 11 Jul 2003 21:00:37 -0700\r\nMessage-ID: <20030712040037.46341.5F8J@football.example.com>\r\n\r\nHi.\r\n\r\nWe lost the game. Are you hungry yet?\r\n\r\nJoe\r\n"
    }

    #[tokio::test]
    async fn test_verify_rfc6376_example_fails_without_key() {
        let keystore = KeyStore::open(":memory:", KeyStoreMode::Off).unwrap();
        let resolver = TestResolver::new().with_nxdomain("brisbane._domainkey.example.com");
        let (_msg, results) = verify_message(
            rfc6376_message().as_bytes(),
            &keystore,
            &resolver,
            &VerifyPolicy::default(),
            1_000_000_000,
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0].result,
            SignatureResult::PermFail { .. }
        ));
    }

    #[tokio::test]
    async fn test_sort_signatures_success_first() {
        let mut sigs = vec![
            VerifiedSignature {
                result: SignatureResult::PermFail {
                    error_kind: "x",
                    context: "x".into(),
                    hidefail: false,
                },
                header_index: 0,
            },
            VerifiedSignature {
                result: SignatureResult::Success {
                    sdid: "example.com".into(),
                    auid: "@example.com".into(),
                    selector: "s".into(),
                    algorithm_signature: "rsa",
                    algorithm_hash: HashAlgo::RsaSha256,
                    key_length: Some(2048),
                    timestamp: None,
                    expiration: None,
                    signed_headers: vec![],
                    key_secure: false,
                    warnings: vec![],
                },
                header_index: 1,
            },
        ];
        sort_signatures(&mut sigs, "example.com");
        assert!(sigs[0].result.is_success());
    }
}
