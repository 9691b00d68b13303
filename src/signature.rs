//! DKIM-Signature tag-value parser and validator (RFC 6376 §3.5, §6.1.1).

use crate::canonicalization::Type as CanonType;
use crate::crypto::HashAlgo;
use crate::parser::{self, Tag};
use crate::DKIMError;

/// Canonical name of the header this crate verifies.
pub const HEADER: &str = "DKIM-Signature";

/// A validated `DKIM-Signature:` header value (spec §3 `DkimSignature`).
#[derive(Debug, Clone)]
pub struct DkimSignature {
    pub algorithm_signature: &'static str,
    pub algorithm_hash: HashAlgo,
    pub sdid: String,
    pub auid: String,
    pub selector: String,
    pub signed_headers: Vec<String>,
    pub canon_header: CanonType,
    pub canon_body: CanonType,
    pub body_hash: String,
    pub signature: Vec<u8>,
    pub body_length: Option<u64>,
    pub timestamp: Option<i64>,
    pub expiration: Option<i64>,
    pub query_methods_present: bool,
    /// Raw header value exactly as it appeared (used to reconstruct the
    /// "zero-b" form for header hashing).
    raw_value: String,
    /// Raw (unparsed) value of the `b=` tag, including any internal FWS.
    raw_b: String,
}

impl DkimSignature {
    /// Parses and validates a `DKIM-Signature:` header value. `raw_value` is
    /// the bytes between the header name's `:` and the terminating CRLF,
    /// with folding CRLFs preserved (as produced by [`crate::message`]).
    pub fn parse(raw_value: &[u8]) -> Result<Self, DKIMError> {
        let raw_value_str = String::from_utf8_lossy(raw_value).into_owned();
        let tags = parser::parse_unique_tag_list(&raw_value_str)?;

        let mut map = std::collections::HashMap::new();
        for t in &tags {
            map.insert(t.name.as_str(), t);
        }

        let required = |name: &'static str| -> Result<&Tag, DKIMError> {
            map.get(name)
                .copied()
                .ok_or(DKIMError::MissingRequiredTag(name))
        };

        let v = required("v")?;
        if v.value != "1" {
            return Err(DKIMError::UnsupportedVersion);
        }

        let a = required("a")?;
        let algorithm_hash = parser::parse_hash_algo(&a.value)?;
        let algorithm_signature = algorithm_hash.signature_algo_name();

        let b = required("b")?;
        let signature = crate::crypto::base64_decode(&b.value)?;

        let bh = required("bh")?;
        let body_hash = bh.value.clone();

        let d = required("d")?;
        let sdid = d.value.to_lowercase();

        let h = required("h")?;
        let signed_headers: Vec<String> = h.value.split(':').map(|s| s.trim().to_string()).collect();
        if !signed_headers
            .iter()
            .any(|name| name.eq_ignore_ascii_case("from"))
        {
            return Err(DKIMError::MissingFromSigned);
        }

        let s = required("s")?;
        let selector = s.value.clone();

        let auid = match map.get("i") {
            Some(i) => i.value.clone(),
            None => format!("@{}", sdid),
        };
        validate_auid(&auid, &sdid)?;

        let (canon_header, canon_body) = parser::parse_canonicalization(
            map.get("c").map(|t| t.value.as_str()),
        )?;

        let body_length = match map.get("l") {
            Some(t) => Some(
                t.value
                    .parse::<u64>()
                    .map_err(|_| DKIMError::IllformedTagList("l= is not a non-negative integer".into()))?,
            ),
            None => None,
        };

        let timestamp = match map.get("t") {
            Some(t) => Some(
                t.value
                    .parse::<i64>()
                    .map_err(|_| DKIMError::IllformedTagList("t= is not an integer".into()))?,
            ),
            None => None,
        };
        let expiration = match map.get("x") {
            Some(t) => Some(
                t.value
                    .parse::<i64>()
                    .map_err(|_| DKIMError::IllformedTagList("x= is not an integer".into()))?,
            ),
            None => None,
        };
        if let (Some(ts), Some(exp)) = (timestamp, expiration) {
            if exp <= ts {
                return Err(DKIMError::ExpiredBeforeTimestamp);
            }
        }

        let query_methods_present = match map.get("q") {
            Some(t) => {
                let methods: Vec<&str> = t.value.split(':').collect();
                if !methods.contains(&"dns/txt") {
                    return Err(DKIMError::UnsupportedQueryMethod);
                }
                true
            }
            None => false,
        };

        let raw_b = b.raw_value.clone();

        Ok(DkimSignature {
            algorithm_signature,
            algorithm_hash,
            sdid,
            auid,
            selector,
            signed_headers,
            canon_header,
            canon_body,
            body_hash,
            signature,
            body_length,
            timestamp,
            expiration,
            query_methods_present,
            raw_value: raw_value_str,
            raw_b,
        })
    }

    /// Reconstructs the header value with `b=`'s value stripped, per the
    /// "zero-b" interpretation documented in DESIGN.md: only the tag's
    /// value is removed, not the surrounding FWS or the tag name itself.
    pub fn zero_b_header_value(&self) -> String {
        self.raw_value.replacen(&self.raw_b, "", 1)
    }
}

fn validate_auid(auid: &str, sdid: &str) -> Result<(), DKIMError> {
    let domain_part = auid
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .unwrap_or(auid);
    let domain_part = domain_part.to_lowercase();
    if domain_part == *sdid || domain_part.ends_with(&format!(".{}", sdid)) {
        Ok(())
    } else {
        Err(DKIMError::DomainMismatchI)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(raw: &str) -> DkimSignature {
        DkimSignature::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_minimal() {
        let s = sig("v=1; a=rsa-sha256; q=dns/txt; c=relaxed/relaxed; s=smtp; d=test.com; t=1641506955; h=content-type:to: subject:date:from:mime-version:sender; bh=PU2XIErWsXvhvt1W96ntPWZ2VImjVZ3vBY2T/A+wA3A=; b=PIO0A014nyntOGKdTdtvCJor9ZxvP1M3hoLeEh8HqZ+RvAyEKdAc7VOg+/g/OTaZgsmw6U sZCoN0YNVp+2o9nkaeUslsVz3M4I55HcZnarxl+fhplIMcJ/3s0nIhXL51MfGPRqPbB7/M Gjg9/07/2vFoid6Kitg6Z+CfoD2wlSRa8xDfmeyA2cHpeVuGQhGxu7BXuU8kGbeM4+weit Ql3t9zalhikEPI5Pr7dzYFrgWNOEO6w6rQfG7niKON1BimjdbJlGanC7cO4UL361hhXT4X iXLnC9TG39xKFPT/+4nkHy8pp6YvWkD3wKlBjwkYNm0JvKGwTskCMDeTwxXhAg==");
        assert_eq!(s.sdid, "test.com");
        assert_eq!(s.selector, "smtp");
        assert_eq!(s.auid, "@test.com");
        assert_eq!(s.canon_header, CanonType::Relaxed);
    }

    #[test]
    fn test_missing_required_tag() {
        let err = DkimSignature::parse(b"v=1; a=rsa-sha256").unwrap_err();
        assert!(matches!(err, DKIMError::MissingRequiredTag(_)));
    }

    #[test]
    fn test_from_not_signed() {
        let raw = "v=1; a=rsa-sha256; d=test.com; s=smtp; h=to:subject; bh=AAAA; b=AAAA";
        let err = DkimSignature::parse(raw.as_bytes()).unwrap_err();
        assert_eq!(err, DKIMError::MissingFromSigned);
    }

    #[test]
    fn test_expired_before_timestamp() {
        let raw = "v=1; a=rsa-sha256; d=test.com; s=smtp; h=from; bh=AAAA; b=AAAA; t=100; x=50";
        let err = DkimSignature::parse(raw.as_bytes()).unwrap_err();
        assert_eq!(err, DKIMError::ExpiredBeforeTimestamp);
    }

    #[test]
    fn test_auid_must_be_subdomain_of_sdid() {
        let raw = "v=1; a=rsa-sha256; d=test.com; s=smtp; h=from; bh=AAAA; b=AAAA; i=@evil.com";
        let err = DkimSignature::parse(raw.as_bytes()).unwrap_err();
        assert_eq!(err, DKIMError::DomainMismatchI);
    }

    #[test]
    fn test_zero_b_strips_only_value() {
        let raw = "v=1; a=rsa-sha256; d=test.com; s=smtp; h=from; bh=AAAA; b=AA\r\n BB";
        let s = sig(raw);
        assert_eq!(
            s.zero_b_header_value(),
            "v=1; a=rsa-sha256; d=test.com; s=smtp; h=from; bh=AAAA; b="
        );
    }
}
