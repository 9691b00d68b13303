//! Result aggregator (C12, spec §4.10): merges verifier output, trusted ARH,
//! and the sign-rules overlay into one [`MessageVerdict`], persisted keyed
//! by message identity. New module; no teacher analog.

use crate::arh::{AuthenticationResults, IntegrationMode, ResInfo};
use crate::crypto::HashAlgo;
use crate::result::{PresentationSignature, SignatureResult};
use crate::signrules::RuleVerdict;
use crate::verify::TreatAs;
use crate::DKIMError;
use rusqlite::{params, Connection};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct MessageVerdict {
    pub version: u32,
    pub dkim: Vec<PresentationSignature>,
    pub bimi_indicator: Option<Vec<u8>>,
}

/// Whether persistence is allowed for a set of per-signature results:
/// suppressed entirely if any signature is `TempFail` (spec §3, §8).
fn may_persist(dkim: &[PresentationSignature]) -> bool {
    !dkim
        .iter()
        .any(|s| matches!(s.result, SignatureResult::TempFail { .. }))
}

/// Merges verifier output with the sign-rules "should be signed" verdict,
/// producing the synthetic `WrongSdid`/`MissingSig` entry spec §4.9 requires
/// when no valid signature covers the required set: `WrongSdid` when the
/// message carries at least one otherwise-valid signature (just not from a
/// required sdid), `MissingSig` when it carries none at all.
pub fn apply_sign_rules(
    mut dkim: Vec<PresentationSignature>,
    rules: &RuleVerdict,
) -> Vec<PresentationSignature> {
    let missing: Vec<String> = {
        let satisfied: std::collections::HashSet<&str> = dkim
            .iter()
            .filter(|s| s.result.is_success())
            .filter_map(|s| s.result.sdid())
            .collect();
        rules
            .required_sdids
            .iter()
            .filter(|sdid| !satisfied.contains(sdid.as_str()))
            .cloned()
            .collect()
    };

    if !missing.is_empty() {
        let has_valid_signature = dkim.iter().any(|s| s.result.is_success());
        let (error_kind, context) = if has_valid_signature {
            (
                "WrongSdid",
                format!("no valid signature from expected sdid(s): {}", missing.join(", ")),
            )
        } else {
            (
                "MissingSig",
                format!("message should have been signed by: {}", missing.join(", ")),
            )
        };
        dkim.push(PresentationSignature::new(SignatureResult::PermFail {
            error_kind,
            context,
            hidefail: false,
        }));
    }

    for sig in dkim.iter_mut() {
        if let Some(sdid) = sig.result.sdid() {
            if rules.hidefail_sdids.contains(sdid)
                && matches!(sig.result, SignatureResult::PermFail { .. })
            {
                if let SignatureResult::PermFail { hidefail, .. } = &mut sig.result {
                    *hidefail = true;
                }
                sig.result_class = sig.result.result_class();
            }
        }
    }

    dkim
}

/// Integrates a trusted ARH (spec §4.8) into the local verdict under the
/// given policy. In `Replace` mode the ARH DKIM results become authoritative:
/// the returned list is built entirely from the ARH's `dkim` resinfo
/// entries, with local SDID/AUID/From-alignment sanity and rsa-sha1 policy
/// re-applied to each reported `pass` (a failure demotes it to `PermFail`
/// and annotates `verifiedBy` with both sources).
pub fn integrate_arh(
    dkim: Vec<PresentationSignature>,
    trusted: &[AuthenticationResults],
    mode: IntegrationMode,
    from_domain: &str,
    rsa_sha1_treat_as: TreatAs,
) -> Vec<PresentationSignature> {
    match mode {
        IntegrationMode::Augment => dkim,
        IntegrationMode::Replace => trusted
            .iter()
            .flat_map(|ar| {
                ar.resinfo
                    .iter()
                    .filter(|r| r.method == "dkim")
                    .map(move |r| replace_entry(ar, r, from_domain, rsa_sha1_treat_as))
            })
            .collect(),
    }
}

/// Builds one `PresentationSignature` from a trusted ARH's `dkim` resinfo
/// entry, sanity-checking `pass` results before accepting them (spec §4.8).
fn replace_entry(
    ar: &AuthenticationResults,
    r: &ResInfo,
    from_domain: &str,
    rsa_sha1_treat_as: TreatAs,
) -> PresentationSignature {
    if r.result != "pass" {
        return PresentationSignature::new(arh_result_to_signature_result(r))
            .with_verified_by(ar.authserv_id.clone());
    }

    let sdid = r.property("header", "d").unwrap_or("");
    let auid = r.property("header", "i");
    let algo = r.property("header", "a").and_then(HashAlgo::from_algo_name);

    if let Some(error_kind) = replace_sanity_failure(sdid, auid, algo, from_domain, rsa_sha1_treat_as)
    {
        return PresentationSignature::new(SignatureResult::PermFail {
            error_kind,
            context: format!(
                "ARH pass from {} failed local sanity check ({})",
                ar.authserv_id, error_kind
            ),
            hidefail: false,
        })
        .with_verified_by(format!("{}, local", ar.authserv_id));
    }

    let algo = algo.unwrap_or(HashAlgo::RsaSha256);
    PresentationSignature::new(SignatureResult::Success {
        sdid: sdid.to_string(),
        auid: auid.unwrap_or(sdid).to_string(),
        selector: r.property("header", "s").unwrap_or("").to_string(),
        algorithm_signature: algo.signature_algo_name(),
        algorithm_hash: algo,
        key_length: None,
        timestamp: None,
        expiration: None,
        signed_headers: vec![],
        key_secure: false,
        warnings: vec![],
    })
    .with_verified_by(ar.authserv_id.clone())
}

/// SDID/AUID/From-alignment sanity and rsa-sha1 policy re-applied to an ARH
/// `pass` before it is locally trusted; returns the stable error kind of the
/// first check that fails.
fn replace_sanity_failure(
    sdid: &str,
    auid: Option<&str>,
    algo: Option<HashAlgo>,
    from_domain: &str,
    rsa_sha1_treat_as: TreatAs,
) -> Option<&'static str> {
    if sdid.is_empty() {
        return Some("NoKey");
    }
    if !domain_aligned(sdid, from_domain) {
        return Some("DomainMismatchI");
    }
    if let Some(auid) = auid {
        let auid_domain = auid.rsplit_once('@').map(|(_, d)| d).unwrap_or(auid);
        if !domain_aligned(sdid, auid_domain) {
            return Some("DomainMismatchI");
        }
    }
    if algo == Some(HashAlgo::RsaSha1) && rsa_sha1_treat_as == TreatAs::Error {
        return Some("InsecureAlgorithm");
    }
    None
}

/// `sdid` equals `domain`, or is a parent domain of it.
fn domain_aligned(sdid: &str, domain: &str) -> bool {
    sdid.eq_ignore_ascii_case(domain) || domain.to_lowercase().ends_with(&format!(".{}", sdid.to_lowercase()))
}

fn arh_result_to_signature_result(r: &ResInfo) -> SignatureResult {
    match r.result.as_str() {
        "none" => SignatureResult::None,
        "neutral" => SignatureResult::PermFail {
            error_kind: "ArhNeutral",
            context: "ARH reported dkim=neutral".to_string(),
            hidefail: true,
        },
        "temperror" => SignatureResult::TempFail {
            error_kind: "ArhTempError",
            context: "ARH reported dkim=temperror".to_string(),
        },
        other => SignatureResult::PermFail {
            error_kind: "ArhPermError",
            context: format!("ARH reported dkim={}", other),
            hidefail: false,
        },
    }
}

/// Builds the final verdict for one message; the host is responsible for
/// calling [`VerdictStore::save`] with the result unless the message is
/// external (drag-drop) or any signature is `TempFail`.
pub fn aggregate(
    dkim: Vec<PresentationSignature>,
    bimi_indicator: Option<Vec<u8>>,
) -> MessageVerdict {
    MessageVerdict {
        version: 1,
        dkim,
        bimi_indicator,
    }
}

/// Per-message verdict persistence, keyed by the host's opaque message id.
pub struct VerdictStore {
    conn: Mutex<Connection>,
}

impl VerdictStore {
    pub fn open(path: &str) -> Result<Self, DKIMError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|err| DKIMError::DbUnavailable(err.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS verdicts (
                message_id TEXT PRIMARY KEY,
                summary TEXT NOT NULL
            );",
        )
        .map_err(|err| DKIMError::DbUnavailable(err.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persists the verdict summary for `message_id`, unless suppressed by
    /// a `TempFail` among its signatures.
    pub fn save(&self, message_id: &str, verdict: &MessageVerdict) -> Result<bool, DKIMError> {
        if !may_persist(&verdict.dkim) {
            return Ok(false);
        }
        let summary: Vec<&str> = verdict.dkim.iter().map(|s| s.result.summary()).collect();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO verdicts (message_id, summary) VALUES (?1, ?2)
             ON CONFLICT(message_id) DO UPDATE SET summary = excluded.summary",
            params![message_id, summary.join(",")],
        )
        .map_err(|err| DKIMError::DbUnavailable(err.to_string()))?;
        Ok(true)
    }

    pub fn reset(&self, message_id: &str) -> Result<(), DKIMError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM verdicts WHERE message_id = ?1",
            params![message_id],
        )
        .map_err(|err| DKIMError::DbUnavailable(err.to_string()))?;
        Ok(())
    }

    pub fn get_summary(&self, message_id: &str) -> Result<Option<String>, DKIMError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT summary FROM verdicts WHERE message_id = ?1",
            params![message_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            err => Err(DKIMError::DbUnavailable(err.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::SignatureResult;
    use std::collections::HashSet;

    fn success(sdid: &str) -> PresentationSignature {
        PresentationSignature::new(SignatureResult::Success {
            sdid: sdid.to_string(),
            auid: format!("@{}", sdid),
            selector: "s".to_string(),
            algorithm_signature: "rsa",
            algorithm_hash: crate::crypto::HashAlgo::RsaSha256,
            key_length: Some(2048),
            timestamp: None,
            expiration: None,
            signed_headers: vec![],
            key_secure: false,
            warnings: vec![],
        })
    }

    #[test]
    fn test_missing_sig_synthesized() {
        let mut required = HashSet::new();
        required.insert("example.com".to_string());
        let rules = RuleVerdict {
            required_sdids: required,
            hidefail_sdids: HashSet::new(),
        };
        let dkim = apply_sign_rules(vec![], &rules);
        assert_eq!(dkim.len(), 1);
        assert!(matches!(dkim[0].result, SignatureResult::PermFail { .. }));
    }

    #[test]
    fn test_missing_sig_not_synthesized_when_satisfied() {
        let mut required = HashSet::new();
        required.insert("example.com".to_string());
        let rules = RuleVerdict {
            required_sdids: required,
            hidefail_sdids: HashSet::new(),
        };
        let dkim = apply_sign_rules(vec![success("example.com")], &rules);
        assert_eq!(dkim.len(), 1);
        assert!(dkim[0].result.is_success());
    }

    #[test]
    fn test_wrong_sdid_when_other_valid_signature_present() {
        let mut required = HashSet::new();
        required.insert("example.com".to_string());
        let rules = RuleVerdict {
            required_sdids: required,
            hidefail_sdids: HashSet::new(),
        };
        let dkim = apply_sign_rules(vec![success("other.com")], &rules);
        assert_eq!(dkim.len(), 2);
        match &dkim[1].result {
            SignatureResult::PermFail { error_kind, .. } => assert_eq!(*error_kind, "WrongSdid"),
            other => panic!("expected WrongSdid PermFail, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_sig_when_no_valid_signature_present() {
        let mut required = HashSet::new();
        required.insert("example.com".to_string());
        let rules = RuleVerdict {
            required_sdids: required,
            hidefail_sdids: HashSet::new(),
        };
        let dkim = apply_sign_rules(vec![], &rules);
        assert_eq!(dkim.len(), 1);
        match &dkim[0].result {
            SignatureResult::PermFail { error_kind, .. } => assert_eq!(*error_kind, "MissingSig"),
            other => panic!("expected MissingSig PermFail, got {:?}", other),
        }
    }

    #[test]
    fn test_replace_mode_synthesizes_success_from_arh_pass() {
        let ar = crate::arh::parse("mx.example.com; dkim=pass header.d=example.com header.s=brisbane")
            .unwrap();
        let dkim = integrate_arh(
            vec![],
            &[ar],
            IntegrationMode::Replace,
            "example.com",
            TreatAs::Warning,
        );
        assert_eq!(dkim.len(), 1);
        assert!(dkim[0].result.is_success());
        assert_eq!(dkim[0].verified_by.as_deref(), Some("mx.example.com"));
    }

    #[test]
    fn test_replace_mode_demotes_misaligned_sdid() {
        let ar = crate::arh::parse("mx.example.com; dkim=pass header.d=evil.com").unwrap();
        let dkim = integrate_arh(
            vec![],
            &[ar],
            IntegrationMode::Replace,
            "example.com",
            TreatAs::Warning,
        );
        assert_eq!(dkim.len(), 1);
        assert!(matches!(dkim[0].result, SignatureResult::PermFail { .. }));
        assert!(dkim[0].verified_by.as_deref().unwrap().contains("local"));
    }

    #[test]
    fn test_augment_mode_leaves_local_results_untouched() {
        let ar = crate::arh::parse("mx.example.com; dkim=pass header.d=example.com").unwrap();
        let dkim = integrate_arh(
            vec![success("example.com")],
            &[ar],
            IntegrationMode::Augment,
            "example.com",
            TreatAs::Warning,
        );
        assert_eq!(dkim.len(), 1);
        assert_eq!(dkim[0].verified_by, None);
    }

    #[test]
    fn test_tempfail_suppresses_persistence() {
        let store = VerdictStore::open(":memory:").unwrap();
        let verdict = MessageVerdict {
            version: 1,
            dkim: vec![PresentationSignature::new(SignatureResult::TempFail {
                error_kind: "DnsTimeout",
                context: "timeout".to_string(),
            })],
            bimi_indicator: None,
        };
        let saved = store.save("msg-1", &verdict).unwrap();
        assert!(!saved);
        assert_eq!(store.get_summary("msg-1").unwrap(), None);
    }

    #[test]
    fn test_persist_and_reset() {
        let store = VerdictStore::open(":memory:").unwrap();
        let verdict = MessageVerdict {
            version: 1,
            dkim: vec![success("example.com")],
            bimi_indicator: None,
        };
        store.save("msg-2", &verdict).unwrap();
        assert_eq!(store.get_summary("msg-2").unwrap(), Some("pass".to_string()));
        store.reset("msg-2").unwrap();
        assert_eq!(store.get_summary("msg-2").unwrap(), None);
    }
}
