//! Per-signature and per-message result shapes (spec §3).

use crate::crypto::HashAlgo;
use crate::errors::{DKIMError, Status};
use crate::Warning;

/// Outcome of verifying a single `DKIM-Signature:` header.
#[derive(Debug, Clone)]
pub enum SignatureResult {
    Success {
        sdid: String,
        auid: String,
        selector: String,
        algorithm_signature: &'static str,
        algorithm_hash: HashAlgo,
        key_length: Option<u32>,
        timestamp: Option<i64>,
        expiration: Option<i64>,
        signed_headers: Vec<String>,
        key_secure: bool,
        warnings: Vec<Warning>,
    },
    TempFail {
        error_kind: &'static str,
        context: String,
    },
    PermFail {
        error_kind: &'static str,
        context: String,
        hidefail: bool,
    },
    None,
}

impl SignatureResult {
    pub fn from_error(err: DKIMError) -> Self {
        let error_kind = err.kind();
        let context = err.to_string();
        match err.status() {
            Status::Tempfail => Self::TempFail {
                error_kind,
                context,
            },
            Status::Permfail => Self::PermFail {
                error_kind,
                context,
                hidefail: false,
            },
        }
    }

    pub fn summary(&self) -> &'static str {
        match self {
            Self::Success { .. } => "pass",
            Self::TempFail { .. } => "temperror",
            Self::PermFail { hidefail: true, .. } => "neutral",
            Self::PermFail { .. } => "fail",
            Self::None => "none",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn sdid(&self) -> Option<&str> {
        match self {
            Self::Success { sdid, .. } => Some(sdid),
            _ => None,
        }
    }

    /// The numeric `PresentationSignature` result class (spec §3).
    pub fn result_class(&self) -> u32 {
        match self {
            Self::Success { .. } => 10,
            Self::TempFail { .. } => 20,
            Self::PermFail {
                hidefail: false, ..
            } => 30,
            Self::PermFail { hidefail: true, .. } => 35,
            Self::None => 40,
        }
    }
}

/// A signature result annotated for display, plus provenance when it came
/// from (or was cross-checked against) a trusted ARH entry.
#[derive(Debug, Clone)]
pub struct PresentationSignature {
    pub result: SignatureResult,
    pub result_class: u32,
    pub verified_by: Option<String>,
}

impl PresentationSignature {
    pub fn new(result: SignatureResult) -> Self {
        let result_class = result.result_class();
        Self {
            result,
            result_class,
            verified_by: None,
        }
    }

    pub fn with_verified_by(mut self, authserv_id: impl Into<String>) -> Self {
        self.verified_by = Some(authserv_id.into());
        self
    }
}
