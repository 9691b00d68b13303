/// Transient vs. permanent classification of a [`DKIMError`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    Permfail,
    Tempfail,
}

quick_error! {
    #[derive(Debug, PartialEq, Clone)]
    /// Stable, localizable error kinds produced while verifying one signature
    /// or splitting one message. Every variant name is the stable identifier
    /// referenced by the display layer.
    pub enum DKIMError {
        // --- whole-message errors -------------------------------------
        Malformed(err: String) {
            display("malformed message: {}", err)
        }

        // --- transient ---------------------------------------------------
        DnsTimeout {
            display("DNS query timed out")
        }
        DnsServerError(rcode: u8) {
            display("DNS server error (rcode {})", rcode)
        }
        DnssecBogus {
            display("DNSSEC validation failed (bogus)")
        }
        DbUnavailable(err: String) {
            display("key database unavailable: {}", err)
        }

        // --- permanent signature errors ------------------------------
        IllformedTagList(err: String) {
            display("ill-formed tag list: {}", err)
        }
        MissingRequiredTag(name: &'static str) {
            display("signature missing required tag ({})", name)
        }
        UnsupportedVersion {
            display("unsupported DKIM-Signature version")
        }
        UnsupportedAlgorithm(value: String) {
            display("unsupported signature algorithm: {}", value)
        }
        InsecureAlgorithm(value: String) {
            display("insecure signature algorithm: {}", value)
        }
        UnsupportedCanonicalization(value: String) {
            display("unsupported canonicalization: {}", value)
        }
        BadSignature {
            display("signature did not verify")
        }
        CorruptBodyHash {
            display("body hash did not verify")
        }
        MissingFromSigned {
            display("From header is not covered by h=")
        }
        SubdomainIWithSFlag {
            display("i= is a subdomain of d= but key has the s= strict flag")
        }
        DomainMismatchI {
            display("i= is not d= or a subdomain of d=")
        }
        ExpiredBeforeTimestamp {
            display("x= is not after t=")
        }
        TooLargeL {
            display("l= is larger than the actual body length")
        }
        UnacceptableSignatureHeader {
            display("DKIM-Signature header is not itself covered by h=")
        }
        UnsupportedQueryMethod {
            display("q= does not contain dns/txt")
        }

        // --- permanent key errors -------------------------------------
        NoKey {
            display("no key found for signature")
        }
        KeyRevoked {
            display("key has been revoked (empty p=)")
        }
        KeyNotEmail {
            display("key s= does not permit the email service type")
        }
        KeyDecode(err: String) {
            display("failed to decode public key: {}", err)
        }
        KeyIncompatibleVersion {
            display("key v= is not DKIM1")
        }
        UnknownKeyType(value: String) {
            display("unknown key type: {}", value)
        }
        HashNotAllowed {
            display("key h= does not permit this hash algorithm")
        }
        KeyTestMode {
            display("key is in testing mode (t=y)")
        }

        // --- policy errors ---------------------------------------------
        WrongSdid(expected: Vec<String>) {
            display("no valid signature from expected sdid(s): {}", expected.join(", "))
        }
        MissingSig(expected: Vec<String>) {
            display("message should have been signed by: {}", expected.join(", "))
        }
        KeyMismatch {
            display("fetched key does not match the cached key (compare-and-alert)")
        }

        // --- ARH ----------------------------------------------------------
        IllformedArh(err: String) {
            display("ill-formed Authentication-Results header: {}", err)
        }

        // --- internal / IO -------------------------------------------
        KeyUnavailable(err: String) {
            display("key unavailable: {}", err)
        }
        UnknownInternalError(err: String) {
            display("internal error: {}", err)
        }
    }
}

impl DKIMError {
    pub fn status(&self) -> Status {
        use DKIMError::*;
        match self {
            DnsTimeout | DnsServerError(_) | DnssecBogus | DbUnavailable(_) | KeyUnavailable(_)
            | UnknownInternalError(_) => Status::Tempfail,
            _ => Status::Permfail,
        }
    }

    /// The stable identifier used by the display layer for localization,
    /// independent of the `Display` message (which may carry context).
    pub fn kind(&self) -> &'static str {
        use DKIMError::*;
        match self {
            Malformed(_) => "Malformed",
            DnsTimeout => "DnsTimeout",
            DnsServerError(_) => "DnsServerError",
            DnssecBogus => "DnssecBogus",
            DbUnavailable(_) => "DbUnavailable",
            IllformedTagList(_) => "IllformedTagList",
            MissingRequiredTag(_) => "MissingRequiredTag",
            UnsupportedVersion => "UnsupportedVersion",
            UnsupportedAlgorithm(_) => "UnsupportedAlgorithm",
            InsecureAlgorithm(_) => "InsecureAlgorithm",
            UnsupportedCanonicalization(_) => "UnsupportedCanonicalization",
            BadSignature => "BadSignature",
            CorruptBodyHash => "CorruptBodyHash",
            MissingFromSigned => "MissingFromSigned",
            SubdomainIWithSFlag => "SubdomainIWithSFlag",
            DomainMismatchI => "DomainMismatchI",
            ExpiredBeforeTimestamp => "ExpiredBeforeTimestamp",
            TooLargeL => "TooLargeL",
            UnacceptableSignatureHeader => "UnacceptableSignatureHeader",
            UnsupportedQueryMethod => "UnsupportedQueryMethod",
            NoKey => "NoKey",
            KeyRevoked => "KeyRevoked",
            KeyNotEmail => "KeyNotEmail",
            KeyDecode(_) => "KeyDecode",
            KeyIncompatibleVersion => "KeyIncompatibleVersion",
            UnknownKeyType(_) => "UnknownKeyType",
            HashNotAllowed => "HashNotAllowed",
            KeyTestMode => "KeyTestMode",
            WrongSdid(_) => "WrongSdid",
            MissingSig(_) => "MissingSig",
            KeyMismatch => "KeyMismatch",
            IllformedArh(_) => "IllformedArh",
            KeyUnavailable(_) => "KeyUnavailable",
            UnknownInternalError(_) => "UnknownInternalError",
        }
    }
}

/// Non-fatal conditions attached to an otherwise-successful [`crate::result::SignatureResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    PartialBodySigned,
    SignatureExpired,
    SignatureFuture,
    KeySmall(u32),
    FromNotInSdid,
    FromNotInAuid,
    InsecureAlgorithm(&'static str),
    HeaderLineTooLong,
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PartialBodySigned => write!(f, "only part of the body is signed (l=)"),
            Self::SignatureExpired => write!(f, "signature has expired"),
            Self::SignatureFuture => write!(f, "signature timestamp is in the future"),
            Self::KeySmall(bits) => write!(f, "key is smaller than recommended ({} bits)", bits),
            Self::FromNotInSdid => write!(f, "From address is not in the sdid"),
            Self::FromNotInAuid => write!(f, "From address is not in the auid"),
            Self::InsecureAlgorithm(name) => write!(f, "insecure algorithm: {}", name),
            Self::HeaderLineTooLong => write!(f, "header line exceeds 998 octets"),
        }
    }
}
