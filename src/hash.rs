//! Canonicalization + hashing glue (RFC 6376 §3.7): computes the body hash
//! and the signed-headers hash given a parsed [`Message`] and a [`DkimSignature`].

use crate::canonicalization;
use crate::crypto::{base64_encode, HashAlgo};
use crate::message::Message;
use crate::signature::{DkimSignature, HEADER};
use crate::DKIMError;
use sha1::Sha1;
use sha2::Sha256;
use std::collections::HashMap;

pub(crate) struct LimitHasher {
    pub limit: usize,
    pub hashed: usize,
    pub hasher: HashImpl,
}

impl LimitHasher {
    pub fn hash(&mut self, bytes: &[u8]) {
        let remain = self.limit.saturating_sub(self.hashed);
        let len = bytes.len().min(remain);
        self.hasher.hash(&bytes[..len]);
        self.hashed += len;
    }

    pub fn finalize(self) -> String {
        self.hasher.finalize()
    }

    #[cfg(test)]
    pub fn finalize_bytes(self) -> Vec<u8> {
        self.hasher.finalize_bytes()
    }
}

pub(crate) enum HashImpl {
    Sha1(Sha1),
    Sha256(Sha256),
    #[cfg(test)]
    Copy(Vec<u8>),
}

impl HashImpl {
    pub fn from_algo(algo: HashAlgo) -> Self {
        use sha1::Digest as _;
        match algo {
            HashAlgo::RsaSha1 => Self::Sha1(Sha1::new()),
            HashAlgo::RsaSha256 | HashAlgo::Ed25519Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    #[cfg(test)]
    pub fn copy_data() -> Self {
        Self::Copy(vec![])
    }

    pub fn hash(&mut self, bytes: &[u8]) {
        use sha1::Digest as _;
        match self {
            Self::Sha1(hasher) => hasher.update(bytes),
            Self::Sha256(hasher) => hasher.update(bytes),
            #[cfg(test)]
            Self::Copy(data) => data.extend_from_slice(bytes),
        }
    }

    pub fn finalize(self) -> String {
        use sha1::Digest as _;
        match self {
            Self::Sha1(hasher) => base64_encode(&hasher.finalize()),
            Self::Sha256(hasher) => base64_encode(&hasher.finalize()),
            #[cfg(test)]
            Self::Copy(data) => String::from_utf8_lossy(&data).into(),
        }
    }

    pub fn finalize_bytes(self) -> Vec<u8> {
        use sha1::Digest as _;
        match self {
            Self::Sha1(hasher) => hasher.finalize().to_vec(),
            Self::Sha256(hasher) => hasher.finalize().to_vec(),
            #[cfg(test)]
            Self::Copy(data) => data,
        }
    }
}

/// Returns the base64-encoded hash of the message body, bounded to `length`
/// octets if given (the `l=` tag). Returns the actual canonicalized body
/// length alongside so callers can enforce `TooLargeL`.
pub(crate) fn compute_body_hash(
    canonicalization_type: canonicalization::Type,
    length: Option<u64>,
    hash_algo: HashAlgo,
    message: &Message,
) -> Result<(String, usize), DKIMError> {
    let body = message.get_body_bytes();

    let limit = match length {
        Some(length) => length as usize,
        None => usize::MAX,
    };

    let mut hasher = LimitHasher {
        hasher: HashImpl::from_algo(hash_algo),
        limit,
        hashed: 0,
    };

    canonicalization_type.canon_body(body, &mut hasher);
    let hashed = hasher.hashed;
    Ok((hasher.finalize(), hashed))
}

/// Selects the headers to hash in `h=` order, consuming the *last*
/// occurrence of a repeated name first and working upward for further
/// repeats of that name (RFC 6376 §5.4.2).
pub(crate) fn select_headers<'a>(
    signed_headers: &[String],
    message: &'a Message,
) -> Vec<(String, &'a [u8])> {
    let mut signed = vec![];

    let email_headers = message.get_headers();
    let num_headers = email_headers.len();
    let mut last_index: HashMap<&str, usize> = HashMap::new();

    'outer: for name in signed_headers {
        let index = *last_index.get(name.as_str()).unwrap_or(&num_headers);
        for (header_index, header) in email_headers
            .iter()
            .enumerate()
            .rev()
            .skip(num_headers - index)
        {
            if header.get_key_ref().eq_ignore_ascii_case(name) {
                signed.push((header.get_key(), header.get_value_raw()));
                last_index.insert(name, header_index);
                continue 'outer;
            }
        }

        last_index.insert(name, 0);
    }

    signed
}

/// Computes the hash over the signed headers plus the zero-b DKIM-Signature
/// header, per RFC 6376 §3.7.
pub(crate) fn compute_headers_hash(
    message: &Message,
    sig: &DkimSignature,
    hash_algo: HashAlgo,
) -> Vec<u8> {
    let mut input = Vec::new();
    let mut hasher = HashImpl::from_algo(hash_algo);

    for (key, value) in select_headers(&sig.signed_headers, message) {
        sig.canon_header.canon_header_into(&key, value, &mut input);
    }

    {
        let zero_b = sig.zero_b_header_value();
        let mut canonicalized_value = vec![];
        sig.canon_header
            .canon_header_into(HEADER, zero_b.as_bytes(), &mut canonicalized_value);
        // remove trailing "\r\n": the DKIM-Signature header itself is
        // canonicalized last with its trailing CRLF omitted.
        canonicalized_value.truncate(canonicalized_value.len() - 2);
        input.extend_from_slice(&canonicalized_value);
    }

    tracing::debug!(bytes = input.len(), "headers to hash");

    hasher.hash(&input);
    hasher.finalize_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonicalization::Type;

    #[test]
    fn test_compute_body_hash_simple() {
        let email = "To: test@sauleau.com\r\nSubject: subject\r\nFrom: Sven Sauleau <sven@cloudflare.com>\r\n\r\nHello Alice\r\n        ";
        let (message, _) = Message::parse(email.as_bytes(), false).unwrap();

        let (hash, _) =
            compute_body_hash(Type::Simple, None, HashAlgo::RsaSha1, &message).unwrap();
        assert_eq!(hash, "ya82MJvChLGBNSxeRvrSat5LliQ=");

        let (hash, _) =
            compute_body_hash(Type::Simple, None, HashAlgo::RsaSha256, &message).unwrap();
        assert_eq!(hash, "KXQwQpX2zFwgixPbV6Dd18ZMJU04lLeRnwqzUp8uGwI=");
    }

    #[test]
    fn test_compute_body_hash_length() {
        let email = "To: test@sauleau.com\r\nSubject: subject\r\nFrom: Sven Sauleau <sven@cloudflare.com>\r\n\r\nHello Alice\r\n        ";
        let (message, _) = Message::parse(email.as_bytes(), false).unwrap();

        let (hash, hashed) =
            compute_body_hash(Type::Relaxed, Some(3), HashAlgo::RsaSha1, &message).unwrap();
        assert_eq!(hash, "28LR/tDcN6cK6g83aVjIAu3cBVk=");
        assert_eq!(hashed, 3);
    }

    #[test]
    fn test_compute_body_hash_empty_simple() {
        let (message, _) = Message::parse(b"Subject: nothing\r\n\r\n", false).unwrap();
        let (hash, _) =
            compute_body_hash(Type::Simple, None, HashAlgo::RsaSha256, &message).unwrap();
        assert_eq!(hash, "frcCV1k9oG9oKj3dpUqdJg1PxRT2RSN/XKdLCPjaYaY=");
    }

    #[test]
    fn test_compute_body_hash_empty_relaxed() {
        let (message, _) = Message::parse(b"Subject: nothing\r\n\r\n", false).unwrap();
        let (hash, _) =
            compute_body_hash(Type::Relaxed, None, HashAlgo::RsaSha256, &message).unwrap();
        assert_eq!(hash, "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=");
    }

    #[test]
    fn test_select_headers() {
        let signed = vec![
            "from".to_string(),
            "subject".to_string(),
            "to".to_string(),
            "from".to_string(),
        ];
        let (email1, _) = Message::parse(
            b"from: biz\r\nfoo: bar\r\nfrom: baz\r\nsubject: boring\r\n\r\ntest",
            false,
        )
        .unwrap();

        let result1 = select_headers(&signed, &email1);
        assert_eq!(
            result1,
            vec![
                ("from".to_owned(), &b"baz"[..]),
                ("subject".to_owned(), &b"boring"[..]),
                ("from".to_owned(), &b"biz"[..]),
            ]
        );
    }
}
