//! `DkimKey`: the DNS TXT record fetched from `<selector>._domainkey.<sdid>`
//! (spec §3, RFC 6376 §3.6.1).

use crate::crypto::DkimPublicKey;
use crate::parser;
use crate::DKIMError;

#[derive(Debug, Clone)]
pub struct DkimKey {
    pub version: String,
    pub key_type: String,
    pub hash_algorithms: Option<Vec<String>>,
    pub public_key: DkimPublicKey,
    pub service_types: Option<Vec<String>>,
    pub testing: bool,
    pub strict: bool,
    /// Whether the DNS answer this key came from was DNSSEC-validated.
    pub secure: bool,
    /// The raw TXT record text this key was parsed from, kept for the key
    /// store's comparison in compare-and-alert mode.
    pub raw: String,
}

impl DkimKey {
    /// Parses a key record from the (already-reassembled) TXT record text.
    pub fn parse(txt: &str, secure: bool) -> Result<Self, DKIMError> {
        let tags = parser::parse_unique_tag_list(txt)?;
        let mut map = std::collections::HashMap::new();
        for t in &tags {
            map.insert(t.name.as_str(), t);
        }

        let version = match map.get("v") {
            Some(t) => {
                if t.value != "DKIM1" {
                    return Err(DKIMError::KeyIncompatibleVersion);
                }
                t.value.clone()
            }
            None => "DKIM1".to_string(),
        };

        let key_type = match map.get("k") {
            Some(t) => t.value.clone(),
            None => "rsa".to_string(),
        };
        if key_type != "rsa" && key_type != "ed25519" {
            return Err(DKIMError::UnknownKeyType(key_type));
        }

        let hash_algorithms = map
            .get("h")
            .map(|t| t.value.split(':').map(|s| s.to_string()).collect());

        let service_types: Option<Vec<String>> = map
            .get("s")
            .map(|t| t.value.split(':').map(|s| s.to_string()).collect());
        if let Some(types) = &service_types {
            if !types.is_empty() && !types.iter().any(|s| s == "email" || s == "*") {
                return Err(DKIMError::KeyNotEmail);
            }
        }

        let flags: Vec<&str> = map
            .get("t")
            .map(|t| t.value.split(':').collect())
            .unwrap_or_default();
        let testing = flags.contains(&"y");
        let strict = flags.contains(&"s");

        let p = map.get("p").ok_or(DKIMError::NoKey)?;
        let der = crate::crypto::base64_decode(&p.value)?;
        let public_key = DkimPublicKey::decode(&key_type, &der)?;

        Ok(DkimKey {
            version,
            key_type,
            hash_algorithms,
            public_key,
            service_types,
            testing,
            strict,
            secure,
            raw: txt.to_string(),
        })
    }

    pub fn allows_hash(&self, hash_name: &str) -> bool {
        match &self.hash_algorithms {
            None => true,
            Some(list) => list.iter().any(|h| h == hash_name),
        }
    }
}
