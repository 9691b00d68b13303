//! Authentication-Results parser and integrator (C9/C10, RFC 8601, spec
//! §4.8). New module; continues the `nom`-based idiom of [`crate::parser`]
//! rather than the regex approach some other implementations use.

use crate::DKIMError;
use nom::branch::alt;
use nom::bytes::complete::take_while1;
use nom::character::complete::{digit1, space0};
use nom::combinator::opt;
use nom::sequence::preceded;
use nom::IResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResInfo {
    pub method: String,
    pub method_version: Option<u32>,
    pub result: String,
    pub reason: Option<String>,
    /// `(ptype, property) -> value`, e.g. `("header", "d") -> "example.com"`.
    pub properties: Vec<((String, String), String)>,
}

impl ResInfo {
    pub fn property(&self, ptype: &str, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|((pt, p), _)| pt == ptype && p == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationResults {
    pub authserv_id: String,
    pub version: Option<u32>,
    pub resinfo: Vec<ResInfo>,
}

fn dkim_results() -> &'static [&'static str] {
    &["none", "pass", "fail", "policy", "neutral", "temperror", "permerror"]
}
fn spf_results() -> &'static [&'static str] {
    &[
        "none",
        "pass",
        "fail",
        "softfail",
        "neutral",
        "temperror",
        "permerror",
        "Pass",
        "Fail",
        "Neutral",
        "SoftFail",
    ]
}
fn dmarc_results() -> &'static [&'static str] {
    &["none", "pass", "fail", "temperror", "permerror"]
}
fn bimi_results() -> &'static [&'static str] {
    &["pass", "none", "fail", "temperror", "declined", "skipped"]
}

fn allowed_results_for(method: &str) -> Option<&'static [&'static str]> {
    match method {
        "dkim" => Some(dkim_results()),
        "spf" => Some(spf_results()),
        "dmarc" => Some(dmarc_results()),
        "bimi" => Some(bimi_results()),
        _ => None,
    }
}

/// Parses the full `Authentication-Results:` header value.
pub fn parse(input: &str) -> Result<AuthenticationResults, DKIMError> {
    let input = input.trim();
    let (rest, authserv_id) = token(input)
        .map_err(|err| DKIMError::IllformedArh(format!("authserv-id: {}", err)))?;
    let rest = rest.trim_start();

    let (rest, version) = opt(preceded(space0, digit1))(rest)
        .map_err(|err: nom::Err<nom::error::Error<&str>>| {
            DKIMError::IllformedArh(format!("version: {}", err))
        })?;
    let version = version.and_then(|v| v.parse::<u32>().ok());

    let rest = rest.trim_start();
    let rest = rest.strip_prefix(';').unwrap_or(rest);

    if rest.trim().is_empty() || rest.trim() == "none" {
        return Ok(AuthenticationResults {
            authserv_id: authserv_id.to_string(),
            version,
            resinfo: vec![],
        });
    }

    let mut resinfo = Vec::new();
    for chunk in split_top_level(rest, ';') {
        let chunk = chunk.trim();
        if chunk.is_empty() {
            continue;
        }
        match parse_resinfo(chunk) {
            Ok(entry) => resinfo.push(entry),
            Err(_) => {
                // a single ill-formed resinfo entry is skipped, not fatal
                continue;
            }
        }
    }

    Ok(AuthenticationResults {
        authserv_id: authserv_id.to_string(),
        version,
        resinfo,
    })
}

fn parse_resinfo(input: &str) -> Result<ResInfo, DKIMError> {
    let parts = split_top_level(input, ' ')
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    let (method_spec, prop_parts) = parts
        .split_first()
        .ok_or_else(|| DKIMError::IllformedArh("empty resinfo".to_string()))?;

    let (method_and_version, result) = method_spec
        .split_once('=')
        .ok_or_else(|| DKIMError::IllformedArh("resinfo missing '='".to_string()))?;
    let result = result.to_string();

    let (method, method_version) = match method_and_version.split_once('/') {
        Some((m, v)) => (
            m.to_string(),
            Some(
                v.parse::<u32>()
                    .map_err(|_| DKIMError::IllformedArh("bad methodspec version".to_string()))?,
            ),
        ),
        None => (method_and_version.to_string(), None),
    };

    if let Some(allowed) = allowed_results_for(&method) {
        if !allowed.contains(&result.as_str()) {
            return Err(DKIMError::IllformedArh(format!(
                "result '{}' not allowed for method '{}'",
                result, method
            )));
        }
    }

    let mut reason = None;
    let mut properties = Vec::new();
    for p in prop_parts {
        if let Some(rest) = p.strip_prefix("reason=") {
            reason = Some(unquote(rest));
            continue;
        }
        if let Some((ptype_prop, value)) = p.split_once('=') {
            if let Some((ptype, prop)) = ptype_prop.split_once('.') {
                properties.push(((ptype.to_string(), prop.to_string()), unquote(value)));
            }
        }
    }

    Ok(ResInfo {
        method,
        method_version,
        result,
        reason,
        properties,
    })
}

fn unquote(s: &str) -> String {
    s.trim_matches('"').to_string()
}

/// Splits on `sep` but not inside double quotes, matching RFC 8601's
/// allowance for quoted-string property values containing `;`/` `.
fn split_top_level(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == sep && !in_quotes => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn token(input: &str) -> IResult<&str, &str> {
    alt((
        take_while1(|c: char| !c.is_whitespace() && c != ';'),
        |i| Ok((i, "")),
    ))(input)
}

/// Whether `authserv_id` is trusted, matching exact entries or `@suffix`
/// entries against the right-hand side of the id (RFC 8601's `authserv-id`
/// conventionally embeds a domain after an `@`).
pub fn is_trusted(authserv_id: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|entry| {
        if let Some(suffix) = entry.strip_prefix('@') {
            authserv_id.ends_with(suffix) || authserv_id.ends_with(&format!("@{}", suffix))
        } else {
            entry.eq_ignore_ascii_case(authserv_id)
        }
    })
}

/// Policy under which ARH DKIM results are merged with the local verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationMode {
    Replace,
    Augment,
}

/// Extracts the BIMI indicator per spec §4.8: a trusted ARH must report
/// `bimi=pass` with `policy.authority=pass`, and exactly one
/// `BIMI-Indicator` header must be present. The returned value is the
/// header's value with all whitespace removed (spec §4.8: "less the name
/// and trailing CRLF, whitespace removed").
pub fn extract_bimi_indicator(
    trusted_ar: &[AuthenticationResults],
    bimi_indicator_headers: &[&[u8]],
) -> Option<Vec<u8>> {
    let bimi_pass = trusted_ar.iter().any(|ar| {
        ar.resinfo.iter().any(|r| {
            r.method == "bimi"
                && r.result == "pass"
                && r.property("policy", "authority") == Some("pass")
        })
    });
    if bimi_pass && bimi_indicator_headers.len() == 1 {
        Some(
            bimi_indicator_headers[0]
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect(),
        )
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_none() {
        let ar = parse("example.com; none").unwrap();
        assert_eq!(ar.authserv_id, "example.com");
        assert!(ar.resinfo.is_empty());
    }

    #[test]
    fn test_parse_dkim_pass() {
        let ar = parse("example.com; dkim=pass header.d=example.com header.s=brisbane").unwrap();
        assert_eq!(ar.resinfo.len(), 1);
        let r = &ar.resinfo[0];
        assert_eq!(r.method, "dkim");
        assert_eq!(r.result, "pass");
        assert_eq!(r.property("header", "d"), Some("example.com"));
    }

    #[test]
    fn test_parse_multiple_methods() {
        let ar = parse("example.com 1; dkim=pass; spf=softfail smtp.mailfrom=example.com").unwrap();
        assert_eq!(ar.version, Some(1));
        assert_eq!(ar.resinfo.len(), 2);
        assert_eq!(ar.resinfo[1].method, "spf");
        assert_eq!(ar.resinfo[1].result, "softfail");
    }

    #[test]
    fn test_invalid_result_is_skipped_not_fatal() {
        let ar = parse("example.com; dkim=bogus; dkim=pass").unwrap();
        assert_eq!(ar.resinfo.len(), 1);
        assert_eq!(ar.resinfo[0].result, "pass");
    }

    #[test]
    fn test_is_trusted_suffix() {
        let allowed = vec!["@example.com".to_string()];
        assert!(is_trusted("mx.example.com", &allowed));
        assert!(!is_trusted("mx.evil.com", &allowed));
    }

    #[test]
    fn test_bimi_indicator_requires_trusted_pass() {
        let ar = parse("example.com; bimi=pass policy.authority=pass").unwrap();
        let headers: Vec<&[u8]> = vec![b"data:image/svg+xml;..."];
        assert!(extract_bimi_indicator(&[ar], &headers).is_some());
    }

    #[test]
    fn test_bimi_indicator_strips_whitespace() {
        let ar = parse("example.com; bimi=pass policy.authority=pass").unwrap();
        let headers: Vec<&[u8]> = vec![b" data:image/svg+xml;\r\n base64,Zm9v"];
        let indicator = extract_bimi_indicator(&[ar], &headers).unwrap();
        assert_eq!(indicator, b"data:image/svg+xml;base64,Zm9v".to_vec());
    }
}
