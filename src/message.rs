//! RFC 5322 message splitting tuned to DKIM's needs (spec §4.1): this is not
//! a general MIME parser, only enough structure for canonicalization and
//! header selection to operate on.

use crate::DKIMError;
use crate::Warning;

const HEADER_BLOCK_CAP: usize = 64 * 1024;
const MAX_HEADER_LINE: usize = 998;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    /// Name as it appeared in the message (case preserved).
    pub name: String,
    /// Raw bytes of the value, i.e. everything after the first `:` up to
    /// (not including) the terminating CRLF, folding preserved.
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn get_key(&self) -> String {
        self.name.clone()
    }

    pub fn get_key_ref(&self) -> &str {
        &self.name
    }

    pub fn get_value_raw(&self) -> &[u8] {
        &self.value
    }
}

/// A parsed message: immutable for the duration of verification.
#[derive(Debug, Clone)]
pub struct Message {
    headers: Vec<HeaderField>,
    body: Vec<u8>,
}

impl Message {
    /// Splits `input` into a header list and a body, normalizing line
    /// endings first. Returns any non-fatal warnings alongside the message.
    pub fn parse(input: &[u8], strict: bool) -> Result<(Self, Vec<Warning>), DKIMError> {
        let normalized = normalize_line_endings(input);

        let header_end = find_header_terminator(&normalized, strict)?;
        let (header_block, rest) = normalized.split_at(header_end);
        // rest starts with the CRLFCRLF (or is empty if there was none)
        let body = if rest.len() >= 4 { &rest[4..] } else { &[] };

        let (headers, warnings) = split_headers(header_block, strict)?;

        Ok((
            Message {
                headers,
                body: body.to_vec(),
            },
            warnings,
        ))
    }

    pub fn get_headers(&self) -> &[HeaderField] {
        &self.headers
    }

    /// Returns the last occurrence of a header by case-insensitive name,
    /// matching RFC 5322's "most recently added" convention for unique
    /// fields such as `From`.
    pub fn get_header(&self, name: &str) -> Option<&HeaderField> {
        self.headers
            .iter()
            .rev()
            .find(|h| h.name.eq_ignore_ascii_case(name))
    }

    pub fn get_body_bytes(&self) -> &[u8] {
        &self.body
    }
}

fn normalize_line_endings(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'\r' => {
                out.push(b'\r');
                out.push(b'\n');
                if i + 1 < input.len() && input[i + 1] == b'\n' {
                    i += 2;
                } else {
                    i += 1;
                }
            }
            b'\n' => {
                out.push(b'\r');
                out.push(b'\n');
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Returns the offset of the start of the `CRLFCRLF` header terminator
/// (i.e. the length of the header block, not including the blank line).
fn find_header_terminator(input: &[u8], strict: bool) -> Result<usize, DKIMError> {
    if let Some(idx) = memchr::memmem::find(input, b"\r\n\r\n") {
        return Ok(idx);
    }

    // No body separator at all: a message with headers-only is valid (body
    // is empty), but an unbounded header block without a terminator is
    // `Malformed` once it exceeds the cap.
    if input.len() > HEADER_BLOCK_CAP {
        return Err(DKIMError::Malformed(
            "no CRLFCRLF header terminator found within 64 KiB".to_string(),
        ));
    }
    let _ = strict;
    Ok(input.len())
}

fn split_headers(
    block: &[u8],
    strict: bool,
) -> Result<(Vec<HeaderField>, Vec<Warning>), DKIMError> {
    let mut headers = Vec::new();
    let mut warnings = Vec::new();

    let mut lines: Vec<&[u8]> = Vec::new();
    for line in block.split(|&b| b == b'\n') {
        let line = if line.ends_with(b"\r") {
            &line[..line.len() - 1]
        } else {
            line
        };
        if line.len() > MAX_HEADER_LINE {
            if strict {
                return Err(DKIMError::Malformed(format!(
                    "header line exceeds {} octets",
                    MAX_HEADER_LINE
                )));
            }
            warnings.push(Warning::HeaderLineTooLong);
        }
        lines.push(line);
    }

    let mut i = 0;
    while i < lines.len() {
        let mut line = lines[i].to_vec();
        if line.is_empty() {
            i += 1;
            continue;
        }
        i += 1;
        while i < lines.len() && starts_with_wsp(lines[i]) {
            line.extend_from_slice(b"\r\n");
            line.extend_from_slice(lines[i]);
            i += 1;
        }

        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| DKIMError::Malformed("header field missing ':'".to_string()))?;
        let name = String::from_utf8_lossy(&line[..colon]).trim_end().to_string();
        let mut value = &line[colon + 1..];
        if value.first() == Some(&b' ') {
            value = &value[1..];
        }
        headers.push(HeaderField {
            name,
            value: value.to_vec(),
        });
    }

    Ok((headers, warnings))
}

fn starts_with_wsp(line: &[u8]) -> bool {
    matches!(line.first(), Some(b' ') | Some(b'\t'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let (msg, warnings) = Message::parse(b"To: a@b.com\r\nSubject: hi\r\n\r\nbody", false).unwrap();
        assert_eq!(warnings.len(), 0);
        assert_eq!(msg.get_headers().len(), 2);
        assert_eq!(msg.get_header("to").unwrap().get_value_raw(), b"a@b.com");
        assert_eq!(msg.get_body_bytes(), b"body");
    }

    #[test]
    fn test_parse_folded_header() {
        let (msg, _) =
            Message::parse(b"Subject: hello\r\n world\r\n\r\nbody", false).unwrap();
        assert_eq!(
            msg.get_header("subject").unwrap().get_value_raw(),
            b"hello\r\n world"
        );
    }

    #[test]
    fn test_parse_no_body() {
        let (msg, _) = Message::parse(b"Subject: no body here\r\n\r\n", false).unwrap();
        assert_eq!(msg.get_body_bytes(), b"");
    }

    #[test]
    fn test_normalize_bare_lf() {
        let (msg, _) = Message::parse(b"Subject: a\n\nbody", false).unwrap();
        assert_eq!(msg.get_header("subject").unwrap().get_value_raw(), b"a");
        assert_eq!(msg.get_body_bytes(), b"body");
    }

    #[test]
    fn test_malformed_no_terminator() {
        let huge = vec![b'a'; HEADER_BLOCK_CAP + 1];
        let err = Message::parse(&huge, false).unwrap_err();
        assert_eq!(err.kind(), "Malformed");
    }

    #[test]
    fn test_duplicate_headers_preserved() {
        let (msg, _) =
            Message::parse(b"From: a\r\nFrom: b\r\n\r\n", false).unwrap();
        assert_eq!(msg.get_headers().len(), 2);
    }
}
