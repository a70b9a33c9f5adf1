//! Query-name grammar
//!
//! Builds the three outbound name shapes and classifies the labels of an
//! inbound name into typed tokens:
//!
//! ```text
//! path.<sanitized-path>.<base-domain>
//! <b64>[.<b64>...].<index>.<base-domain>
//! eof.<base-domain>
//! ```

use crate::{FerryError, Result};
use std::fmt;

const PATH_LABEL: &str = "path";
const EOF_LABEL: &str = "eof";

/// Base domain a transfer runs under, optionally prefixed with a tag
/// (`<prefix>.<domain>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseDomain {
    name: String,
    labels: Vec<String>,
}

impl BaseDomain {
    /// Build from a domain and an optional prefix tag.
    ///
    /// Surrounding dots are dropped and an empty prefix counts as none.
    pub fn new(domain: &str, prefix: Option<&str>) -> Self {
        let domain = domain.trim_matches('.');
        let name = match prefix.map(|p| p.trim_matches('.')) {
            Some(p) if !p.is_empty() => format!("{}.{}", p, domain),
            _ => domain.to_string(),
        };
        let labels = name.split('.').map(|l| l.to_ascii_lowercase()).collect();

        Self { name, labels }
    }

    /// Full base domain as configured
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Lower-cased labels, leftmost first
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Number of labels in the base domain
    pub fn depth(&self) -> usize {
        self.labels.len()
    }

    /// Strip this base domain from the end of `qname`.
    ///
    /// The comparison ignores case and a trailing root dot. Returns the
    /// remaining leading labels (possibly empty for the apex), or `None` when
    /// the name is not under this domain.
    pub fn strip<'a>(&self, qname: &'a str) -> Option<Vec<&'a str>> {
        let qname = qname.trim_end_matches('.');
        if qname.is_empty() {
            return None;
        }

        let labels: Vec<&str> = qname.split('.').collect();
        if labels.len() < self.depth() {
            return None;
        }

        let split = labels.len() - self.depth();
        let matches = labels[split..]
            .iter()
            .zip(&self.labels)
            .all(|(got, want)| got.eq_ignore_ascii_case(want));

        matches.then(|| labels[..split].to_vec())
    }
}

impl fmt::Display for BaseDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Turn a file path into a single label-safe token.
///
/// Leading and trailing separators are dropped and inner ones become `_`.
/// Lossy: an underscore already in the path is indistinguishable from a
/// separator once restored.
pub fn sanitize_path(path: &str) -> String {
    path.trim_matches(|c| c == '/' || c == '\\')
        .replace(['/', '\\'], "_")
}

/// Inverse of [`sanitize_path`] as far as it can be inverted
pub fn restore_path(token: &str) -> String {
    token.replace('_', "/")
}

/// `path.<token>.<base>`
pub fn path_query(path: &str, base: &BaseDomain) -> String {
    format!("{}.{}.{}", PATH_LABEL, sanitize_path(path), base)
}

/// `<labels...>.<index>.<base>`
pub fn chunk_query(labels: &[String], index: u64, base: &BaseDomain) -> String {
    if labels.is_empty() {
        format!("{}.{}", index, base)
    } else {
        format!("{}.{}.{}", labels.join("."), index, base)
    }
}

/// `eof.<base>`
pub fn eof_query(base: &BaseDomain) -> String {
    format!("{}.{}", EOF_LABEL, base)
}

/// Classification of one label left of the base domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    /// Leading `path` literal
    Path,
    /// Leading `eof` literal
    Eof,
    /// Decimal chunk index (last label only)
    Index(u64),
    /// Anything else: encoded payload or path token
    Fragment(&'a str),
}

/// Classify labels in order, in a single pass.
///
/// `path` and `eof` are recognised only in the first position and only as
/// whole labels (case-insensitive). A purely decimal label is an index only
/// when it is the last label, so short trailing payload fragments made of
/// digits stay fragments.
pub fn tokenize<'a>(labels: &[&'a str]) -> Vec<Token<'a>> {
    let last = labels.len().saturating_sub(1);

    labels
        .iter()
        .enumerate()
        .map(|(pos, &label)| {
            if pos == 0 && label.eq_ignore_ascii_case(PATH_LABEL) {
                return Token::Path;
            }
            if pos == 0 && label.eq_ignore_ascii_case(EOF_LABEL) {
                return Token::Eof;
            }
            if pos == last && is_decimal(label) {
                if let Ok(index) = label.parse::<u64>() {
                    return Token::Index(index);
                }
            }
            Token::Fragment(label)
        })
        .collect()
}

/// Whether `label` would be read as `path` or `eof` in the first position
pub fn is_keyword(label: &str) -> bool {
    label.eq_ignore_ascii_case(PATH_LABEL) || label.eq_ignore_ascii_case(EOF_LABEL)
}

fn is_decimal(label: &str) -> bool {
    !label.is_empty() && label.bytes().all(|b| b.is_ascii_digit())
}

/// A parsed inbound query name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Name equals the base domain
    Apex,
    /// Session start carrying the sanitized path token
    Path { token: String },
    /// End of transfer
    Eof,
    /// Encoded chunk payload (fragments joined) and its index
    Chunk { index: u64, payload: String },
}

impl Message {
    /// Parse the labels remaining after the base domain was stripped
    pub fn parse(labels: &[&str]) -> Result<Self> {
        let tokens = tokenize(labels);

        match tokens.as_slice() {
            [] => Ok(Message::Apex),
            [Token::Path, Token::Fragment(token), ..] => Ok(Message::Path {
                token: token.to_string(),
            }),
            // A bare number after `path` is still a path token
            [Token::Path, Token::Index(_)] => Ok(Message::Path {
                token: labels[1].to_string(),
            }),
            [Token::Path] => Err(FerryError::Malformed(
                "path announcement without a path token".into(),
            )),
            [Token::Eof, ..] => Ok(Message::Eof),
            [fragments @ .., Token::Index(index)] => {
                let mut payload = String::new();
                for token in fragments {
                    match token {
                        Token::Fragment(text) => payload.push_str(text),
                        // Unreachable given tokenize's positional rules, kept total
                        other => {
                            return Err(FerryError::Malformed(format!(
                                "unexpected {:?} inside chunk",
                                other
                            )))
                        }
                    }
                }
                Ok(Message::Chunk {
                    index: *index,
                    payload,
                })
            }
            _ => Err(FerryError::Malformed(format!(
                "no numeric index in {:?}",
                labels.join(".")
            ))),
        }
    }
}
