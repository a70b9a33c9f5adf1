//! Per-transfer session state and session-key derivation

use crate::qname::BaseDomain;
use crate::{FerryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};

/// Identifier isolating one transfer from another
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory name used under the output root
    pub fn as_dir_name(&self) -> String {
        // IPv6 keys carry ':' which some filesystems refuse
        self.0.replace([':', '/', '\\'], "_")
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strategy deriving the session key for an incoming query
pub trait SessionKeyPolicy: Send + Sync {
    /// Key for a query under `base` that arrived from `source`
    fn key(&self, base: &BaseDomain, source: SocketAddr) -> SessionKey;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// One session per base domain; source address is ignored
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainKeyed;

impl SessionKeyPolicy for DomainKeyed {
    fn key(&self, base: &BaseDomain, _source: SocketAddr) -> SessionKey {
        SessionKey::new(base.labels().join("."))
    }

    fn name(&self) -> &'static str {
        "domain"
    }
}

/// One session per originating IP address.
///
/// The port is left out: resolvers and stub clients pick a fresh source port
/// for nearly every query.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressKeyed;

impl SessionKeyPolicy for AddressKeyed {
    fn key(&self, _base: &BaseDomain, source: SocketAddr) -> SessionKey {
        SessionKey::new(source.ip().to_string())
    }

    fn name(&self) -> &'static str {
        "address"
    }
}

/// Configurable choice of [`SessionKeyPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPolicy {
    #[default]
    Domain,
    Address,
}

impl KeyPolicy {
    pub fn strategy(self) -> Box<dyn SessionKeyPolicy> {
        match self {
            KeyPolicy::Domain => Box::new(DomainKeyed),
            KeyPolicy::Address => Box::new(AddressKeyed),
        }
    }
}

impl std::str::FromStr for KeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "domain" => Ok(KeyPolicy::Domain),
            "address" | "addr" | "ip" => Ok(KeyPolicy::Address),
            other => Err(format!("unknown session key policy: {}", other)),
        }
    }
}

/// What to write for a chunk index that never arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapFill {
    /// Zero bytes, one window long
    #[default]
    Zero,
    /// Nothing; later chunks shift left
    Skip,
}

impl std::str::FromStr for GapFill {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zero" => Ok(GapFill::Zero),
            "skip" => Ok(GapFill::Skip),
            other => Err(format!("unknown gap policy: {}", other)),
        }
    }
}

/// An in-progress transfer
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Path restored from the announcement; metadata only
    pub path: String,
    chunks: BTreeMap<u64, Vec<u8>>,
    highest: Option<u64>,
}

impl Session {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            chunks: BTreeMap::new(),
            highest: None,
        }
    }

    /// Store a chunk; a repeated index replaces the earlier payload
    pub fn store(&mut self, index: u64, payload: Vec<u8>) {
        self.chunks.insert(index, payload);
        self.highest = Some(self.highest.map_or(index, |h| h.max(index)));
    }

    pub fn highest_index(&self) -> Option<u64> {
        self.highest
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Indices in `0..=highest` that were never stored
    pub fn missing(&self) -> Vec<u64> {
        match self.highest {
            None => Vec::new(),
            Some(h) => (0..=h).filter(|i| !self.chunks.contains_key(i)).collect(),
        }
    }

    /// Window size inferred from the longest stored chunk
    pub fn window_size(&self) -> usize {
        self.chunks.values().map(Vec::len).max().unwrap_or(0)
    }

    /// Length of the assembled file under `gap`, or `None` when it does not
    /// fit in memory
    pub fn assembled_len(&self, gap: GapFill) -> Option<usize> {
        let stored = self.chunks.values().map(Vec::len).sum::<usize>();
        if gap == GapFill::Skip {
            return Some(stored);
        }

        let missing = match self.highest {
            None => 0,
            Some(h) => usize::try_from(h)
                .ok()?
                .checked_add(1)?
                .checked_sub(self.chunks.len())?,
        };
        missing.checked_mul(self.window_size())?.checked_add(stored)
    }

    /// Concatenate chunks `0..=highest` in index order.
    ///
    /// Walks the stored chunks rather than the index range, so the cost of
    /// `Skip` does not depend on how large the indices are.
    pub fn assemble(&self, gap: GapFill) -> Result<Vec<u8>> {
        let len = self.assembled_len(gap).ok_or_else(|| {
            FerryError::Malformed(format!(
                "session {:?} would assemble past addressable memory",
                self.path
            ))
        })?;

        let window = self.window_size();
        let mut out = Vec::with_capacity(len);
        let mut next = 0u64;

        for (&index, payload) in &self.chunks {
            if gap == GapFill::Zero {
                // Bounded by `len`, checked above
                let gaps = (index - next) as usize;
                out.resize(out.len() + gaps * window, 0);
            }
            out.extend_from_slice(payload);
            next = index.saturating_add(1);
        }

        Ok(out)
    }
}

/// Receiver-local path for a flushed session.
///
/// `<root>/<key>/<path>`, keeping only plain components of the announced path
/// so it cannot climb out of the root.
pub fn output_path(root: &Path, key: &SessionKey, announced: &str) -> PathBuf {
    let mut out = root.join(key.as_dir_name());

    let mut pushed = false;
    for component in Path::new(announced.trim_start_matches('/')).components() {
        if let Component::Normal(part) = component {
            out.push(part);
            pushed = true;
        }
    }

    if !pushed {
        out.push("unnamed");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(ip: &str) -> SocketAddr {
        format!("{}:5353", ip).parse().unwrap()
    }

    #[test]
    fn test_domain_policy_ignores_source() {
        let base = BaseDomain::new("Exfil.Example.com", Some("h1"));
        let a = DomainKeyed.key(&base, src("10.0.0.1"));
        let b = DomainKeyed.key(&base, src("10.0.0.2"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "h1.exfil.example.com");
    }

    #[test]
    fn test_address_policy_ignores_port() {
        let base = BaseDomain::new("exfil.example.com", None);
        let a = AddressKeyed.key(&base, "10.0.0.1:1000".parse().unwrap());
        let b = AddressKeyed.key(&base, "10.0.0.1:2000".parse().unwrap());
        let c = AddressKeyed.key(&base, src("10.0.0.2"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_store_tracks_highest() {
        let mut s = Session::new("etc/passwd");
        assert_eq!(s.highest_index(), None);
        s.store(3, vec![1]);
        s.store(1, vec![2]);
        assert_eq!(s.highest_index(), Some(3));
        assert_eq!(s.chunk_count(), 2);
        assert_eq!(s.missing(), vec![0, 2]);
    }

    #[test]
    fn test_assemble_gap_policies() {
        let mut s = Session::new("f");
        s.store(0, b"aaaa".to_vec());
        s.store(2, b"cc".to_vec());

        assert_eq!(s.assemble(GapFill::Zero).unwrap(), b"aaaa\0\0\0\0cc".to_vec());
        assert_eq!(s.assemble(GapFill::Skip).unwrap(), b"aaaacc".to_vec());
        assert_eq!(s.assembled_len(GapFill::Zero), Some(10));
    }

    #[test]
    fn test_assemble_empty_session() {
        assert!(Session::new("f").assemble(GapFill::Zero).unwrap().is_empty());
    }

    #[test]
    fn test_assemble_huge_index_is_an_error() {
        let mut s = Session::new("f");
        s.store(0, b"abc".to_vec());
        s.store(u64::MAX, b"xyz".to_vec());

        assert_eq!(s.assembled_len(GapFill::Zero), None);
        assert!(matches!(
            s.assemble(GapFill::Zero),
            Err(FerryError::Malformed(_))
        ));
        // Skip never materialises the gap
        assert_eq!(s.assemble(GapFill::Skip).unwrap(), b"abcxyz".to_vec());
    }

    #[test]
    fn test_output_path_stays_under_root() {
        let root = Path::new("/srv/ferry");
        let key = SessionKey::from("exfil.example.com");

        assert_eq!(
            output_path(root, &key, "/etc/passwd"),
            PathBuf::from("/srv/ferry/exfil.example.com/etc/passwd")
        );
        assert_eq!(
            output_path(root, &key, "../../etc/shadow"),
            PathBuf::from("/srv/ferry/exfil.example.com/etc/shadow")
        );

        let v6 = SessionKey::from("::1");
        assert_eq!(
            output_path(root, &v6, "x"),
            PathBuf::from("/srv/ferry/__1/x")
        );
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("address".parse::<KeyPolicy>().unwrap(), KeyPolicy::Address);
        assert_eq!("Domain".parse::<KeyPolicy>().unwrap(), KeyPolicy::Domain);
        assert!("nope".parse::<KeyPolicy>().is_err());
        assert_eq!("skip".parse::<GapFill>().unwrap(), GapFill::Skip);
    }
}
