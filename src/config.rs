//! dnsferry configuration
//!
//! Both roles can be configured from one TOML file; command-line flags
//! override individual fields.
//!
//! ```toml
//! [sender]
//! domain = "exfil.example.com"
//! prefix = "host01"
//! server = "198.51.100.20"
//! chunk_size = 30
//! delay = "100ms"
//!
//! [receiver]
//! domain = "exfil.example.com"
//! listen_addr = "0.0.0.0:53"
//! presence_ip = "198.51.100.20"
//! key_policy = "address"
//! ```

use crate::codec::LabelCodec;
use crate::qname::BaseDomain;
use crate::session::{GapFill, KeyPolicy};
use crate::{
    FerryError, Result, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CHUNK_INDEX, MAX_LABEL_LEN, MAX_QNAME_LEN,
};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Digits reserved for the chunk index when checking a chunk size up front
const INDEX_DIGITS_RESERVE: usize = 10;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FerryConfig {
    #[serde(default)]
    pub sender: Option<SenderConfig>,

    #[serde(default)]
    pub receiver: Option<ReceiverConfig>,
}

impl FerryConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Sender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Base domain the receiver is authoritative for
    pub domain: String,

    /// Optional tag prepended to the base domain
    pub prefix: Option<String>,

    /// Server IP, `ip:port`, or hostname. Resolved through
    /// `bootstrap_resolver` when absent.
    pub server: Option<String>,

    /// Port used when `server` carries none
    pub port: u16,

    /// Resolver asked for the server's address when `server` is not an IP
    pub bootstrap_resolver: SocketAddr,

    /// Bytes per chunk window
    pub chunk_size: usize,

    /// Pause between queries
    #[serde(with = "humantime_serde")]
    pub delay: Duration,

    /// Per-query send timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Shrink windows that would not fit the 253-character name budget
    pub budget_aware: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            prefix: None,
            server: None,
            port: 53,
            bootstrap_resolver: SocketAddr::from(([8, 8, 8, 8], 53)),
            chunk_size: DEFAULT_CHUNK_SIZE,
            delay: Duration::ZERO,
            timeout: Duration::from_secs(2),
            budget_aware: true,
        }
    }
}

impl SenderConfig {
    pub fn base_domain(&self) -> BaseDomain {
        BaseDomain::new(&self.domain, self.prefix.as_deref())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let base = self.base_domain();
        validate_domain(&base)?;

        if self.chunk_size == 0 {
            return Err(FerryError::InvalidConfig(
                "chunk_size must be at least 1 byte".into(),
            ));
        }

        let max = LabelCodec::max_payload_per_query(base.as_str(), INDEX_DIGITS_RESERVE);
        if max == 0 {
            return Err(FerryError::InvalidConfig(format!(
                "base domain {} leaves no room for payload",
                base
            )));
        }
        if self.chunk_size > max && !self.budget_aware {
            return Err(FerryError::InvalidConfig(format!(
                "chunk_size {} does not fit one query under {} (max {})",
                self.chunk_size, base, max
            )));
        }

        Ok(())
    }
}

/// Receiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Base domain to serve
    pub domain: String,

    /// Optional tag prepended to the base domain
    pub prefix: Option<String>,

    /// UDP and TCP listen address
    pub listen_addr: SocketAddr,

    /// Address returned for the apex and for every accepted query
    pub presence_ip: Ipv4Addr,

    /// Directory reconstructed files are written beneath
    pub output_root: PathBuf,

    /// How sessions are keyed
    pub key_policy: KeyPolicy,

    /// What missing chunk indices become on flush
    pub gap_fill: GapFill,

    /// Chunks with a larger index are dropped; bounds memory and output size
    pub max_chunk_index: u64,

    /// Also emit JSON-lines transfer events on stdout
    pub json_events: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            prefix: None,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 53)),
            presence_ip: Ipv4Addr::LOCALHOST,
            output_root: PathBuf::from("ferry_data"),
            key_policy: KeyPolicy::default(),
            gap_fill: GapFill::default(),
            max_chunk_index: DEFAULT_MAX_CHUNK_INDEX,
            json_events: false,
        }
    }
}

impl ReceiverConfig {
    pub fn base_domain(&self) -> BaseDomain {
        BaseDomain::new(&self.domain, self.prefix.as_deref())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_domain(&self.base_domain())?;

        if self.output_root.as_os_str().is_empty() {
            return Err(FerryError::InvalidConfig("output_root must be set".into()));
        }

        Ok(())
    }
}

fn validate_domain(base: &BaseDomain) -> Result<()> {
    if base.as_str().is_empty() {
        return Err(FerryError::InvalidConfig("domain must be set".into()));
    }

    if base.as_str().len() > MAX_QNAME_LEN {
        return Err(FerryError::InvalidConfig(format!(
            "domain {} is longer than {} characters",
            base, MAX_QNAME_LEN
        )));
    }

    for label in base.labels() {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(FerryError::InvalidConfig(format!(
                "domain {} has an empty or over-long label",
                base
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let sender = SenderConfig::default();
        assert_eq!(sender.chunk_size, 30);
        assert_eq!(sender.port, 53);
        assert!(sender.delay.is_zero());

        let receiver = ReceiverConfig::default();
        assert_eq!(receiver.key_policy, KeyPolicy::Domain);
        assert_eq!(receiver.gap_fill, GapFill::Zero);
    }

    #[test]
    fn test_config_validation() {
        let mut sender = SenderConfig::default();

        // Should fail without a domain
        assert!(sender.validate().is_err());

        sender.domain = "exfil.example.com".into();
        assert!(sender.validate().is_ok());

        sender.chunk_size = 0;
        assert!(sender.validate().is_err());

        sender.chunk_size = 400;
        assert!(sender.validate().is_ok());
        sender.budget_aware = false;
        assert!(matches!(
            sender.validate(),
            Err(FerryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_domain_validation() {
        let mut receiver = ReceiverConfig {
            domain: "a..example.com".into(),
            ..ReceiverConfig::default()
        };
        assert!(receiver.validate().is_err());

        receiver.domain = format!("{}.example.com", "x".repeat(64));
        assert!(receiver.validate().is_err());

        receiver.domain = "exfil.example.com".into();
        receiver.prefix = Some("team-a".into());
        assert!(receiver.validate().is_ok());
        assert_eq!(receiver.base_domain().as_str(), "team-a.exfil.example.com");
    }

    #[test]
    fn test_toml_parsing() {
        let config: FerryConfig = toml::from_str(
            r#"
            [sender]
            domain = "exfil.example.com"
            server = "198.51.100.20"
            delay = "150ms"
            chunk_size = 48

            [receiver]
            domain = "exfil.example.com"
            presence_ip = "198.51.100.20"
            key_policy = "address"
            gap_fill = "skip"
            max_chunk_index = 1000
            "#,
        )
        .unwrap();

        let sender = config.sender.unwrap();
        assert_eq!(sender.delay, Duration::from_millis(150));
        assert_eq!(sender.chunk_size, 48);
        assert_eq!(sender.timeout, Duration::from_secs(2));

        let receiver = config.receiver.unwrap();
        assert_eq!(receiver.key_policy, KeyPolicy::Address);
        assert_eq!(receiver.gap_fill, GapFill::Skip);
        assert_eq!(receiver.max_chunk_index, 1000);
        assert_eq!(receiver.presence_ip, Ipv4Addr::new(198, 51, 100, 20));
        assert_eq!(receiver.listen_addr.port(), 53);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.toml");

        let config = FerryConfig {
            sender: Some(SenderConfig {
                domain: "exfil.example.com".into(),
                delay: Duration::from_millis(250),
                ..SenderConfig::default()
            }),
            receiver: None,
        };
        config.to_file(&path).unwrap();

        let loaded = FerryConfig::from_file(&path).unwrap();
        let sender = loaded.sender.unwrap();
        assert_eq!(sender.domain, "exfil.example.com");
        assert_eq!(sender.delay, Duration::from_millis(250));
        assert!(loaded.receiver.is_none());
    }
}
