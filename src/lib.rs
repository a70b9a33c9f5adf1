//! dnsferry: file transfer carried inside DNS query names
//!
//! A sender splits a file into small windows, encodes each window as
//! URL-safe base64 labels and emits one DNS `A` query per window under a base
//! domain. A listener that is authoritative for that domain observes the query
//! names, buffers the windows by index and writes the file back out once an
//! end-of-transfer marker arrives.
//!
//! ## Query-name grammar
//!
//! ```text
//! <base-domain>                                  apex (presence check)
//! path.<sanitized-path>.<base-domain>            session start
//! <b64>[.<b64>...].<index>.<base-domain>         chunk
//! eof.<base-domain>                              flush
//! ```
//!
//! `<base-domain>` is `<prefix>.<domain>` when a prefix tag is configured.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dnsferry::{ChunkPlanner, BaseDomain};
//!
//! let base = BaseDomain::new("exfil.example.com", None);
//! let planner = ChunkPlanner::new("/etc/hostname", b"hello world".to_vec(), base, 30);
//! for query in planner.plan() {
//!     println!("{}", query.name);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  query names  ┌──────────────┐  qname, src  ┌──────────────┐
//! │ ChunkPlanner │──────────────▶│ dns listener │─────────────▶│  Reassembly  │
//! │   + Sender   │   (UDP :53)   │  (UDP + TCP) │◀─────────────│    Engine    │
//! └──────────────┘               └──────────────┘  fixed A RR  └──────────────┘
//!                                                                     │ EOF
//!                                                                     ▼
//!                                                       <root>/<session key>/<path>
//! ```

pub mod codec;
pub mod config;
pub mod dns;
pub mod engine;
pub mod json_logger;
pub mod planner;
pub mod qname;
pub mod session;

pub use codec::LabelCodec;
pub use config::{FerryConfig, ReceiverConfig, SenderConfig};
pub use engine::{EngineStats, FlushReport, Outcome, ReassemblyEngine, Reply};
pub use planner::{ChunkPlanner, PlannedQuery, QueryKind, QueryTransport, Sender, TransferReport};
pub use qname::{BaseDomain, Message, Token};
pub use session::{AddressKeyed, DomainKeyed, GapFill, KeyPolicy, SessionKey, SessionKeyPolicy};

/// Maximum DNS label length (RFC 1035)
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum DNS name length in presentation form (RFC 1035)
pub const MAX_QNAME_LEN: usize = 253;

/// Characters kept free below [`MAX_QNAME_LEN`] when packing payload labels
pub const QNAME_SAFETY_MARGIN: usize = 10;

/// Default bytes per chunk window
pub const DEFAULT_CHUNK_SIZE: usize = 30;

/// Highest chunk index a listener accepts unless configured otherwise
/// (about 7.5 MiB at the default window)
pub const DEFAULT_MAX_CHUNK_INDEX: u64 = 262_143;

/// dnsferry error types
#[derive(Debug, thiserror::Error)]
pub enum FerryError {
    /// A label in an outbound name exceeds 63 characters
    #[error("Label too long ({len} chars): {label}")]
    LabelTooLong { label: String, len: usize },

    /// An outbound name exceeds 253 characters
    #[error("Query name too long ({len} chars): {name}")]
    NameTooLong { name: String, len: usize },

    /// Chunk payload is not valid unpadded base64url
    #[error("Decode error: {0}")]
    Decode(String),

    /// Received name does not follow the query-name grammar
    #[error("Malformed query name: {0}")]
    Malformed(String),

    /// Send or resolution failure
    #[error("Transport error for {name} via {server}: {reason}")]
    Transport {
        name: String,
        server: String,
        reason: String,
    },

    /// Chunk or EOF with no active session for its key
    #[error("No active session for {0}")]
    SessionNotFound(String),

    /// Source file is missing or not a regular file
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FerryError>;
