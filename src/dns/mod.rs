// DNS wire collaborator
//
// Just enough DNS to carry the transfer: building A queries, answering
// them with a single A record, and the UDP/TCP plumbing around that.

pub mod protocol;
pub mod transport;

pub use protocol::{DnsHeader, DnsMessage, DnsQType, DnsQuestion, DnsRecord, RData};
pub use transport::{answer, exchange, resolve_server, Listener, UdpQuerySender};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("Invalid DNS message: {0}")]
    InvalidMessage(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("No usable address for {0}")]
    NoAddress(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DnsError>;
