//! Chunk planner and sequential sender
//!
//! [`ChunkPlanner::plan`] turns a file into the ordered list of query names
//! (path announcement, chunks, EOF). [`Sender`] pushes that plan through a
//! [`QueryTransport`] one name at a time with a fixed delay in between.
//!
//! A failed send is logged and skipped. There is no retry and no
//! acknowledgement, so a lost query is lost data on the receiver.

use crate::codec::LabelCodec;
use crate::qname::{chunk_query, eof_query, is_keyword, path_query, BaseDomain};
use crate::{FerryError, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Kind of a planned query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Path,
    /// Window `offset..offset + len` of the file
    Chunk { index: u64, offset: usize, len: usize },
    Eof,
}

/// One query name to emit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedQuery {
    pub kind: QueryKind,
    pub name: String,
}

/// Splits file content into framed query names
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    path: String,
    data: Vec<u8>,
    base: BaseDomain,
    chunk_size: usize,
    budgeted: bool,
}

impl ChunkPlanner {
    /// Plan a transfer of `data`, announced under `path`.
    ///
    /// A zero chunk size is treated as one byte.
    pub fn new(path: impl Into<String>, data: Vec<u8>, base: BaseDomain, chunk_size: usize) -> Self {
        Self {
            path: path.into(),
            data,
            base,
            chunk_size: chunk_size.max(1),
            budgeted: false,
        }
    }

    /// Read `path` once and plan its transfer.
    ///
    /// Fails with [`FerryError::FileNotFound`] when `path` is not a regular
    /// file, before anything is sent.
    pub fn from_file(path: &Path, base: BaseDomain, chunk_size: usize) -> Result<Self> {
        if !path.is_file() {
            return Err(FerryError::FileNotFound(path.display().to_string()));
        }

        let data = std::fs::read(path)?;
        Ok(Self::new(path.to_string_lossy(), data, base, chunk_size))
    }

    /// Shrink windows whose chunk name would not fit under the name budget.
    ///
    /// The bytes left over are carried into the next window under the next
    /// index.
    pub fn with_budget(mut self, enabled: bool) -> Self {
        self.budgeted = enabled;
        self
    }

    pub fn base_domain(&self) -> &BaseDomain {
        &self.base
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Iterate the queries of this transfer in emission order
    pub fn plan(&self) -> Plan<'_> {
        Plan {
            planner: self,
            stage: Stage::Path,
            offset: 0,
            index: 0,
        }
    }

    fn frame_window(&self, offset: usize, index: u64) -> (String, usize) {
        let end = (offset + self.chunk_size).min(self.data.len());
        let (mut labels, mut consumed) = self.encode_window(&self.data[offset..end], index);

        // A lone `path` label would be read as a new announcement; send one
        // byte less and let the rest follow under the next index
        while consumed > 1 && labels.len() == 1 && is_keyword(&labels[0]) {
            (labels, consumed) = self.encode_window(&self.data[offset..offset + consumed - 1], index);
        }

        (chunk_query(&labels, index, &self.base), consumed)
    }

    fn encode_window(&self, window: &[u8], index: u64) -> (Vec<String>, usize) {
        if self.budgeted {
            let suffix = format!("{}.{}", index, self.base);
            let encoded = LabelCodec::budgeted(&suffix).encode_budgeted(window);
            if encoded.consumed > 0 {
                return (encoded.labels, encoded.consumed);
            }
            // Base domain leaves no room at all; send the whole window and
            // let validation reject it
        }

        (LabelCodec::new().encode(window), window.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Path,
    Chunks,
    Eof,
    Done,
}

/// Iterator over a transfer's queries
pub struct Plan<'a> {
    planner: &'a ChunkPlanner,
    stage: Stage,
    offset: usize,
    index: u64,
}

impl Iterator for Plan<'_> {
    type Item = PlannedQuery;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.stage {
                Stage::Path => {
                    self.stage = Stage::Chunks;
                    return Some(PlannedQuery {
                        kind: QueryKind::Path,
                        name: path_query(&self.planner.path, &self.planner.base),
                    });
                }
                Stage::Chunks => {
                    if self.offset >= self.planner.data.len() {
                        self.stage = Stage::Eof;
                        continue;
                    }

                    let (name, len) = self.planner.frame_window(self.offset, self.index);
                    let kind = QueryKind::Chunk {
                        index: self.index,
                        offset: self.offset,
                        len,
                    };
                    self.offset += len;
                    self.index += 1;
                    return Some(PlannedQuery { kind, name });
                }
                Stage::Eof => {
                    self.stage = Stage::Done;
                    return Some(PlannedQuery {
                        kind: QueryKind::Eof,
                        name: eof_query(&self.planner.base),
                    });
                }
                Stage::Done => return None,
            }
        }
    }
}

/// Outbound query collaborator
#[async_trait]
pub trait QueryTransport: Send + Sync {
    /// Send one query for `qname`. Fire-and-forget; no answer is awaited.
    async fn send_query(&self, qname: &str) -> Result<()>;

    /// Server description for diagnostics
    fn server(&self) -> String;
}

/// Totals for one transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    /// Queries attempted, including path and EOF
    pub queries: usize,
    pub sent: usize,
    /// Rejected by validation or by the transport
    pub failed: usize,
    pub chunks: usize,
    pub bytes: usize,
}

/// Sequential, paced sender
pub struct Sender<T: QueryTransport> {
    transport: T,
    delay: Duration,
}

impl<T: QueryTransport> Sender<T> {
    pub fn new(transport: T, delay: Duration) -> Self {
        Self { transport, delay }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Emit every query of `planner`, pausing `delay` between emissions.
    ///
    /// Per-query failures are logged and counted, never returned.
    pub async fn run(&self, planner: &ChunkPlanner) -> TransferReport {
        let mut report = TransferReport {
            bytes: planner.len(),
            ..TransferReport::default()
        };
        let server = self.transport.server();

        info!(
            "Sending {} bytes under {} via {}",
            planner.len(),
            planner.base_domain(),
            server
        );

        for (n, query) in planner.plan().enumerate() {
            if n > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            report.queries += 1;
            match query.kind {
                QueryKind::Path => info!("Announcing path: {}", query.name),
                QueryKind::Chunk { index, len, .. } => {
                    report.chunks += 1;
                    debug!("chunk {} ({} bytes)", index, len);
                }
                QueryKind::Eof => debug!("eof"),
            }

            match self.emit(&query.name).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to send {} to {}: {}", query.name, server, e);
                }
            }
        }

        info!(
            "Transfer complete: {} chunks, {} sent, {} failed → {}",
            report.chunks, report.sent, report.failed, server
        );

        report
    }

    async fn emit(&self, qname: &str) -> Result<()> {
        LabelCodec::validate(qname)?;
        self.transport.send_query(qname).await
    }
}
