//! Session reassembly engine
//!
//! Receives query names in any order, classifies them, buffers chunk payloads
//! by index and writes the file out when the end-of-transfer marker arrives.
//!
//! Per session key the state machine is:
//!
//! ```text
//! Absent ──path──▶ Receiving ──chunk──▶ Receiving ──eof──▶ Flushed (= Absent)
//!                      ▲                    │
//!                      └───────path─────────┘   (resets the chunk map)
//! ```
//!
//! All mutation goes through one lock on the session table and no step awaits,
//! so UDP and TCP listeners can share an engine behind an `Arc`.

use crate::codec::LabelCodec;
use crate::json_logger::JsonLogger;
use crate::qname::{restore_path, BaseDomain, Message};
use crate::session::{output_path, GapFill, Session, SessionKey, SessionKeyPolicy};
use crate::{FerryError, ReceiverConfig, DEFAULT_MAX_CHUNK_INDEX};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

const COMPONENT: &str = "engine";

/// Answer the listener should send back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// One A record carrying this address
    Address(Ipv4Addr),
    /// No answer records (name outside the base domain)
    Empty,
}

/// Result of a completed flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub key: SessionKey,
    pub output: PathBuf,
    pub bytes: usize,
    pub chunks: usize,
    pub missing: Vec<u64>,
}

/// What handling one query name did
#[derive(Debug)]
pub enum Outcome {
    /// Name not under the base domain
    Ignored,
    /// Presence check against the apex
    Apex,
    /// Path announcement; `replaced` when an older session was discarded
    SessionStarted { key: SessionKey, replaced: bool },
    ChunkStored { key: SessionKey, index: u64, len: usize },
    /// Chunk or name that could not be parsed or decoded
    ChunkDropped { key: SessionKey, error: FerryError },
    /// Chunk or EOF with no session for its key
    NoSession { key: SessionKey },
    Flushed(FlushReport),
    /// Session consumed but the output file could not be written
    FlushFailed { key: SessionKey, output: PathBuf, error: FerryError },
}

/// Reply plus outcome for one query
#[derive(Debug)]
pub struct Handled {
    pub reply: Reply,
    pub outcome: Outcome,
}

/// Counters exposed for drop-rate monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub queries: u64,
    pub ignored: u64,
    pub sessions_started: u64,
    pub chunks_stored: u64,
    pub chunks_dropped: u64,
    pub orphans: u64,
    pub files_flushed: u64,
    pub flush_failures: u64,
}

#[derive(Default)]
struct Counters {
    queries: AtomicU64,
    ignored: AtomicU64,
    sessions_started: AtomicU64,
    chunks_stored: AtomicU64,
    chunks_dropped: AtomicU64,
    orphans: AtomicU64,
    files_flushed: AtomicU64,
    flush_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            queries: self.queries.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            chunks_stored: self.chunks_stored.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            orphans: self.orphans.load(Ordering::Relaxed),
            files_flushed: self.files_flushed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }
}

/// Session reassembly engine
pub struct ReassemblyEngine {
    base: BaseDomain,
    presence: Ipv4Addr,
    output_root: PathBuf,
    gap: GapFill,
    max_chunk_index: u64,
    policy: Box<dyn SessionKeyPolicy>,
    json_events: bool,
    sessions: Mutex<HashMap<SessionKey, Session>>,
    counters: Counters,
}

impl ReassemblyEngine {
    /// Create an engine with the default gap policy
    pub fn new(
        base: BaseDomain,
        presence: Ipv4Addr,
        output_root: impl Into<PathBuf>,
        policy: Box<dyn SessionKeyPolicy>,
    ) -> Self {
        Self {
            base,
            presence,
            output_root: output_root.into(),
            gap: GapFill::default(),
            max_chunk_index: DEFAULT_MAX_CHUNK_INDEX,
            policy,
            json_events: false,
            sessions: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Create an engine from receiver configuration
    pub fn from_config(config: &ReceiverConfig) -> Self {
        Self::new(
            config.base_domain(),
            config.presence_ip,
            config.output_root.clone(),
            config.key_policy.strategy(),
        )
        .with_gap_fill(config.gap_fill)
        .with_max_chunk_index(config.max_chunk_index)
        .with_json_events(config.json_events)
    }

    pub fn with_gap_fill(mut self, gap: GapFill) -> Self {
        self.gap = gap;
        self
    }

    /// Highest chunk index accepted; larger indices are dropped on arrival
    pub fn with_max_chunk_index(mut self, max: u64) -> Self {
        self.max_chunk_index = max;
        self
    }

    pub fn with_json_events(mut self, enabled: bool) -> Self {
        self.json_events = enabled;
        self
    }

    pub fn base_domain(&self) -> &BaseDomain {
        &self.base
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    /// Number of sessions currently receiving
    pub fn active_sessions(&self) -> usize {
        self.lock().len()
    }

    /// Handle one inbound query name from `source`.
    ///
    /// Never fails: every problem is reported through [`Outcome`] and the
    /// reply is the fixed presence address for any name under the base domain.
    pub fn handle(&self, qname: &str, source: SocketAddr) -> Handled {
        Counters::bump(&self.counters.queries);

        let Some(labels) = self.base.strip(qname) else {
            Counters::bump(&self.counters.ignored);
            debug!("Ignoring {} from {}: outside {}", qname, source, self.base);
            return Handled {
                reply: Reply::Empty,
                outcome: Outcome::Ignored,
            };
        };

        let key = self.policy.key(&self.base, source);
        let outcome = match Message::parse(&labels) {
            Ok(Message::Apex) => Outcome::Apex,
            Ok(Message::Path { token }) => self.start_session(key, &token),
            Ok(Message::Eof) => self.flush(key, qname),
            Ok(Message::Chunk { index, payload }) => self.store_chunk(key, index, &payload, qname),
            Err(error) if self.has_session(&key) => self.reject(key, qname, error),
            Err(_) => self.orphan(key, qname),
        };

        Handled {
            reply: Reply::Address(self.presence),
            outcome,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionKey, Session>> {
        // A panic while holding the lock leaves the map itself consistent
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn has_session(&self, key: &SessionKey) -> bool {
        self.lock().contains_key(key)
    }

    fn start_session(&self, key: SessionKey, token: &str) -> Outcome {
        let path = restore_path(token);
        let replaced = self
            .lock()
            .insert(key.clone(), Session::new(path.clone()))
            .is_some();

        Counters::bump(&self.counters.sessions_started);
        if replaced {
            info!("[{}] session reset → {}", key, path);
        } else {
            info!("[{}] session start → {}", key, path);
        }
        if self.json_events {
            JsonLogger::session_start(COMPONENT, key.as_str(), &path, replaced);
        }

        Outcome::SessionStarted { key, replaced }
    }

    fn store_chunk(&self, key: SessionKey, index: u64, payload: &str, qname: &str) -> Outcome {
        let mut sessions = self.lock();

        let Some(session) = sessions.get_mut(&key) else {
            drop(sessions);
            return self.orphan(key, qname);
        };

        if index > self.max_chunk_index {
            drop(sessions);
            let error = FerryError::Malformed(format!(
                "chunk index {} above limit {}",
                index, self.max_chunk_index
            ));
            return self.reject(key, qname, error);
        }

        match LabelCodec::decode(payload) {
            Ok(data) => {
                let len = data.len();
                session.store(index, data);
                drop(sessions);

                Counters::bump(&self.counters.chunks_stored);
                debug!("[{}] chunk {} ({} bytes) stored", key, index, len);
                Outcome::ChunkStored { key, index, len }
            }
            Err(error) => {
                drop(sessions);
                self.reject(key, qname, error)
            }
        }
    }

    fn flush(&self, key: SessionKey, qname: &str) -> Outcome {
        let mut sessions = self.lock();

        let Some(session) = sessions.remove(&key) else {
            drop(sessions);
            return self.orphan(key, qname);
        };

        // Written while still holding the table so a racing path announcement
        // for the same key cannot interleave with this flush
        let output = output_path(&self.output_root, &key, &session.path);
        let missing = session.missing();
        let written = session
            .assemble(self.gap)
            .and_then(|data| write_output(&output, &data).map(|()| data));
        drop(sessions);

        match written {
            Ok(data) => {
                Counters::bump(&self.counters.files_flushed);
                if missing.is_empty() {
                    info!("[{}] wrote {} bytes → {}", key, data.len(), output.display());
                } else {
                    warn!(
                        "[{}] wrote {} bytes → {} with {} missing chunk(s): {:?}",
                        key,
                        data.len(),
                        output.display(),
                        missing.len(),
                        missing
                    );
                }
                if self.json_events {
                    JsonLogger::session_flushed(
                        COMPONENT,
                        key.as_str(),
                        &output.to_string_lossy(),
                        data.len(),
                        session.chunk_count(),
                        &missing,
                    );
                }

                Outcome::Flushed(FlushReport {
                    key,
                    output,
                    bytes: data.len(),
                    chunks: session.chunk_count(),
                    missing,
                })
            }
            Err(error) => {
                Counters::bump(&self.counters.flush_failures);
                error!("[{}] flush to {} failed: {}", key, output.display(), error);
                if self.json_events {
                    JsonLogger::flush_failed(
                        COMPONENT,
                        key.as_str(),
                        &output.to_string_lossy(),
                        &error.to_string(),
                    );
                }

                Outcome::FlushFailed { key, output, error }
            }
        }
    }

    fn orphan(&self, key: SessionKey, qname: &str) -> Outcome {
        Counters::bump(&self.counters.orphans);
        let error = FerryError::SessionNotFound(key.to_string());
        warn!("{}, ignoring {}", error, qname);
        if self.json_events {
            JsonLogger::message_dropped(COMPONENT, key.as_str(), qname, &error.to_string());
        }

        Outcome::NoSession { key }
    }

    fn reject(&self, key: SessionKey, qname: &str, error: FerryError) -> Outcome {
        Counters::bump(&self.counters.chunks_dropped);
        warn!("[{}] dropping {}: {}", key, qname, error);
        if self.json_events {
            JsonLogger::message_dropped(COMPONENT, key.as_str(), qname, &error.to_string());
        }

        Outcome::ChunkDropped { key, error }
    }
}

fn write_output(path: &Path, data: &[u8]) -> crate::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
