/// Transfer logging trait for structured remote logging.
///
/// The engine never calls `tracing` macros directly from inside a
/// `Transfer` — every state change and ACK tick is funneled through a
/// `TransferLogger`, so the server binary can wire it straight to
/// `tracing` while tests wire it to something that records calls.
use std::fmt;

/// Structured log entry for a single transfer.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    /// The registry key (`"<filename>|<port>"`) identifying the transfer.
    pub transfer_key: String,
    pub event: TransferEvent,
}

/// Events emitted over a transfer's lifetime, from CTCP negotiation through
/// to a terminal state.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// `DCC SEND` offer received and accepted for processing.
    Negotiating { bot: String, file_size: u64 },
    /// A `.part` file already existed; resuming from `offset`.
    ResumeRequested { offset: u64 },
    /// Peer confirmed the resume offset via `DCC ACCEPT`.
    AcceptConfirmed { offset: u64 },
    /// TCP data connection established to the peer.
    Connected { peer_addr: String },
    /// Throttled progress tick (emitted at the configured percent interval).
    Progress {
        received: u64,
        file_size: u64,
        percent: u8,
        speed_bps: f64,
    },
    /// Transfer finished and the `.part` file was renamed to its final name.
    Complete { total_bytes: u64, duration_ms: u64 },
    /// Transfer aborted; `received` bytes were kept in the `.part` file.
    Error { message: String, received: u64 },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Negotiating { bot, file_size } => {
                write!(f, "negotiating bot={} file_size={}", bot, file_size)
            }
            Self::ResumeRequested { offset } => {
                write!(f, "resume_requested offset={}", offset)
            }
            Self::AcceptConfirmed { offset } => {
                write!(f, "accept_confirmed offset={}", offset)
            }
            Self::Connected { peer_addr } => {
                write!(f, "connected peer={}", peer_addr)
            }
            Self::Progress {
                received,
                file_size,
                percent,
                speed_bps,
            } => write!(
                f,
                "progress received={} file_size={} percent={} speed_bps={:.0}",
                received, file_size, percent, speed_bps
            ),
            Self::Complete {
                total_bytes,
                duration_ms,
            } => write!(
                f,
                "complete total_bytes={} duration_ms={}",
                total_bytes, duration_ms
            ),
            Self::Error { message, received } => {
                write!(f, "error received={} message={}", received, message)
            }
        }
    }
}

/// Trait for transfer logging. The server wires this to `tracing`;
/// tests can wire it to an in-memory recorder or discard entirely.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // Terminal and negotiation events are info; per-tick progress is debug.
        match &entry.event {
            TransferEvent::Progress { .. } => {
                tracing::debug!(
                    component = entry.component,
                    transfer = %entry.transfer_key,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::info!(
                    component = entry.component,
                    transfer = %entry.transfer_key,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
