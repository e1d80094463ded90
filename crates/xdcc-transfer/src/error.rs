use std::io;

/// Typed failures surfaced by the transfer engine. The API front-end and
/// the Supervisor map these to the `dlerror` envelope; nothing here panics.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("malformed CTCP payload: {0}")]
    MalformedCtcp(#[from] crate::protocol::ParseError),

    #[error("unexpected DCC command {command:?} while awaiting {expected}")]
    UnexpectedDccCommand { command: String, expected: &'static str },

    #[error("DCC ACCEPT offset {got} does not match requested resume offset {expected}")]
    AcceptMismatch { expected: u64, got: u64 },

    #[error("peer offered address {0} which is rejected by DCC_REJECT_PRIVATE_IP")]
    RejectedPrivateAddress(std::net::Ipv4Addr),

    #[error("failed to prepare destination directory {path:?}: {source}")]
    DestinationDir {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to stat partial file {path:?}: {source}")]
    PartialStat {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove partial file {path:?}: {source}")]
    PartialUnlink {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open partial file {path:?} for append: {source}")]
    PartialOpen {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to rename {from:?} to {to:?}: {source}")]
    Rename {
        from: std::path::PathBuf,
        to: std::path::PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to peer {addr}: {source}")]
    Connect {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("data channel read failed: {0}")]
    Read(#[source] io::Error),

    #[error("data channel write failed: {0}")]
    Write(#[source] io::Error),

    #[error("data channel idle for longer than the configured timeout")]
    IdleTimeout,

    #[error("IRC event channel closed while awaiting a DCC reply")]
    IrcChannelClosed,

    #[error("peer closed the connection after {received} of {expected} bytes")]
    ShortTransfer { received: u64, expected: u64 },
}

pub type Result<T> = std::result::Result<T, TransferError>;
