//! Per-subsystem error types.
//!
//! Failures surface as named variants rather than sentinel return codes;
//! transient conditions the protocols absorb internally (lost packets,
//! retried transmissions) never appear here.

use thiserror::Error;

use crate::drivers::disk::DiskReply;

/// Datagram (minimsg) errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MsgError {
    #[error("port number out of range")]
    PortOutOfRange,
    #[error("no bound port numbers available")]
    NoMorePorts,
    #[error("payload exceeds the maximum datagram size")]
    PayloadTooLarge,
    #[error("port does not exist")]
    NoSuchPort,
    #[error("send failed: {0}")]
    Send(#[from] RouteError),
}

/// Reliable stream (minisocket) errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SocketError {
    #[error("port number out of range")]
    PortOutOfBound,
    #[error("port already in use")]
    PortInUse,
    #[error("no free ports")]
    NoMorePorts,
    #[error("no server answered the handshake")]
    NoServer,
    #[error("server is busy with another connection")]
    Busy,
    #[error("send failed")]
    SendError,
    #[error("receive failed")]
    ReceiveError,
}

/// Routing-layer errors; discovery failure propagates as a send failure
/// in the calling subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("route discovery timed out")]
    DiscoveryTimeout,
    #[error("network is not initialized")]
    LinkDown,
}

/// Filesystem errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("disk request failed: {0:?}")]
    Disk(DiskReply),
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("file exists")]
    Exists,
    #[error("no free data blocks")]
    NoSpace,
    #[error("no free inodes")]
    NoInodes,
    #[error("operation not permitted in this open mode")]
    BadMode,
    #[error("invalid open mode")]
    InvalidMode,
    #[error("invalid path")]
    InvalidPath,
    #[error("name too long")]
    NameTooLong,
    #[error("root directory cannot be removed")]
    RootForbidden,
    #[error("in-memory inode table is full")]
    InodeTableFull,
    #[error("superblock is not recognized")]
    BadSuperblock,
    #[error("filesystem is not mounted")]
    NotMounted,
    #[error("bitmaps and free counters disagree")]
    Inconsistent,
    #[error("file exceeds the maximum supported size")]
    FileTooLarge,
}

/// Disk-image tool errors (mkfs/fsck run against the image directly).
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image is inconsistent: {0}")]
    Corrupt(String),
}
