use thiserror::Error;
use tokio::time::error::Elapsed;

/// Errors from the packet codec (reading/writing a byte buffer).
#[derive(Error, Debug)]
pub enum CodecError {
    /// A read would have consumed more bytes than remain in the buffer.
    #[error("read out of bounds (pos {pos}, wanted {wanted}, len {len})")]
    OutOfBounds {
        pos: usize,
        wanted: usize,
        len: usize,
    },
    /// A C-string read ran off the end of the buffer without finding a NUL.
    #[error("c-string is not null terminated")]
    UnterminatedString,
    /// A string's bytes were not valid UTF-8.
    #[error("string is not valid utf-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// Errors from the UDP transport layer.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to bind local socket")]
    BindFailed(#[source] std::io::Error),
    #[error("failed to connect to remote host")]
    ConnectFailed(#[source] std::io::Error),
    #[error("send failed")]
    SendFailed(#[source] std::io::Error),
    #[error("receive failed")]
    RecvFailed(#[source] std::io::Error),
    #[error("timeout")]
    Timeout(#[from] Elapsed),
}

/// Errors from the master server directory walk. These are fatal to a sweep.
#[derive(Error, Debug)]
pub enum MasterError {
    #[error("transport error")]
    Transport(#[from] TransportError),
    #[error("codec error")]
    Codec(#[from] CodecError),
    #[error("master response did not start with the expected header")]
    BadResponseHeader,
    #[error("filter string exceeds the maximum length")]
    FilterTooLong,
    #[error("callback returned an error: {0}")]
    CallbackFailed(String),
}

/// Errors from querying a single game server. These are isolated per-server
/// and never abort a sweep.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("transport error")]
    Transport(#[from] TransportError),
    #[error("codec error")]
    Codec(#[from] CodecError),
    #[error("packet did not start with a recognized header")]
    BadPacketHeader,
    #[error("unrecognized A2S_INFO version byte: {0:#x}")]
    UnknownInfoVersion(u8),
    /// Internal sentinel used between the A2S_INFO reply dispatch and its
    /// retry/salvage logic. Never returned from a public method.
    #[error("mistaken S2A_PLAYER reply")]
    MistakenReply,
    #[error("challenge response was malformed")]
    BadChallengeResponse,
    #[error("server kept replying with a confused (info/player) packet to a rules challenge")]
    ConfusedChallengeReply,
    #[error("duplicate packet number {0} in a multi-packet reply")]
    DuplicatePacket(u8),
    #[error("packet number {number} is out of range for {total} total packets")]
    BadPacketNumber { number: u8, total: u8 },
    #[error("can't query rules before a successful A2S_INFO query")]
    UnknownGameEngine,
    #[error("rules reply was malformed")]
    BadRulesReply,
    #[error("bzip2 decompressed size {0} exceeds the 1 MiB limit")]
    WrongBz2Size(u32),
    #[error("bzip2 decompressed payload size did not match the declared size")]
    WrongBz2SizeMismatch,
    #[error("bzip2 decompressed payload failed its checksum")]
    WrongBz2Checksum,
    #[error("bzip2 decompression failed")]
    Bz2DecompressFailed(#[from] std::io::Error),
}
