use std::{fmt, io, result};

pub type Result<T> = result::Result<T, Error>;

/// Crate-wide error type.
///
/// Every fatal condition in the restore pipeline maps onto one of these
/// variants. Variants carry the identifying payload (member path, ticket
/// entry name, data type tag) so the terminal log line names the thing
/// that failed.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Command-line arguments could not be interpreted
    Usage(String),
    /// No device found in normal or recovery mode
    DeviceAbsent,
    /// The device identifier (ECID) could not be read
    IdentityUnavailable(String),
    /// A required firmware-bundle member is absent
    ArchiveMember(String),
    /// A property-list tree did not have the expected shape
    Schema(String),
    /// The signing authority rejected the request, was unreachable,
    /// or returned a malformed body
    SigningUnavailable(String),
    /// No ticket entry under the given top-level name
    TicketEntryMissing(String),
    /// No ticket entry whose `Path` matches the query
    TicketPathMissing(String),
    /// A ticket entry exists but violates the expected shape
    TicketEntryMalformed(String),
    /// Tagged-container framing is invalid
    ContainerMalformed(String),
    /// The container holds no signature chunk
    NoSignatureChunk,
    /// An upload or restore-protocol I/O failure
    Transport { stage: &'static str, message: String },
    /// The device refused the restore-protocol handshake
    NotInRestoreMode(String),
    /// The restore agent asked for an unserviceable data type
    UnknownDataType(String),
    /// Host-side I/O failure
    Io(String),
}

impl Error {
    /// Create a schema violation Error
    pub fn schema<S>(context: S) -> Self
    where
        S: Into<String>,
    {
        Self::Schema(context.into())
    }

    /// Create a transport failure Error tagged with the pipeline stage
    pub fn transport<S>(stage: &'static str, message: S) -> Self
    where
        S: Into<String>,
    {
        Self::Transport {
            stage,
            message: message.into(),
        }
    }

    /// Create a signing authority failure Error
    pub fn signing<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::SigningUnavailable(message.into())
    }

    /// Create a container framing Error
    pub fn malformed<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::ContainerMalformed(message.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usage(msg) => write!(f, "usage: {msg}"),
            Self::DeviceAbsent => write!(f, "no device found in normal or recovery mode"),
            Self::IdentityUnavailable(msg) => write!(f, "unable to read device ECID: {msg}"),
            Self::ArchiveMember(path) => write!(f, "missing firmware bundle member: {path}"),
            Self::Schema(ctx) => write!(f, "property list schema violation: {ctx}"),
            Self::SigningUnavailable(msg) => write!(f, "signing authority unavailable: {msg}"),
            Self::TicketEntryMissing(name) => write!(f, "no ticket entry named {name}"),
            Self::TicketPathMissing(path) => write!(f, "no ticket entry with path {path}"),
            Self::TicketEntryMalformed(ctx) => write!(f, "malformed ticket entry: {ctx}"),
            Self::ContainerMalformed(msg) => write!(f, "malformed firmware container: {msg}"),
            Self::NoSignatureChunk => write!(f, "container holds no signature chunk"),
            Self::Transport { stage, message } => {
                write!(f, "transport failure during {stage}: {message}")
            }
            Self::NotInRestoreMode(ty) => {
                write!(f, "device refused restore handshake, reported type: {ty}")
            }
            Self::UnknownDataType(ty) => write!(f, "restore agent requested unknown data type: {ty}"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(format!("{err}"))
    }
}

impl From<plist::Error> for Error {
    fn from(err: plist::Error) -> Self {
        Self::Schema(format!("{err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::SigningUnavailable(format!("{err}"))
    }
}
