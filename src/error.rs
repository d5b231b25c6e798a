use std::io;
use std::path::PathBuf;

/// Errors talking to the enclave-hosted service or the attestation service.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} returned status {status}: {message}")]
    Status {
        endpoint: &'static str,
        status: u16,
        message: String,
    },

    #[error("malformed response from {endpoint}: {reason}")]
    MalformedBody {
        endpoint: &'static str,
        reason: String,
    },

    #[error("missing response header: {0}")]
    MissingHeader(&'static str),

    #[error("server did not issue a session-id cookie")]
    MissingSessionCookie,
}

/// Errors from malformed or unexpected protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("extended EPID group id {0} is not supported (attestation service only accepts 0)")]
    UnsupportedExtendedGroup(u64),

    #[error("server EC public key in msg3 differs from msg1 (possible man-in-the-middle)")]
    PeerKeyMismatch,

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("quote too short: {actual} bytes (need at least {minimum})")]
    QuoteTooShort { actual: usize, minimum: usize },

    #[error("attestation report status not OK: {0}")]
    QuoteStatus(String),

    #[error("attestation service rejected the request: {0}")]
    AttestationService(String),

    #[error("server teardown failed: {0}")]
    CloseFailed(String),

    #[error("empty suffix-array page")]
    EmptyPage,
}

/// Verification failures. Always fatal, treated as an active-attacker signal.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("msg3 CMAC mismatch")]
    Msg3Mac,

    #[error("quote report data does not bind SHA-256(Ga || Gb || VK)")]
    ReportDataBinding,

    #[error("report signing certificate header: {0}")]
    SigningCertificate(String),

    #[error("report signing certificate does not chain to the trusted root: {0}")]
    CertificateChain(String),

    #[error("report signature verification failed: {0}")]
    ReportSignature(String),

    #[error("report quote body is not a prefix of the submitted quote")]
    QuoteBodyMismatch,

    #[error("envelope authentication failed")]
    EnvelopeTag,

    #[error("unexpected enclave measurement: expected {expected}, got {actual}")]
    UnexpectedEnclave { expected: String, actual: String },
}

/// Attestation-service nonce did not round-trip.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("attestation report nonce mismatch: sent {sent:?}, received {received:?}")]
    NonceMismatch { sent: String, received: String },
}

/// Bad local parameters. Recoverable; session state is left untouched.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown ORAM type '{0}' (expected circuit, ring, path, so_circuit, so_ring or so_path)")]
    UnknownOramType(String),

    #[error("missing arguments: {0}")]
    MissingArguments(&'static str),

    #[error("too many arguments")]
    TooManyArguments,

    #[error("cannot parse {field} from '{value}'")]
    InvalidInteger { field: &'static str, value: String },

    #[error("invalid client configuration: {0}")]
    InvalidClient(String),
}

/// Local artifacts that could not be read.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("no character map at {path}: {source}")]
    MissingCharacterMap {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors from the injected crypto primitives.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid EC public key: point is not on P-256")]
    InvalidPublicKey,

    #[error("invalid EC private key")]
    InvalidPrivateKey,

    #[error("ECDSA signing failed")]
    SigningFailed,

    #[error("ECDSA signature verification failed")]
    BadSignature,

    #[error("AEAD encryption failed")]
    SealFailed,

    #[error("AEAD decryption failed: ciphertext is invalid or tampered")]
    OpenFailed,

    #[error("invalid length for {what}: expected {expected}, got {actual}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Precondition failures on the post-handshake session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("no character map loaded; run load first")]
    NoCharacterMap,

    #[error("character {ch:?} at position {position} is not in the character map")]
    UnmappedCharacter { ch: char, position: usize },

    #[error("session not configured; run configure first")]
    NotConfigured,

    #[error("no dataset loaded; run load first")]
    NotLoaded,

    #[error("no query in progress; run query first")]
    NoQuery,
}

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl Error {
    /// Whether this error must tear an established session down.
    ///
    /// Transport failures abort only the current operation. Configuration,
    /// local resource and precondition errors leave the session untouched.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Integrity(_) | Error::Replay(_) | Error::Crypto(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(TransportError::Http(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
