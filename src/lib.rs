pub mod attestation;
pub mod charmap;
pub mod crypto;
pub mod error;
pub mod oram;
pub mod session;
pub mod transport;

// Re-export key types at crate root for convenience.
pub use attestation::{EnclaveIdentity, ReportValidator};
pub use charmap::CharacterMap;
pub use crypto::envelope::SecureEnvelope;
pub use crypto::{CryptoProvider, RustCryptoProvider};
pub use error::{Error, Result};
pub use oram::{OramConfig, OramKind};
pub use session::client::{BenchmarkRecord, QueryResult, SecureSession};
pub use session::cursor::{Placement, QueryCursor, SuffixEntry, SuffixPage};
pub use session::handshake::AttestationSession;
pub use session::{ClientConfig, Services};
pub use transport::{AttestationService, EnclaveService, PollStatus, SessionId};

#[cfg(feature = "mock")]
pub use transport::mock::{MockAttestationService, MockEnclave};
