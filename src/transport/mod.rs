//! Service seams: the enclave-hosted search service and the remote
//! attestation service.

/// reqwest-backed implementations.
pub mod http;

/// In-process simulated enclave and attestation service.
#[cfg(feature = "mock")]
pub mod mock;

pub mod wire;

use std::fmt;

use async_trait::async_trait;

use crate::crypto::envelope::SecureEnvelope;
use crate::error::Result;
use wire::{Msg2, Msg3, ReportRequest, StartSessionResponse};

/// Opaque server-issued session token, sent back as the `session-id` cookie.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value of the `Cookie` request header.
    pub fn cookie(&self) -> String {
        format!("session-id={}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Enough to correlate log lines.
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "SessionId({prefix}..)")
    }
}

/// Server-side state of an attestation context, as reported by `/poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Ready,
    Busy,
    NotFound,
}

/// Raw attestation-service report: body bytes exactly as signed, plus the
/// two verification headers.
#[derive(Debug, Clone)]
pub struct ReportResponse {
    pub body: Vec<u8>,
    /// `X-IASReport-Signing-Certificate`, still percent-encoded.
    pub signing_certificate: String,
    /// `X-IASReport-Signature`, base64.
    pub signature: String,
}

/// The enclave-hosted search service.
///
/// Every call after [`EnclaveService::start_session`] is authenticated by the
/// session cookie. Implementations map any non-success status to
/// [`TransportError::Status`](crate::error::TransportError::Status) carrying
/// the server's error string.
#[async_trait]
pub trait EnclaveService: Send + Sync {
    /// `GET /start_session`: msg0 and msg1.
    async fn start_session(&self) -> Result<(SessionId, StartSessionResponse)>;

    /// `POST /attestation/1`: send msg2, receive msg3.
    async fn exchange_msg2(&self, session: &SessionId, msg2: &Msg2) -> Result<Msg3>;

    /// `POST /attestation/2`: msg4 confirmation.
    async fn confirm(&self, session: &SessionId, msg4: &SecureEnvelope) -> Result<()>;

    /// `DELETE /attestation`: drop a handshake in progress.
    async fn abort_attestation(&self, session: &SessionId) -> Result<()>;

    /// `GET /poll`.
    async fn poll(&self, session: &SessionId) -> Result<PollStatus>;

    /// `POST /configure` with a CMAC-signed ORAM configuration.
    async fn configure(&self, session: &SessionId, request: &SecureEnvelope) -> Result<()>;

    /// `POST /load` with the encrypted password and plaintext filename.
    async fn load(&self, session: &SessionId, request: &SecureEnvelope) -> Result<()>;

    /// `GET /substring` with an encrypted encoded pattern.
    async fn substring(
        &self,
        session: &SessionId,
        request: &SecureEnvelope,
    ) -> Result<SecureEnvelope>;

    /// `GET /suffix`: next page of the matching suffix-array range.
    async fn suffix(&self, session: &SessionId) -> Result<SecureEnvelope>;

    /// `DELETE /close`: tear down an established session.
    async fn close(&self, session: &SessionId) -> Result<()>;
}

/// The remote attestation service.
#[async_trait]
pub trait AttestationService: Send + Sync {
    /// Signature revocation list for an EPID group (hex, big-endian).
    /// `None` when the group has no revocations.
    async fn sigrl(&self, group_id: &str) -> Result<Option<String>>;

    /// Submit a quote for verification.
    async fn report(&self, request: &ReportRequest) -> Result<ReportResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header() {
        let id = SessionId::new("0123456789abcdef");
        assert_eq!(id.cookie(), "session-id=0123456789abcdef");
        assert_eq!(format!("{id:?}"), "SessionId(01234567..)");
    }
}
