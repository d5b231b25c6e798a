//! The established session: ORAM configuration, dataset loading, encrypted
//! substring queries and suffix-array pagination under SK.

use std::fmt;
use std::sync::Arc;

use bytes::Buf;
use zeroize::Zeroizing;

use super::cursor::{QueryCursor, SuffixPage};
use super::handshake::{AttestationSession, Init};
use super::{ClientConfig, Services};
use crate::attestation::EnclaveIdentity;
use crate::charmap::CharacterMap;
use crate::crypto::envelope::SecureEnvelope;
use crate::crypto::kdf::SessionKeys;
use crate::error::{Error, ProtocolError, Result, SessionError};
use crate::oram::OramConfig;
use crate::transport::{PollStatus, SessionId};

/// Passwords are sent as a fixed 64-byte block.
pub const PASSWORD_LEN: usize = 64;

/// `start` and `end`, both `i32` LE.
const RANGE_LEN: usize = 8;

/// Answer to a substring query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryResult {
    /// First matching suffix-array index.
    pub start: i32,
    /// One past the last matching index, or `-1`.
    pub end: i32,
    pub server_time: i64,
}

impl QueryResult {
    /// Number of suffixes in `[start, end)`.
    pub fn matches(&self) -> u64 {
        u64::try_from(i64::from(self.end) - i64::from(self.start)).unwrap_or(0)
    }
}

/// One benchmark repetition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkRecord {
    pub filename: String,
    pub oram_label: String,
    pub pattern_len: usize,
    pub start: i32,
    pub end: i32,
    pub query_time: i64,
    pub fetch_time: i64,
}

impl fmt::Display for BenchmarkRecord {
    /// `filename,oram_label,pattern_len,start,end,query_time,fetch_time`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{}",
            self.filename,
            self.oram_label,
            self.pattern_len,
            self.start,
            self.end,
            self.query_time,
            self.fetch_time
        )
    }
}

/// Everything that only exists while the session is open.
struct Established {
    session: SessionId,
    identity: EnclaveIdentity,
    keys: SessionKeys,
    charmap: Option<CharacterMap>,
    filename: Option<String>,
    oram_label: Option<String>,
    cursor: Option<QueryCursor>,
}

/// A session confirmed by the attestation handshake.
///
/// Operations run one at a time (`&mut self`). A fatal error, see
/// [`Error::is_fatal`], tears the session down: the server is asked to close
/// it, SK and MK are wiped and every later call fails with
/// [`SessionError::Closed`].
pub struct SecureSession {
    config: Arc<ClientConfig>,
    services: Services,
    inner: Option<Established>,
}

impl fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("SecureSession");
        match &self.inner {
            Some(inner) => s
                .field("session", &inner.session)
                .field("filename", &inner.filename)
                .field("oram_label", &inner.oram_label)
                .field("cursor", &inner.cursor),
            None => s.field("closed", &true),
        };
        s.finish_non_exhaustive()
    }
}

impl SecureSession {
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        services: Services,
        session: SessionId,
        identity: EnclaveIdentity,
        keys: SessionKeys,
    ) -> Self {
        Self {
            config,
            services,
            inner: Some(Established {
                session,
                identity,
                keys,
                charmap: None,
                filename: None,
                oram_label: None,
                cursor: None,
            }),
        }
    }

    fn established(&self) -> Result<&Established> {
        self.inner.as_ref().ok_or_else(|| SessionError::Closed.into())
    }

    fn established_mut(&mut self) -> Result<&mut Established> {
        self.inner.as_mut().ok_or_else(|| SessionError::Closed.into())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.inner.as_ref().map(|inner| &inner.session)
    }

    pub fn enclave_identity(&self) -> Result<&EnclaveIdentity> {
        Ok(&self.established()?.identity)
    }

    /// Remote dataset name, once loaded.
    pub fn filename(&self) -> Option<&str> {
        self.inner.as_ref()?.filename.as_deref()
    }

    /// `<oram_type>Z<Z>`, once configured.
    pub fn oram_label(&self) -> Option<&str> {
        self.inner.as_ref()?.oram_label.as_deref()
    }

    /// Cursor of the current query.
    pub fn cursor(&self) -> Option<&QueryCursor> {
        self.inner.as_ref()?.cursor.as_ref()
    }

    /// Tear the session down if `result` is fatal.
    async fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                if let Some(inner) = self.inner.take() {
                    tracing::warn!(session = ?inner.session, error = %err, "fatal session error, closing");
                    if let Err(close_err) = self.services.enclave.close(&inner.session).await {
                        tracing::warn!(error = %close_err, "best-effort close failed");
                    }
                }
            }
        }
        result
    }

    /// Server-side state of the session.
    pub async fn poll(&mut self) -> Result<PollStatus> {
        let session = self.established()?.session.clone();
        let result = self.services.enclave.poll(&session).await;
        self.settle(result).await
    }

    /// Send the ORAM parameters, CMAC'd under SK with a zero IV.
    pub async fn configure(&mut self, oram: &OramConfig) -> Result<()> {
        let result = self.try_configure(oram).await;
        self.settle(result).await
    }

    async fn try_configure(&mut self, oram: &OramConfig) -> Result<()> {
        let inner = self.established()?;
        let request =
            SecureEnvelope::signed(self.services.crypto.as_ref(), &inner.keys.sk, oram.encode());
        self.services
            .enclave
            .configure(&inner.session, &request)
            .await?;

        let label = oram.label();
        tracing::info!(oram = %label, "ORAM configured");
        self.established_mut()?.oram_label = Some(label);
        Ok(())
    }

    /// Load `remote_filename` on the server, unlocking it with `password`.
    ///
    /// The character map `<map_dir>/<remote_filename>.map` is read first; if
    /// it is missing nothing is sent.
    pub async fn load(&mut self, remote_filename: &str, password: &str) -> Result<()> {
        let result = self.try_load(remote_filename, password).await;
        self.settle(result).await
    }

    async fn try_load(&mut self, remote_filename: &str, password: &str) -> Result<()> {
        let inner = self.established()?;
        let path = CharacterMap::path_for(&self.config.map_dir, remote_filename);
        let charmap = CharacterMap::load(&path).await?;

        let block = password_block(password);
        let request = SecureEnvelope::seal(
            self.services.crypto.as_ref(),
            &inner.keys.sk,
            block.as_slice(),
            remote_filename.as_bytes(),
        )?;
        self.services.enclave.load(&inner.session, &request).await?;

        tracing::info!(
            filename = remote_filename,
            alphabet = charmap.as_str().chars().count(),
            "dataset loaded"
        );
        let inner = self.established_mut()?;
        inner.filename = Some(remote_filename.to_string());
        inner.charmap = Some(charmap);
        inner.cursor = None;
        Ok(())
    }

    /// Look `pattern` up and reset the cursor to the matching range, bounded
    /// to `max_occurrences` page fetches (`None`: unbounded).
    pub async fn query(
        &mut self,
        pattern: &str,
        max_occurrences: Option<u64>,
    ) -> Result<QueryResult> {
        let result = self.try_query(pattern, max_occurrences).await;
        self.settle(result).await
    }

    async fn try_query(
        &mut self,
        pattern: &str,
        max_occurrences: Option<u64>,
    ) -> Result<QueryResult> {
        let inner = self.established()?;
        let charmap = inner.charmap.as_ref().ok_or(SessionError::NoCharacterMap)?;
        let encoded = charmap.encode(pattern)?;

        let crypto = self.services.crypto.as_ref();
        let request = SecureEnvelope::seal(crypto, &inner.keys.sk, &encoded, &[])?;
        let response = self
            .services
            .enclave
            .substring(&inner.session, &request)
            .await?;
        let (plaintext, server_time) = response.open_timed(crypto, &inner.keys.sk)?;

        if plaintext.len() != RANGE_LEN {
            return Err(ProtocolError::InvalidField {
                field: "substring range",
                reason: format!("expected {RANGE_LEN} bytes, got {}", plaintext.len()),
            }
            .into());
        }
        let mut buf = plaintext.as_slice();
        let result = QueryResult {
            start: buf.get_i32_le(),
            end: buf.get_i32_le(),
            server_time,
        };

        tracing::debug!(
            pattern_len = encoded.len(),
            start = result.start,
            end = result.end,
            server_time,
            "substring range received"
        );
        self.established_mut()?.cursor = Some(
            QueryCursor::new(result.start, result.end, server_time)
                .with_max_occurrences(max_occurrences),
        );
        Ok(result)
    }

    /// Fetch and classify the next page of the current query's range.
    pub async fn fetch_suffix_page(&mut self) -> Result<SuffixPage> {
        let result = self.try_fetch_suffix_page().await;
        self.settle(result).await
    }

    async fn try_fetch_suffix_page(&mut self) -> Result<SuffixPage> {
        let inner = self.established()?;
        if inner.cursor.is_none() {
            return Err(SessionError::NoQuery.into());
        }

        let response = self.services.enclave.suffix(&inner.session).await?;
        let (plaintext, server_time) =
            response.open_timed(self.services.crypto.as_ref(), &inner.keys.sk)?;
        let positions = decode_positions(&plaintext)?;

        let cursor = self
            .established_mut()?
            .cursor
            .as_mut()
            .ok_or(SessionError::NoQuery)?;
        Ok(cursor.apply_page(positions, server_time)?)
    }

    /// Repeat query plus page loop `reps` times. Each repetition fetches
    /// pages until `max_occurrences` pages were fetched (`None`: unbounded)
    /// or the range is exhausted.
    pub async fn benchmark(
        &mut self,
        pattern: &str,
        reps: usize,
        max_occurrences: Option<u64>,
    ) -> Result<Vec<BenchmarkRecord>> {
        let inner = self.established()?;
        let filename = inner.filename.clone().ok_or(SessionError::NotLoaded)?;
        let oram_label = inner.oram_label.clone().ok_or(SessionError::NotConfigured)?;

        let mut records = Vec::with_capacity(reps);
        for rep in 0..reps {
            let found = self.query(pattern, max_occurrences).await?;
            while self.cursor().map_or(false, QueryCursor::wants_more) {
                self.fetch_suffix_page().await?;
            }
            let cursor = self.cursor().cloned().ok_or(SessionError::NoQuery)?;

            tracing::debug!(
                rep,
                pages = cursor.pages(),
                occurrences = cursor.occurrences(),
                fetch_time = cursor.fetch_time(),
                "benchmark repetition done"
            );
            records.push(BenchmarkRecord {
                filename: filename.clone(),
                oram_label: oram_label.clone(),
                pattern_len: pattern.chars().count(),
                start: found.start,
                end: found.end,
                query_time: cursor.query_time(),
                fetch_time: cursor.fetch_time(),
            });
        }
        Ok(records)
    }

    /// `DELETE /close`. The keys are wiped whether or not the server
    /// acknowledges; a refusal is reported as [`ProtocolError::CloseFailed`].
    pub async fn close(&mut self) -> Result<()> {
        let inner = self.inner.take().ok_or(SessionError::Closed)?;
        let result = self.services.enclave.close(&inner.session).await;
        drop(inner);
        match result {
            Ok(()) => {
                tracing::info!("session closed");
                Ok(())
            }
            Err(e) => Err(ProtocolError::CloseFailed(e.to_string()).into()),
        }
    }

    /// Start over with a fresh ephemeral key. Keys still held are wiped
    /// without notifying the server.
    pub fn restart(self) -> AttestationSession<Init> {
        AttestationSession::new(self.config, self.services)
    }
}

/// ASCII characters of `password`, truncated or zero-padded.
fn password_block(password: &str) -> Zeroizing<[u8; PASSWORD_LEN]> {
    let mut block = Zeroizing::new([0u8; PASSWORD_LEN]);
    for (slot, byte) in block
        .iter_mut()
        .zip(password.chars().filter(char::is_ascii).map(|c| c as u8))
    {
        *slot = byte;
    }
    block
}

/// Page plaintext as `i32` LE positions.
fn decode_positions(plaintext: &[u8]) -> std::result::Result<Vec<i32>, Error> {
    if plaintext.len() % 4 != 0 {
        return Err(ProtocolError::InvalidField {
            field: "suffix page",
            reason: format!("{} bytes is not a whole number of positions", plaintext.len()),
        }
        .into());
    }
    let mut buf = plaintext;
    let mut positions = Vec::with_capacity(plaintext.len() / 4);
    while buf.has_remaining() {
        positions.push(buf.get_i32_le());
    }
    Ok(positions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_ascii_padded_block() {
        let block = password_block("pässword");
        assert_eq!(&block[..7], b"pssword");
        assert!(block[7..].iter().all(|b| *b == 0));

        let long = "x".repeat(100);
        assert_eq!(password_block(&long).as_slice(), &[b'x'; PASSWORD_LEN]);
    }

    #[test]
    fn positions_are_little_endian_words() {
        let mut bytes = Vec::new();
        for p in [7i32, -1, 1 << 20] {
            bytes.extend_from_slice(&p.to_le_bytes());
        }
        assert_eq!(decode_positions(&bytes).unwrap(), vec![7, -1, 1 << 20]);
        assert!(matches!(
            decode_positions(&bytes[..5]),
            Err(Error::Protocol(ProtocolError::InvalidField { .. }))
        ));
    }

    #[test]
    fn benchmark_record_is_csv() {
        let record = BenchmarkRecord {
            filename: "ecoli".into(),
            oram_label: "ringZ4".into(),
            pattern_len: 5,
            start: 10,
            end: 42,
            query_time: 1200,
            fetch_time: 900,
        };
        assert_eq!(record.to_string(), "ecoli,ringZ4,5,10,42,1200,900");
    }

    #[test]
    fn query_result_match_count() {
        let found = QueryResult {
            start: 10,
            end: 42,
            server_time: 0,
        };
        assert_eq!(found.matches(), 32);
        let none = QueryResult {
            start: 10,
            end: -1,
            server_time: 0,
        };
        assert_eq!(none.matches(), 0);
    }
}
