//! In-process stand-ins for the enclave-hosted service and the attestation
//! service.
//!
//! [`MockEnclave`] plays the enclave's side of every message: it checks
//! msg2's signature and MAC, builds a quote that binds the key exchange,
//! derives SK, and answers queries over an in-memory text with a naive
//! suffix array. [`MockAttestationService`] signs reports with a synthetic
//! PKI from [`ReportSigningAuthority`].
//!
//! # Security Warning
//!
//! Nothing here is an enclave. Enable only via `features = ["mock"]` for
//! development and testing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, BytesMut};

use super::wire::{Msg0, Msg1, Msg2, Msg3, ReportRequest, StartSessionResponse};
use super::{AttestationService, EnclaveService, PollStatus, ReportResponse, SessionId};
use crate::attestation::quote::{
    binding_digest, ISV_PROD_ID, ISV_SVN, MIN_QUOTE_LEN, MR_ENCLAVE, REPORT_DATA_BINDING,
};
use crate::attestation::testing::{report_body, ReportSigningAuthority};
use crate::attestation::{EnclaveIdentity, ReportValidator};
use crate::crypto::envelope::SecureEnvelope;
use crate::crypto::kdf::{self, PrimaryKeys};
use crate::crypto::{CryptoProvider, EcPoint, EphemeralKeyPair, SymmetricKey, COORD_LEN};
use crate::error::{Error, IntegrityError, Result, TransportError};
use crate::oram::ENCODED_LEN;
use crate::session::client::PASSWORD_LEN;
use crate::session::handshake::service_provider_key;

/// Length of the msg3 security properties blob.
const SECURITY_PROP_LEN: usize = 256;

/// Ways the mock enclave can corrupt msg0/msg1/msg3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tamper {
    /// Flip one quote bit after msg3 was MAC'd.
    QuoteBit,
    /// Corrupt the report data before msg3 is MAC'd.
    ReportData,
    /// Report a different server key in msg3 than in msg1.
    ServerKey,
    /// Corrupt `cmac_m`.
    Msg3Mac,
}

/// A dataset the mock enclave can load.
#[derive(Debug, Clone)]
pub struct MockDataset {
    pub name: String,
    pub password: String,
    /// Character map shared with the client; query codes index into it.
    pub alphabet: String,
    pub text: String,
}

impl MockDataset {
    pub fn new(
        name: impl Into<String>,
        password: impl Into<String>,
        alphabet: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
            alphabet: alphabet.into(),
            text: text.into(),
        }
    }

    /// Suffix array over the characters of `text`.
    fn suffix_array(&self) -> (Vec<char>, Vec<i32>) {
        let chars: Vec<char> = self.text.chars().collect();
        let mut suffixes: Vec<usize> = (0..chars.len()).collect();
        suffixes.sort_by(|a, b| chars[*a..].cmp(&chars[*b..]));
        let suffixes = suffixes
            .into_iter()
            .map(|i| i32::try_from(i).unwrap_or(i32::MAX))
            .collect();
        (chars, suffixes)
    }

    /// Half-open suffix-array range of suffixes starting with `pattern`.
    fn range(&self, pattern: &[char]) -> (i32, i32) {
        let (chars, suffixes) = self.suffix_array();
        let prefix = |i: i32| {
            let start = usize::try_from(i).unwrap_or(0);
            let end = (start + pattern.len()).min(chars.len());
            chars[start..end].to_vec()
        };
        let lo = suffixes.partition_point(|i| prefix(*i).as_slice() < pattern);
        let hi = suffixes.partition_point(|i| prefix(*i).as_slice() <= pattern);
        (
            i32::try_from(lo).unwrap_or(i32::MAX),
            i32::try_from(hi).unwrap_or(i32::MAX),
        )
    }
}

/// Behaviour of a [`MockEnclave`].
#[derive(Debug, Clone)]
pub struct MockEnclaveOptions {
    pub identity: EnclaveIdentity,
    /// Raw `extended_epid_group_id` bytes (little-endian).
    pub extended_group_id: Vec<u8>,
    /// EPID group id as sent in msg1 (little-endian).
    pub group_id: [u8; 4],
    /// Acknowledgement the enclave expects in msg4.
    pub ack: Vec<u8>,
    pub tamper: Option<Tamper>,
    /// Entries per suffix page.
    pub page_len: usize,
    pub datasets: Vec<MockDataset>,
    /// Server time reported with query answers.
    pub query_time: i64,
    /// Server time reported with each suffix page.
    pub page_time: i64,
    /// Refuse `DELETE /close` with this status.
    pub refuse_close: Option<u16>,
    /// Corrupt the tag of every query and page response.
    pub corrupt_responses: bool,
}

impl Default for MockEnclaveOptions {
    fn default() -> Self {
        Self {
            identity: EnclaveIdentity {
                mr_enclave: [0x5A; 32],
                product_id: 1,
                svn: 3,
            },
            extended_group_id: vec![0; 4],
            group_id: [0x0B, 0x0A, 0x00, 0x00],
            ack: crate::session::DEFAULT_ACK.to_vec(),
            tamper: None,
            page_len: 4,
            datasets: Vec::new(),
            query_time: 1_000,
            page_time: 100,
            refuse_close: None,
            corrupt_responses: false,
        }
    }
}

/// One server-side session.
struct MockSession {
    keypair: EphemeralKeyPair,
    primary: Option<PrimaryKeys>,
    sk: Option<SymmetricKey>,
    confirmed: bool,
    configured: bool,
    dataset: Option<MockDataset>,
    /// Aligned suffix-array index of the next page.
    next_page: Option<i64>,
}

#[derive(Default)]
struct MockState {
    sessions: HashMap<String, MockSession>,
    calls: Vec<&'static str>,
    msg2s: Vec<Msg2>,
}

/// Simulated enclave-hosted search service.
pub struct MockEnclave {
    crypto: Arc<dyn CryptoProvider>,
    options: MockEnclaveOptions,
    state: Mutex<MockState>,
}

impl MockEnclave {
    pub fn new(crypto: Arc<dyn CryptoProvider>, options: MockEnclaveOptions) -> Self {
        Self {
            crypto,
            options,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Endpoints hit so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    /// Every msg2 received, in order.
    pub fn msg2s(&self) -> Vec<Msg2> {
        self.lock().msg2s.clone()
    }

    /// Sessions the server still holds.
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the call and run `f` against the caller's session.
    fn with_session<T>(
        &self,
        endpoint: &'static str,
        session: &SessionId,
        f: impl FnOnce(&mut MockSession) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock();
        state.calls.push(endpoint);
        let entry = state
            .sessions
            .get_mut(session.as_str())
            .ok_or_else(|| reject(endpoint, 404, "unknown session"))?;
        f(entry)
    }

    fn session_key<'a>(
        endpoint: &'static str,
        session: &'a MockSession,
    ) -> Result<&'a SymmetricKey> {
        match (&session.sk, session.confirmed) {
            (Some(sk), true) => Ok(sk),
            _ => Err(reject(endpoint, 403, "attestation not complete")),
        }
    }

    fn answer_msg2(&self, session: &mut MockSession, msg2: &Msg2) -> Result<Msg3> {
        let sigrl_size = msg2.sigrl.as_deref().map_or(0, sigrl_len);
        if usize::try_from(msg2.sigrl_size).ok() != Some(sigrl_size) {
            return Err(reject("/attestation/1", 400, "sigrl size mismatch"));
        }
        let crypto = self.crypto.as_ref();
        let ga = session.keypair.public;
        let gb: EcPoint = msg2.sgx_client_ec_pubkey.into();

        let mut shared = crypto
            .ecdh(&session.keypair.secret, &gb)
            .map_err(|e| reject("/attestation/1", 400, &e.to_string()))?;
        shared.reverse();
        let keys = kdf::derive_primary(crypto, &shared);

        let mut r = msg2.sig_sp.x_coord;
        let mut s = msg2.sig_sp.y_coord;
        let mut blob = Vec::with_capacity(4 * COORD_LEN + 20);
        blob.extend_from_slice(&gb.to_bytes());
        blob.extend_from_slice(&msg2.spid);
        blob.extend_from_slice(&msg2.quote_type.to_le_bytes());
        blob.extend_from_slice(&msg2.kdf.to_le_bytes());
        blob.extend_from_slice(&r);
        blob.extend_from_slice(&s);
        if crypto.cmac(&keys.smk, &blob) != msg2.cmac_a {
            return Err(reject("/attestation/1", 400, "msg2 MAC check failed"));
        }

        r.reverse();
        s.reverse();
        let sp_public = crypto.public_key(&service_provider_key()?)?;
        let mut signed = Vec::with_capacity(4 * COORD_LEN);
        signed.extend_from_slice(&gb.to_bytes());
        signed.extend_from_slice(&ga.to_bytes());
        crypto
            .ecdsa_verify(&sp_public, &signed, &r, &s)
            .map_err(|_| reject("/attestation/1", 400, "service provider signature invalid"))?;

        let mut quote = self.quote(&binding_digest(crypto, &ga, &gb, &keys.vk));
        if self.options.tamper == Some(Tamper::ReportData) {
            quote[REPORT_DATA_BINDING.start] ^= 0x01;
        }
        let security_prop = vec![0u8; SECURITY_PROP_LEN];

        let mut mac_input = Vec::new();
        mac_input.extend_from_slice(&ga.to_bytes());
        mac_input.extend_from_slice(&security_prop);
        mac_input.extend_from_slice(&quote);
        let mut cmac_m = crypto.cmac(&keys.smk, &mac_input);

        let mut server_key = ga;
        match self.options.tamper {
            Some(Tamper::QuoteBit) => quote[MR_ENCLAVE.start] ^= 0x80,
            Some(Tamper::Msg3Mac) => cmac_m[0] ^= 0x01,
            Some(Tamper::ServerKey) => server_key = crypto.generate_keypair().public,
            _ => {}
        }

        session.primary = Some(keys);
        Ok(Msg3 {
            sgx_server_ec_pubkey: server_key.into(),
            quote,
            security_prop,
            cmac_m,
        })
    }

    fn quote(&self, binding: &[u8; 32]) -> Vec<u8> {
        let identity = &self.options.identity;
        let mut quote = vec![0u8; MIN_QUOTE_LEN + 64];
        quote[0..2].copy_from_slice(&2u16.to_le_bytes());
        quote[MR_ENCLAVE].copy_from_slice(&identity.mr_enclave);
        quote[ISV_PROD_ID..ISV_PROD_ID + 2].copy_from_slice(&identity.product_id.to_le_bytes());
        quote[ISV_SVN..ISV_SVN + 2].copy_from_slice(&identity.svn.to_le_bytes());
        quote[REPORT_DATA_BINDING].copy_from_slice(binding);
        quote
    }

    fn page(&self, dataset: &MockDataset, first: i64) -> Vec<i32> {
        let (_, suffixes) = dataset.suffix_array();
        (0..self.options.page_len)
            .map(|offset| {
                usize::try_from(first)
                    .ok()
                    .and_then(|first| suffixes.get(first + offset).copied())
                    .unwrap_or(-1)
            })
            .collect()
    }
}

#[async_trait]
impl EnclaveService for MockEnclave {
    async fn start_session(&self) -> Result<(SessionId, StartSessionResponse)> {
        let mut id = [0u8; 16];
        self.crypto.random_bytes(&mut id);
        let id = hex::encode(id);
        let keypair = self.crypto.generate_keypair();

        let response = StartSessionResponse {
            msg0: Msg0 {
                extended_epid_group_id: self.options.extended_group_id.clone(),
            },
            msg1: Msg1 {
                sgx_server_ec_pubkey: keypair.public.into(),
                sgx_epid_group_id: self.options.group_id.to_vec(),
            },
        };

        let mut state = self.lock();
        state.calls.push("/start_session");
        state.sessions.insert(
            id.clone(),
            MockSession {
                keypair,
                primary: None,
                sk: None,
                confirmed: false,
                configured: false,
                dataset: None,
                next_page: None,
            },
        );
        Ok((SessionId::new(id), response))
    }

    async fn exchange_msg2(&self, session: &SessionId, msg2: &Msg2) -> Result<Msg3> {
        self.lock().msg2s.push(msg2.clone());
        self.with_session("/attestation/1", session, |s| self.answer_msg2(s, msg2))
    }

    async fn confirm(&self, session: &SessionId, msg4: &SecureEnvelope) -> Result<()> {
        let crypto = self.crypto.as_ref();
        self.with_session("/attestation/2", session, |s| {
            let keys = s
                .primary
                .as_ref()
                .ok_or_else(|| reject("/attestation/2", 409, "msg2 not received"))?;
            let session_keys = kdf::derive_session(crypto, &keys.kdk);
            msg4.verify_signed(crypto, &session_keys.sk)
                .map_err(|_| reject("/attestation/2", 400, "msg4 MAC check failed"))?;
            if msg4.payload != self.options.ack {
                return Err(reject("/attestation/2", 400, "unexpected acknowledgement"));
            }
            s.sk = Some(session_keys.sk);
            s.confirmed = true;
            Ok(())
        })
    }

    async fn abort_attestation(&self, session: &SessionId) -> Result<()> {
        let mut state = self.lock();
        state.calls.push("DELETE /attestation");
        state
            .sessions
            .remove(session.as_str())
            .map(|_| ())
            .ok_or_else(|| reject("/attestation", 404, "unknown session"))
    }

    async fn poll(&self, session: &SessionId) -> Result<PollStatus> {
        let mut state = self.lock();
        state.calls.push("/poll");
        Ok(match state.sessions.get(session.as_str()) {
            Some(s) if s.confirmed => PollStatus::Ready,
            Some(_) => PollStatus::Busy,
            None => PollStatus::NotFound,
        })
    }

    async fn configure(&self, session: &SessionId, request: &SecureEnvelope) -> Result<()> {
        let crypto = self.crypto.as_ref();
        self.with_session("/configure", session, |s| {
            let sk = Self::session_key("/configure", s)?;
            request
                .verify_signed(crypto, sk)
                .map_err(|_| reject("/configure", 400, "configuration MAC check failed"))?;
            if request.payload.len() != ENCODED_LEN {
                return Err(reject("/configure", 400, "configuration must be 7 words"));
            }
            s.configured = true;
            Ok(())
        })
    }

    async fn load(&self, session: &SessionId, request: &SecureEnvelope) -> Result<()> {
        let crypto = self.crypto.as_ref();
        self.with_session("/load", session, |s| {
            if !s.configured {
                return Err(reject("/load", 500, "ORAM not configured"));
            }
            let sk = Self::session_key("/load", s)?;
            let (block, filename) = request
                .open_split(crypto, sk, PASSWORD_LEN)
                .map_err(|_| reject("/load", 400, "password decryption failed"))?;
            let filename = String::from_utf8_lossy(filename).into_owned();
            let password: Vec<u8> = block.into_iter().take_while(|b| *b != 0).collect();

            let dataset = self
                .options
                .datasets
                .iter()
                .find(|d| d.name == filename)
                .ok_or_else(|| reject("/load", 404, "no such file"))?;
            if dataset.password.as_bytes() != password.as_slice() {
                return Err(reject("/load", 401, "wrong password"));
            }
            s.dataset = Some(dataset.clone());
            s.next_page = None;
            Ok(())
        })
    }

    async fn substring(
        &self,
        session: &SessionId,
        request: &SecureEnvelope,
    ) -> Result<SecureEnvelope> {
        let crypto = self.crypto.as_ref();
        self.with_session("/substring", session, |s| {
            let sk = Self::session_key("/substring", s)?;
            let codes = request
                .open(crypto, sk)
                .map_err(|_| reject("/substring", 400, "query decryption failed"))?;
            let dataset = s
                .dataset
                .as_ref()
                .ok_or_else(|| reject("/substring", 500, "no file loaded"))?;

            let alphabet: Vec<char> = dataset.alphabet.chars().collect();
            let pattern = codes
                .iter()
                .map(|code| alphabet.get(usize::from(*code)).copied())
                .collect::<Option<Vec<char>>>()
                .ok_or_else(|| reject("/substring", 400, "code outside alphabet"))?;
            let (start, end) = dataset.range(&pattern);

            let mut range = BytesMut::with_capacity(8);
            range.put_i32_le(start);
            range.put_i32_le(end);
            let mut response = SecureEnvelope::seal(
                crypto,
                sk,
                &range,
                &self.options.query_time.to_le_bytes(),
            )?;
            if self.options.corrupt_responses {
                response.mac[0] ^= 0x01;
            }

            let page_len = i64::try_from(self.options.page_len).unwrap_or(i64::MAX);
            let start = i64::from(start);
            s.next_page = Some(start - start.rem_euclid(page_len));
            Ok(response)
        })
    }

    async fn suffix(&self, session: &SessionId) -> Result<SecureEnvelope> {
        let crypto = self.crypto.as_ref();
        self.with_session("/suffix", session, |s| {
            let sk = Self::session_key("/suffix", s)?.clone();
            let first = s
                .next_page
                .ok_or_else(|| reject("/suffix", 409, "no query in progress"))?;
            let dataset = s
                .dataset
                .as_ref()
                .ok_or_else(|| reject("/suffix", 500, "no file loaded"))?;

            let mut page = BytesMut::with_capacity(4 * self.options.page_len);
            for position in self.page(dataset, first) {
                page.put_i32_le(position);
            }
            let mut response = SecureEnvelope::seal(
                crypto,
                &sk,
                &page,
                &self.options.page_time.to_le_bytes(),
            )?;
            if self.options.corrupt_responses {
                response.mac[0] ^= 0x01;
            }

            let page_len = i64::try_from(self.options.page_len).unwrap_or(i64::MAX);
            s.next_page = Some(first + page_len);
            Ok(response)
        })
    }

    async fn close(&self, session: &SessionId) -> Result<()> {
        let mut state = self.lock();
        state.calls.push("DELETE /close");
        if let Some(status) = self.options.refuse_close {
            return Err(reject("/close", status, "close refused"));
        }
        state
            .sessions
            .remove(session.as_str())
            .map(|_| ())
            .ok_or_else(|| reject("/close", 404, "unknown session"))
    }
}

/// Behaviour of a [`MockAttestationService`].
#[derive(Debug, Clone)]
pub struct MockAttestationOptions {
    /// `isvEnclaveQuoteStatus` to report.
    pub status: String,
    /// Echo a different nonce than the one received.
    pub wrong_nonce: bool,
    /// Put two report-signing certificates in the header.
    pub duplicate_leaf: bool,
    /// Sign something other than the returned body.
    pub bad_signature: bool,
    /// Base64 revocation list returned for every group.
    pub sigrl: Option<String>,
}

impl Default for MockAttestationOptions {
    fn default() -> Self {
        Self {
            status: "OK".to_string(),
            wrong_nonce: false,
            duplicate_leaf: false,
            bad_signature: false,
            sigrl: None,
        }
    }
}

/// Simulated attestation service backed by a throwaway signing PKI.
pub struct MockAttestationService {
    authority: ReportSigningAuthority,
    options: MockAttestationOptions,
    requests: Mutex<Vec<ReportRequest>>,
    sigrl_groups: Mutex<Vec<String>>,
}

impl MockAttestationService {
    pub fn new(options: MockAttestationOptions) -> Result<Self> {
        let authority = ReportSigningAuthority::generate().map_err(pki_error)?;
        Ok(Self {
            authority,
            options,
            requests: Mutex::new(Vec::new()),
            sigrl_groups: Mutex::new(Vec::new()),
        })
    }

    /// A validator that trusts this service's root.
    pub fn validator(&self) -> Result<ReportValidator> {
        let pem = self.authority.root_pem().map_err(pki_error)?;
        Ok(ReportValidator::with_root_ca(&pem)?)
    }

    /// Report requests received so far.
    pub fn requests(&self) -> Vec<ReportRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Group ids whose revocation list was requested.
    pub fn sigrl_groups(&self) -> Vec<String> {
        self.sigrl_groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn respond(
        &self,
        request: &ReportRequest,
    ) -> std::result::Result<ReportResponse, openssl::error::ErrorStack> {
        let nonce = if self.options.wrong_nonce {
            format!("{}x", request.nonce)
        } else {
            request.nonce.clone()
        };
        let body = report_body(&request.isv_enclave_quote, &nonce, &self.options.status);
        let mut response = self.authority.respond(body)?;

        if self.options.duplicate_leaf {
            let (second, _) = self.authority.issue_leaf(&[
                crate::attestation::report::REPORT_SIGNING_CN,
            ])?;
            response.signing_certificate = ReportSigningAuthority::certificate_header(&[
                self.authority.leaf(),
                &second,
                self.authority.root(),
            ])?;
        }
        if self.options.bad_signature {
            response.signature = self.authority.sign(b"some other body")?;
        }
        Ok(response)
    }
}

#[async_trait]
impl AttestationService for MockAttestationService {
    async fn sigrl(&self, group_id: &str) -> Result<Option<String>> {
        self.sigrl_groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(group_id.to_string());
        Ok(self.options.sigrl.clone())
    }

    async fn report(&self, request: &ReportRequest) -> Result<ReportResponse> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());
        self.respond(request).map_err(pki_error)
    }
}

/// Decoded byte length of a base64 revocation list, for assertions.
pub fn sigrl_len(sigrl: &str) -> usize {
    STANDARD.decode(sigrl).map(|b| b.len()).unwrap_or(0)
}

fn reject(endpoint: &'static str, status: u16, message: &str) -> Error {
    TransportError::Status {
        endpoint,
        status,
        message: message.to_string(),
    }
    .into()
}

fn pki_error(e: openssl::error::ErrorStack) -> Error {
    IntegrityError::SigningCertificate(format!("mock PKI: {e}")).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> MockDataset {
        MockDataset::new("banana", "pw", "$abn", "banana$")
    }

    #[test]
    fn suffix_ranges_of_banana() {
        let ds = dataset();
        let (_, sa) = ds.suffix_array();
        // $, a$, ana$, anana$, banana$, na$, nana$
        assert_eq!(sa, vec![6, 5, 3, 1, 0, 4, 2]);
        assert_eq!(ds.range(&['a', 'n', 'a']), (2, 4));
        assert_eq!(ds.range(&['n']), (5, 7));
        let (lo, hi) = ds.range(&['x']);
        assert_eq!(lo, hi);
    }

    #[test]
    fn pages_pad_past_the_end() {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(crate::crypto::RustCryptoProvider::new());
        let enclave = MockEnclave::new(crypto, MockEnclaveOptions::default());
        assert_eq!(enclave.page(&dataset(), 4), vec![0, 4, 2, -1]);
    }

    #[test]
    fn revocation_list_length_is_decoded_bytes() {
        assert_eq!(sigrl_len("AAECAwQ="), 5);
        assert_eq!(sigrl_len("AAECAw=="), 4);
        assert_eq!(sigrl_len("not base64!"), 0);
    }
}
