use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::sign::Verifier;
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::{X509NameRef, X509StoreContext, X509};
use percent_encoding::percent_decode_str;
use serde::Deserialize;

use super::quote::Quote;
use crate::error::{Error, IntegrityError, ProtocolError, ReplayError, TransportError};
use crate::transport::ReportResponse;

/// Last subject CN of the report-signing certificate.
pub const REPORT_SIGNING_CN: &str = "Intel SGX Attestation Report Signing";

/// Last issuer CN of the report-signing certificate.
pub const REPORT_SIGNING_CA_CN: &str = "Intel SGX Attestation Report Signing CA";

/// Bundled attestation-service report-signing root CA (PEM).
const INTEL_SGX_ROOT_CA_PEM: &[u8] = include_bytes!("intel_sgx_root_ca.pem");

const REPORT_ENDPOINT: &str = "attestation/v3/report";

/// Quote statuses accepted from the attestation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteStatus {
    Ok,
    /// The platform's EPID group is out of date. Tolerated with a warning.
    GroupOutOfDate,
}

/// What a successful validation tells the caller.
#[derive(Debug, Clone)]
pub struct VerifiedReport {
    pub status: QuoteStatus,
    pub id: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    isv_enclave_quote_status: String,
    isv_enclave_quote_body: String,
    #[serde(default)]
    nonce: Option<String>,
}

/// Validator for attestation-service verification reports.
///
/// A report is accepted when:
/// 1. the signing-certificate header holds exactly one report-signing certificate
/// 2. that certificate chains to the pinned root CA
/// 3. the detached signature over the raw body verifies under it
/// 4. the returned quote body is a prefix of the submitted quote
/// 5. the returned nonce is the one that was sent
/// 6. the quote status is `OK` or `GROUP_OUT_OF_DATE`
pub struct ReportValidator {
    root_cert: X509,
}

impl ReportValidator {
    /// Create a validator pinned to the bundled Intel root CA.
    pub fn new() -> Result<Self, IntegrityError> {
        Self::with_root_ca(INTEL_SGX_ROOT_CA_PEM)
    }

    /// Create a validator with a custom root CA (for synthetic test PKI).
    pub fn with_root_ca(root_ca_pem: &[u8]) -> Result<Self, IntegrityError> {
        let root_cert = X509::from_pem(root_ca_pem).map_err(|e| {
            IntegrityError::CertificateChain(format!("failed to parse root CA PEM: {e}"))
        })?;
        Ok(Self { root_cert })
    }

    pub fn validate(
        &self,
        response: &ReportResponse,
        quote: &Quote,
        nonce: &str,
    ) -> Result<VerifiedReport, Error> {
        let signing_cert = select_signing_certificate(&response.signing_certificate)?;
        self.verify_chain(&signing_cert)?;
        verify_signature(&signing_cert, &response.body, &response.signature)?;

        let body: ReportBody =
            serde_json::from_slice(&response.body).map_err(|e| TransportError::MalformedBody {
                endpoint: REPORT_ENDPOINT,
                reason: e.to_string(),
            })?;

        let quote_body = STANDARD
            .decode(&body.isv_enclave_quote_body)
            .map_err(|e| TransportError::MalformedBody {
                endpoint: REPORT_ENDPOINT,
                reason: format!("isvEnclaveQuoteBody: {e}"),
            })?;
        if !quote.starts_with(&quote_body) {
            return Err(IntegrityError::QuoteBodyMismatch.into());
        }

        let received = body.nonce.unwrap_or_default();
        if received != nonce {
            return Err(ReplayError::NonceMismatch {
                sent: nonce.to_string(),
                received,
            }
            .into());
        }

        let status = match body.isv_enclave_quote_status.as_str() {
            "OK" => QuoteStatus::Ok,
            "GROUP_OUT_OF_DATE" => {
                tracing::warn!("attestation service reports GROUP_OUT_OF_DATE, continuing");
                QuoteStatus::GroupOutOfDate
            }
            other => return Err(ProtocolError::QuoteStatus(other.to_string()).into()),
        };

        tracing::debug!(report_id = ?body.id, ?status, "attestation report validated");

        Ok(VerifiedReport {
            status,
            id: body.id,
            timestamp: body.timestamp,
        })
    }

    fn verify_chain(&self, leaf: &X509) -> Result<(), IntegrityError> {
        let mut store_builder = X509StoreBuilder::new().map_err(|e| {
            IntegrityError::CertificateChain(format!("failed to create X509 store: {e}"))
        })?;
        store_builder.add_cert(self.root_cert.clone()).map_err(|e| {
            IntegrityError::CertificateChain(format!("failed to add root cert to store: {e}"))
        })?;
        let store: X509Store = store_builder.build();

        let chain = Stack::new().map_err(|e| {
            IntegrityError::CertificateChain(format!("failed to create cert stack: {e}"))
        })?;

        let mut ctx = X509StoreContext::new().map_err(|e| {
            IntegrityError::CertificateChain(format!("failed to create store context: {e}"))
        })?;

        let mut reason = String::new();
        let valid = ctx
            .init(&store, leaf, &chain, |ctx| {
                let ok = ctx.verify_cert()?;
                if !ok {
                    reason = ctx.error().to_string();
                }
                Ok(ok)
            })
            .map_err(|e| IntegrityError::CertificateChain(format!("verification error: {e}")))?;

        if !valid {
            return Err(IntegrityError::CertificateChain(reason));
        }
        Ok(())
    }
}

// -- Certificate header --

/// Pick the single report-signing certificate out of the percent-encoded PEM
/// chain carried in `X-IASReport-Signing-Certificate`.
pub fn select_signing_certificate(header: &str) -> Result<X509, IntegrityError> {
    let pem = percent_decode_str(header)
        .decode_utf8()
        .map_err(|e| IntegrityError::SigningCertificate(format!("not UTF-8: {e}")))?;
    let certs = X509::stack_from_pem(pem.as_bytes())
        .map_err(|e| IntegrityError::SigningCertificate(format!("invalid PEM chain: {e}")))?;

    let mut matching: Vec<X509> = certs
        .into_iter()
        .filter(|cert| {
            last_common_name(cert.subject_name()).as_deref() == Some(REPORT_SIGNING_CN)
                && last_common_name(cert.issuer_name()).as_deref() == Some(REPORT_SIGNING_CA_CN)
        })
        .collect();

    match matching.len() {
        1 => Ok(matching.remove(0)),
        n => Err(IntegrityError::SigningCertificate(format!(
            "expected exactly one report-signing certificate, found {n}"
        ))),
    }
}

fn last_common_name(name: &X509NameRef) -> Option<String> {
    name.entries_by_nid(Nid::COMMONNAME)
        .last()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
}

// -- Report signature --

fn verify_signature(cert: &X509, body: &[u8], signature_b64: &str) -> Result<(), IntegrityError> {
    let signature = STANDARD
        .decode(signature_b64.trim())
        .map_err(|e| IntegrityError::ReportSignature(format!("signature is not base64: {e}")))?;
    let public_key = cert
        .public_key()
        .map_err(|e| IntegrityError::ReportSignature(format!("no public key: {e}")))?;

    let mut verifier = Verifier::new(MessageDigest::sha256(), &public_key)
        .map_err(|e| IntegrityError::ReportSignature(e.to_string()))?;
    verifier
        .update(body)
        .map_err(|e| IntegrityError::ReportSignature(e.to_string()))?;
    let valid = verifier
        .verify(&signature)
        .map_err(|e| IntegrityError::ReportSignature(e.to_string()))?;

    if !valid {
        return Err(IntegrityError::ReportSignature(
            "signature does not match report body".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::quote::MIN_QUOTE_LEN;
    use crate::attestation::testing::{report_body, ReportSigningAuthority};

    const NONCE: &str = "abcdefghijklmnopqrstuvwxyz012345";

    fn quote() -> Quote {
        let mut bytes = vec![0x11u8; MIN_QUOTE_LEN + 64];
        bytes[0] = 0x02;
        Quote::parse(bytes).unwrap()
    }

    fn setup() -> (ReportSigningAuthority, ReportValidator) {
        let authority = ReportSigningAuthority::generate().unwrap();
        let validator = ReportValidator::with_root_ca(&authority.root_pem().unwrap()).unwrap();
        (authority, validator)
    }

    #[test]
    fn bundled_root_parses() {
        ReportValidator::new().unwrap();
    }

    #[test]
    fn valid_report_accepted() {
        let (authority, validator) = setup();
        let q = quote();
        let response = authority
            .respond(report_body(q.as_bytes(), NONCE, "OK"))
            .unwrap();

        let report = validator.validate(&response, &q, NONCE).unwrap();
        assert_eq!(report.status, QuoteStatus::Ok);
    }

    #[test]
    fn group_out_of_date_tolerated() {
        let (authority, validator) = setup();
        let q = quote();
        let response = authority
            .respond(report_body(q.as_bytes(), NONCE, "GROUP_OUT_OF_DATE"))
            .unwrap();

        let report = validator.validate(&response, &q, NONCE).unwrap();
        assert_eq!(report.status, QuoteStatus::GroupOutOfDate);
    }

    #[test]
    fn other_status_rejected() {
        let (authority, validator) = setup();
        let q = quote();
        let response = authority
            .respond(report_body(q.as_bytes(), NONCE, "SIGNATURE_INVALID"))
            .unwrap();

        let err = validator.validate(&response, &q, NONCE).unwrap_err();
        assert!(
            matches!(err, Error::Protocol(ProtocolError::QuoteStatus(ref s)) if s == "SIGNATURE_INVALID")
        );
    }

    #[test]
    fn nonce_mismatch_is_replay() {
        let (authority, validator) = setup();
        let q = quote();
        let response = authority
            .respond(report_body(q.as_bytes(), "some other nonce", "OK"))
            .unwrap();

        let err = validator.validate(&response, &q, NONCE).unwrap_err();
        assert!(matches!(err, Error::Replay(ReplayError::NonceMismatch { .. })));
    }

    #[test]
    fn foreign_quote_body_rejected() {
        let (authority, validator) = setup();
        let q = quote();
        let mut other = q.as_bytes().to_vec();
        other[100] ^= 0xFF;
        let response = authority.respond(report_body(&other, NONCE, "OK")).unwrap();

        let err = validator.validate(&response, &q, NONCE).unwrap_err();
        assert!(matches!(
            err,
            Error::Integrity(IntegrityError::QuoteBodyMismatch)
        ));
    }

    #[test]
    fn tampered_body_fails_signature() {
        let (authority, validator) = setup();
        let q = quote();
        let mut response = authority
            .respond(report_body(q.as_bytes(), NONCE, "OK"))
            .unwrap();
        // Rewrite the status after signing.
        let text = String::from_utf8(response.body.clone()).unwrap();
        response.body = text.replace("\"OK\"", "\"KO\"").into_bytes();

        let err = validator.validate(&response, &q, NONCE).unwrap_err();
        assert!(matches!(
            err,
            Error::Integrity(IntegrityError::ReportSignature(_))
        ));
    }

    #[test]
    fn untrusted_root_rejected() {
        let (authority, _) = setup();
        let (_, other_validator) = setup();
        let q = quote();
        let response = authority
            .respond(report_body(q.as_bytes(), NONCE, "OK"))
            .unwrap();

        let err = other_validator.validate(&response, &q, NONCE).unwrap_err();
        assert!(matches!(
            err,
            Error::Integrity(IntegrityError::CertificateChain(_))
        ));
    }

    #[test]
    fn header_must_hold_exactly_one_signing_cert() {
        let authority = ReportSigningAuthority::generate().unwrap();

        let none = ReportSigningAuthority::certificate_header(&[authority.root()]).unwrap();
        assert!(matches!(
            select_signing_certificate(&none),
            Err(IntegrityError::SigningCertificate(_))
        ));

        let two = ReportSigningAuthority::certificate_header(&[
            authority.leaf(),
            authority.leaf(),
            authority.root(),
        ])
        .unwrap();
        assert!(matches!(
            select_signing_certificate(&two),
            Err(IntegrityError::SigningCertificate(_))
        ));

        let one =
            ReportSigningAuthority::certificate_header(&[authority.leaf(), authority.root()])
                .unwrap();
        let selected = select_signing_certificate(&one).unwrap();
        assert_eq!(
            selected.to_der().unwrap(),
            authority.leaf().to_der().unwrap()
        );
    }

    #[test]
    fn wrong_subject_cn_not_selected() {
        let authority = ReportSigningAuthority::generate().unwrap();
        let (impostor, _) = authority
            .issue_leaf(&[REPORT_SIGNING_CN, "Report Signing Impostor"])
            .unwrap();

        // Only the last CN entry counts.
        let header =
            ReportSigningAuthority::certificate_header(&[&impostor, authority.root()]).unwrap();
        assert!(select_signing_certificate(&header).is_err());
    }

    #[test]
    fn garbage_header_rejected() {
        assert!(matches!(
            select_signing_certificate("not%20a%20certificate"),
            Err(IntegrityError::SigningCertificate(_))
        ));
    }
}
