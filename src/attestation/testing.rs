//! Synthetic report-signing PKI for tests and the mock attestation service.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use openssl::asn1::Asn1Time;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

use super::quote::MIN_QUOTE_LEN;
use super::report::{REPORT_SIGNING_CA_CN, REPORT_SIGNING_CN};
use crate::transport::ReportResponse;

/// A throwaway root CA plus report-signing leaf carrying the production
/// common names.
pub struct ReportSigningAuthority {
    root: X509,
    root_key: PKey<Private>,
    leaf: X509,
    leaf_key: PKey<Private>,
}

impl ReportSigningAuthority {
    pub fn generate() -> Result<Self, ErrorStack> {
        let root_key = PKey::from_rsa(Rsa::generate(2048)?)?;
        let root_name = name(&[REPORT_SIGNING_CA_CN])?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_subject_name(&root_name)?;
        builder.set_issuer_name(&root_name)?;
        builder.set_pubkey(&root_key)?;
        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(3650)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()?,
        )?;
        builder.sign(&root_key, MessageDigest::sha256())?;
        let root = builder.build();

        let (leaf, leaf_key) = issue(&root, &root_key, &[REPORT_SIGNING_CN])?;
        Ok(Self {
            root,
            root_key,
            leaf,
            leaf_key,
        })
    }

    /// Issue a leaf under this root whose subject carries the given CN
    /// entries in order.
    pub fn issue_leaf(
        &self,
        common_names: &[&str],
    ) -> Result<(X509, PKey<Private>), ErrorStack> {
        issue(&self.root, &self.root_key, common_names)
    }

    pub fn root(&self) -> &X509 {
        &self.root
    }

    pub fn leaf(&self) -> &X509 {
        &self.leaf
    }

    pub fn root_pem(&self) -> Result<Vec<u8>, ErrorStack> {
        self.root.to_pem()
    }

    /// Base64 RSA-SHA256 signature over `body` by the leaf key.
    pub fn sign(&self, body: &[u8]) -> Result<String, ErrorStack> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.leaf_key)?;
        signer.update(body)?;
        Ok(STANDARD.encode(signer.sign_to_vec()?))
    }

    /// Percent-encoded concatenation of PEM certificates, as carried in the
    /// signing-certificate header.
    pub fn certificate_header(certs: &[&X509]) -> Result<String, ErrorStack> {
        let mut pem = Vec::new();
        for cert in certs {
            pem.extend_from_slice(&cert.to_pem()?);
        }
        let pem = String::from_utf8_lossy(&pem);
        Ok(utf8_percent_encode(&pem, NON_ALPHANUMERIC).to_string())
    }

    /// Wrap `body` the way the attestation service does: leaf + root chain
    /// header and a detached signature.
    pub fn respond(&self, body: Vec<u8>) -> Result<ReportResponse, ErrorStack> {
        Ok(ReportResponse {
            signing_certificate: Self::certificate_header(&[&self.leaf, &self.root])?,
            signature: self.sign(&body)?,
            body,
        })
    }
}

/// JSON verification report for `quote` in the attestation service's shape.
pub fn report_body(quote: &[u8], nonce: &str, status: &str) -> Vec<u8> {
    let body_len = quote.len().min(MIN_QUOTE_LEN);
    serde_json::json!({
        "id": "165171271757108173876306223827987629752",
        "timestamp": "2019-05-21T12:43:39.184396",
        "version": 3,
        "isvEnclaveQuoteStatus": status,
        "isvEnclaveQuoteBody": STANDARD.encode(&quote[..body_len]),
        "nonce": nonce,
    })
    .to_string()
    .into_bytes()
}

fn issue(
    root: &X509,
    root_key: &PKey<Private>,
    common_names: &[&str],
) -> Result<(X509, PKey<Private>), ErrorStack> {
    let key = PKey::from_rsa(Rsa::generate(2048)?)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let subject = name(common_names)?;
    builder.set_subject_name(&subject)?;
    builder.set_issuer_name(root.subject_name())?;
    builder.set_pubkey(&key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(3650)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.append_extension(KeyUsage::new().critical().digital_signature().build()?)?;
    builder.sign(root_key, MessageDigest::sha256())?;
    Ok((builder.build(), key))
}

fn name(common_names: &[&str]) -> Result<X509Name, ErrorStack> {
    let mut builder = X509NameBuilder::new()?;
    builder.append_entry_by_text("C", "US")?;
    builder.append_entry_by_text("O", "Test Attestation")?;
    for cn in common_names {
        builder.append_entry_by_text("CN", cn)?;
    }
    Ok(builder.build())
}
