use std::fmt;
use std::ops::Range;

use subtle::ConstantTimeEq;

use crate::crypto::{CryptoProvider, EcPoint, SymmetricKey};
use crate::error::{IntegrityError, ProtocolError};

/// Smallest quote that still carries a full report body.
pub const MIN_QUOTE_LEN: usize = 432;

/// Offset of the report body inside the quote.
const REPORT_BODY: usize = 48;

pub const MR_ENCLAVE: Range<usize> = REPORT_BODY + 64..REPORT_BODY + 96;
pub const ISV_PROD_ID: usize = REPORT_BODY + 256;
pub const ISV_SVN: usize = REPORT_BODY + 258;

/// First half of the 64-byte report data, where the enclave places
/// `SHA-256(Ga || Gb || VK)`.
pub const REPORT_DATA_BINDING: Range<usize> = MIN_QUOTE_LEN - 64..MIN_QUOTE_LEN - 32;

/// Identity of an attested enclave, read from its quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnclaveIdentity {
    pub mr_enclave: [u8; 32],
    pub product_id: u16,
    pub svn: u16,
}

impl EnclaveIdentity {
    pub fn mr_enclave_hex(&self) -> String {
        hex::encode(self.mr_enclave)
    }
}

impl fmt::Display for EnclaveIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MRENCLAVE: {}\nISV PID: {}\nISV SVN: {}",
            self.mr_enclave_hex(),
            self.product_id,
            self.svn
        )
    }
}

/// An enclave quote as delivered in msg3.
#[derive(Clone, PartialEq, Eq)]
pub struct Quote(Vec<u8>);

impl Quote {
    pub fn parse(bytes: Vec<u8>) -> Result<Self, ProtocolError> {
        if bytes.len() < MIN_QUOTE_LEN {
            return Err(ProtocolError::QuoteTooShort {
                actual: bytes.len(),
                minimum: MIN_QUOTE_LEN,
            });
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn report_data_binding(&self) -> &[u8] {
        &self.0[REPORT_DATA_BINDING]
    }

    /// Check that the quote binds this key exchange.
    pub fn verify_binding(
        &self,
        crypto: &dyn CryptoProvider,
        ga: &EcPoint,
        gb: &EcPoint,
        vk: &SymmetricKey,
    ) -> Result<(), IntegrityError> {
        let expected = binding_digest(crypto, ga, gb, vk);
        if bool::from(expected.as_slice().ct_eq(self.report_data_binding())) {
            Ok(())
        } else {
            Err(IntegrityError::ReportDataBinding)
        }
    }

    pub fn identity(&self) -> EnclaveIdentity {
        let mut mr_enclave = [0u8; 32];
        mr_enclave.copy_from_slice(&self.0[MR_ENCLAVE]);
        EnclaveIdentity {
            mr_enclave,
            product_id: u16::from_le_bytes([self.0[ISV_PROD_ID], self.0[ISV_PROD_ID + 1]]),
            svn: u16::from_le_bytes([self.0[ISV_SVN], self.0[ISV_SVN + 1]]),
        }
    }

    /// `true` if `body` is a byte-prefix of this quote.
    pub fn starts_with(&self, body: &[u8]) -> bool {
        self.0.starts_with(body)
    }
}

impl fmt::Debug for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Quote")
            .field("len", &self.0.len())
            .field("identity", &self.identity())
            .finish()
    }
}

/// `SHA-256(Ga || Gb || VK)` with both points in wire form.
pub fn binding_digest(
    crypto: &dyn CryptoProvider,
    ga: &EcPoint,
    gb: &EcPoint,
    vk: &SymmetricKey,
) -> [u8; 32] {
    let mut input = Vec::with_capacity(64 + 64 + 16);
    input.extend_from_slice(&ga.to_bytes());
    input.extend_from_slice(&gb.to_bytes());
    input.extend_from_slice(vk.as_bytes());
    crypto.sha256(&input)
}
