//! Enclave quote handling and attestation-service report validation.

pub mod nonce;
pub mod quote;
pub mod report;

#[cfg(any(test, feature = "mock"))]
#[doc(hidden)]
pub mod testing;

pub use quote::{EnclaveIdentity, Quote};
pub use report::{QuoteStatus, ReportValidator, VerifiedReport};
