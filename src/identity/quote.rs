//! TEE quote generation.
//!
//! A quote is hardware-signed evidence that the `report_data` field was
//! generated inside the measured enclave. The core only ever produces
//! quotes for a remote peer to verify; it never verifies its own.

use crate::error::AttestationError;

/// A TEE quote bound to a 32-byte `report_data` field, plus the runtime
/// event log accompanying it.
#[derive(Debug, Clone)]
pub struct Quote {
    pub report_data: [u8; 32],
    pub quote_bytes: Vec<u8>,
    pub event_log: Vec<u8>,
}

/// Source of TEE quotes. Implementations are provider-specific (TDX, SEV-SNP,
/// ...); the core only depends on this trait.
pub trait QuoteProvider: Send + Sync {
    /// Produce a quote whose `report_data` is exactly the given 32 bytes.
    fn quote(&self, report_data: [u8; 32]) -> Result<Quote, AttestationError>;
}

/// Reads a quote from the native TDX/SEV-SNP driver. Not implemented in this
/// crate; wire up a provider-specific backend (device ioctl) in the
/// deployment that links this core against real hardware.
pub struct NativeQuoteProvider;

impl QuoteProvider for NativeQuoteProvider {
    fn quote(&self, _report_data: [u8; 32]) -> Result<Quote, AttestationError> {
        Err(AttestationError::QuoteUnavailable)
    }
}

/// Deterministic stub used only when `dev_mode` is set. Produces a
/// recognizable, non-hardware-backed quote so the rest of the transport can
/// be exercised without a TEE driver.
pub struct DevQuoteProvider;

impl QuoteProvider for DevQuoteProvider {
    fn quote(&self, report_data: [u8; 32]) -> Result<Quote, AttestationError> {
        Ok(Quote {
            report_data,
            quote_bytes: b"dev-mode-stub-quote".to_vec(),
            event_log: Vec::new(),
        })
    }
}
