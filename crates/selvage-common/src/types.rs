//! Validated AT Protocol identifier types and the DID document model.

pub mod did;
pub mod did_doc;
pub mod handle;
pub mod ident;

use miette::Diagnostic;
use smol_str::SmolStr;
use thiserror::Error;

/// Errors produced by identifier validation. Always local; no constructor
/// in this module performs network I/O.
#[derive(Debug, Error, Diagnostic)]
pub enum IdentifierError {
    /// Input exceeds the grammar's length limit
    #[error("{kind} too long: {len} chars (max {max})")]
    #[diagnostic(code(selvage_common::identifier::too_long))]
    TooLong {
        /// Which identifier grammar rejected the input
        kind: &'static str,
        /// Actual length
        len: usize,
        /// Permitted maximum
        max: usize,
    },
    /// Input does not match the grammar
    #[error("invalid {kind}: {value:?}")]
    #[diagnostic(
        code(selvage_common::identifier::invalid),
        help("expected a handle like `alice.example.com` or a DID like `did:plc:abc123`")
    )]
    Invalid {
        /// Which identifier grammar rejected the input
        kind: &'static str,
        /// The rejected input
        value: SmolStr,
    },
}
