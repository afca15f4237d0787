//! Shared plumbing for the Selvage crates: the HTTP client abstraction,
//! pluggable state stores, the optional cross-process lock capability, and
//! the validated AT Protocol identifier types.

pub use smol_str;
pub use url;

/// HTTP client abstraction used by the Selvage crates.
pub mod http;
/// Cross-process mutual exclusion capability.
pub mod lock;
/// Generic key/value state stores.
pub mod store;
/// Validated identifier types and the DID document model.
pub mod types;

pub use types::did::Did;
pub use types::did_doc::DidDocument;
pub use types::handle::Handle;
pub use types::ident::AtIdentifier;
pub use types::IdentifierError;
