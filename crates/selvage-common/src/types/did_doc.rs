use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use url::Url;

use super::did::Did;
use super::handle::Handle;

/// Service type tag marking a user's authoritative personal data server.
pub const PDS_SERVICE_TYPE: &str = "AtprotoPersonalDataServer";

/// A resolved DID document.
///
/// Only the fields the client needs are modeled explicitly; everything
/// else is captured in `extra_data` for forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    /// Document identifier (e.g., `did:plc:...` or `did:web:...`)
    pub id: Did,

    /// Alternate identifiers for the subject, such as `at://<handle>`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub also_known_as: Vec<SmolStr>,

    /// Services associated with this DID
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service: Vec<Service>,

    /// Forward-compatible capture of unmodeled fields
    #[serde(flatten)]
    pub extra_data: BTreeMap<SmolStr, Value>,
}

/// Service entry in a DID document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Identifier for this service within the document (e.g., `#atproto_pds`)
    pub id: SmolStr,
    /// Service type tag
    #[serde(rename = "type")]
    pub service_type: SmolStr,
    /// Endpoint URL
    pub service_endpoint: SmolStr,

    /// Forward-compatible capture of unmodeled fields
    #[serde(flatten)]
    pub extra_data: BTreeMap<SmolStr, Value>,
}

impl DidDocument {
    /// The authoritative personal-data-server endpoint.
    ///
    /// Requires exactly one service entry tagged [`PDS_SERVICE_TYPE`]; an
    /// ambiguous document (more than one entry) yields `None`, the same as
    /// a document with none. Any trailing slash is stripped before the URL
    /// is parsed.
    pub fn pds_endpoint(&self) -> Option<Url> {
        let mut found = None;
        for service in &self.service {
            if service.service_type == PDS_SERVICE_TYPE {
                if found.is_some() {
                    return None;
                }
                found = Some(service);
            }
        }
        let endpoint = found?.service_endpoint.trim_end_matches('/');
        Url::parse(endpoint).ok()
    }

    /// Extract validated handles from `alsoKnownAs` entries of the form
    /// `at://<handle>`.
    pub fn handles(&self) -> Vec<Handle> {
        self.also_known_as
            .iter()
            .filter_map(|aka| aka.strip_prefix("at://"))
            .filter_map(|h| Handle::new(h).ok())
            .collect()
    }

    /// The document's primary claimed handle, if any.
    pub fn handle(&self) -> Option<Handle> {
        self.handles().into_iter().next()
    }
}
