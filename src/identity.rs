//! Node identity derivation.
//!
//! The hosting platform encodes a VM's instance name into the last six
//! characters of the Kubernetes node name, base-36. This mapping is fixed
//! by the platform and used only to match metadata-service scheduled
//! events back to the node this agent owns.

use thiserror::Error;

const SUFFIX_LEN: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("node name {0:?} is shorter than the {SUFFIX_LEN}-character encoded suffix")]
    TooShort(String),
    #[error("node name {0:?} has a non-base36 encoded suffix {1:?}")]
    InvalidSuffix(String, String),
}

/// The node this agent owns, plus its derived instance name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_name: String,
    pub instance_name: String,
}

impl NodeIdentity {
    /// Derive the instance name from a node name.
    ///
    /// The last six characters are base-36 decoded into an integer `N`;
    /// the instance name is `<prefix>_<N>` where `prefix` is the node name
    /// minus those six characters.
    pub fn derive(node_name: &str) -> Result<Self, IdentityError> {
        if node_name.len() < SUFFIX_LEN || !node_name.is_ascii() {
            return Err(IdentityError::TooShort(node_name.to_string()));
        }

        let split = node_name.len() - SUFFIX_LEN;
        let (prefix, suffix) = node_name.split_at(split);

        let n = u64::from_str_radix(&suffix.to_ascii_lowercase(), 36)
            .map_err(|_| IdentityError::InvalidSuffix(node_name.to_string(), suffix.to_string()))?;

        Ok(Self {
            node_name: node_name.to_string(),
            instance_name: format!("{prefix}_{n}"),
        })
    }
}
