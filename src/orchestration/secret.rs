//! Message secret payload.
//!
//! Each job receives its message through a secret named after the job. All
//! four values are base64 encoded:
//!
//! | key | value |
//! |---|---|
//! | `ISSUER` | fixed issuer string |
//! | `TARGET` | the job/secret name |
//! | `MESSAGE` | raw message body |
//! | `CHECKSUM` | SHA-1 over `"{namespace}:{jobName}:{message}"` |

use crate::constants::secret;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// Secret contents for one dispatched message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSecret {
    pub name: String,
    pub namespace: String,
    pub data: BTreeMap<String, String>,
}

impl MessageSecret {
    pub fn new(namespace: &str, job_name: &str, name: &str, message: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("{namespace}:{job_name}:").as_bytes());
        hasher.update(message);
        let checksum = STANDARD.encode(hasher.finalize());

        let data = BTreeMap::from([
            (secret::ISSUER_KEY.to_string(), STANDARD.encode(secret::ISSUER)),
            (secret::TARGET_KEY.to_string(), STANDARD.encode(name)),
            (secret::MESSAGE_KEY.to_string(), STANDARD.encode(message)),
            (secret::CHECKSUM_KEY.to_string(), checksum),
        ]);

        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            data,
        }
    }

    /// `v1/Secret` manifest
    pub fn manifest(&self) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
            },
            "data": self.data,
        })
    }
}
