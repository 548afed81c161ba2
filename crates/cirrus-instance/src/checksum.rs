//! Content checksums of deployment payloads

use sha2::{Digest, Sha256};

use cirrus_common::{Error, Result};

use crate::provider::DeploymentPayload;

/// Status checksum key of the deployment template
pub const TEMPLATE_CHECKSUM: &str = "deploymentTemplateChecksum";
/// Status checksum key of the deployment parameters
pub const PARAMETERS_CHECKSUM: &str = "deploymentParametersChecksum";

/// Lowercase hex SHA-256 of the canonical JSON encoding of `value`
///
/// Object keys are sorted before encoding, so equal documents always hash
/// the same.
pub fn checksum(value: &serde_json::Value) -> Result<String> {
    let bytes = serde_json::to_vec(&canonical(value))
        .map_err(|e| Error::serialization_for_kind("DeploymentPayload", e.to_string()))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn canonical(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<&String, serde_json::Value> =
                map.iter().map(|(k, v)| (k, canonical(v))).collect();
            serde_json::Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonical).collect())
        }
        other => other.clone(),
    }
}

/// Template and parameter checksums of a payload, keyed for the status record
pub fn payload_checksums(
    payload: &DeploymentPayload,
) -> Result<std::collections::BTreeMap<String, String>> {
    Ok([
        (TEMPLATE_CHECKSUM.to_string(), checksum(&payload.template)?),
        (PARAMETERS_CHECKSUM.to_string(), checksum(&payload.parameters)?),
    ]
    .into_iter()
    .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checksum_is_lowercase_hex_sha256() {
        let sum = checksum(&json!({})).unwrap();
        // sha256("{}")
        assert_eq!(
            sum,
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(checksum(&a).unwrap(), checksum(&b).unwrap());
    }

    #[test]
    fn payload_yields_both_keys() {
        let payload = DeploymentPayload {
            template: json!({"resources": []}),
            parameters: json!({"vmSize": {"value": "Standard_D4s_v3"}}),
        };
        let sums = payload_checksums(&payload).unwrap();
        assert_eq!(sums.len(), 2);
        assert_ne!(sums[TEMPLATE_CHECKSUM], sums[PARAMETERS_CHECKSUM]);
    }
}
