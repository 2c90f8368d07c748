//! The operation registry: a static table of named provisioning calls.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use endorse_client::EndorseError;

use crate::{Client, ProvisionError, Result};

/// Keys derived for Inventory devices are truncated to this length.
const INVENTORY_APPLICATION_KEY_LENGTH: usize = 16;

pub(crate) struct Operation {
    pub name: &'static str,
    pub help: &'static str,
    pub handler: fn(&mut Client) -> Result<()>,
}

pub(crate) const OPERATIONS: &[Operation] = &[
    Operation {
        name: "bootstrapArc",
        help: "perform bootstrap a SORACOM Arc virtual SIM",
        handler: |c| simple_operation(c, "/v1/provisioning/soracom/arc/bootstrap"),
    },
    Operation {
        name: "bootstrapAwsIotThing",
        help: "perform bootstrap as an AWS IoT Thing",
        handler: bootstrap_aws_iot_thing,
    },
    Operation {
        name: "bootstrapInventoryDevice",
        help: "perform bootstrap as an Inventory device",
        handler: bootstrap_inventory_device,
    },
    Operation {
        name: "generateAmazonCognitoOpenIdToken",
        help: "generates an Open ID token using Amazon Cognito",
        handler: |c| simple_operation(c, "/v1/provisioning/aws/cognito/open_id_tokens"),
    },
    Operation {
        name: "generateAmazonCognitoSessionCredentials",
        help: "generates a temporary session token using Amazon Cognito",
        handler: |c| simple_operation(c, "/v1/provisioning/aws/cognito/credentials"),
    },
    Operation {
        name: "getSubscriberMetadata",
        help: "gets subscriber's metadata",
        handler: |c| simple_operation(c, "/v1/provisioning/soracom/air/subscriber_metadata"),
    },
    Operation {
        name: "getUserData",
        help: "gets userdata from group configuration",
        handler: |c| simple_operation(c, "/v1/provisioning/soracom/air/userdata"),
    },
];

pub(crate) fn find(name: &str) -> Option<&'static Operation> {
    OPERATIONS.iter().find(|op| op.name == name)
}

/// Formats the `--operation` flag's long help: every operation name, sorted,
/// with its description lined up in a column.
pub fn operations_help_text() -> String {
    let mut names: Vec<&str> = OPERATIONS.iter().map(|op| op.name).collect();
    names.sort_unstable();

    let width = names.iter().map(|n| n.len()).max().unwrap_or(0) + 3;
    let lines: Vec<String> = names
        .iter()
        .filter_map(|name| find(name))
        .map(|op| format!("\t{:<width$}{}", op.name, op.help))
        .collect();

    format!(
        "Choose which type of provisioning API will be performed. (required)\nPossible values:\n{}",
        lines.join("\n")
    )
}

#[derive(Serialize)]
struct ProvisioningRequest<'a> {
    #[serde(rename = "keyId")]
    key_id: &'a str,
    #[serde(rename = "endpoint", skip_serializing_if = "Option::is_none")]
    endpoint: Option<&'a str>,
    #[serde(rename = "requestParameters", skip_serializing_if = "Option::is_none")]
    request_parameters: Option<Map<String, Value>>,
}

/// The common shape: authenticate, post `{keyId, requestParameters?}` to
/// the path, print the response body. Status codes through 400 are accepted.
fn simple_operation(c: &mut Client, path: &str) -> Result<()> {
    let ar = c.endorse_mut().do_authentication()?;
    let url = c.resolve_url(path)?;

    let body = ProvisioningRequest {
        key_id: &ar.key_id,
        endpoint: None,
        request_parameters: c.request_parameters_map()?,
    };

    let resp = c
        .endorse_mut()
        .post_with_signature(&url, &ar.ck, &body)
        .map_err(ProvisionError::Endorse)?;

    let status = resp.status();
    if status.as_u16() > 400 {
        return Err(ProvisionError::UnsuccessfulResponse(status.to_string()));
    }

    let text = resp.text().map_err(EndorseError::from)?;
    debug!("received response: {text}");
    println!("{text}");
    Ok(())
}

fn bootstrap_aws_iot_thing(c: &mut Client) -> Result<()> {
    let ar = c.endorse_mut().do_authentication()?;
    let url = c.resolve_url("/v1/provisioning/aws/iot/bootstrap")?;

    let body = ProvisioningRequest {
        key_id: &ar.key_id,
        endpoint: None,
        request_parameters: c.request_parameters_map()?,
    };

    let resp = c
        .endorse_mut()
        .post_with_signature(&url, &ar.ck, &body)
        .map_err(ProvisionError::Endorse)?;

    let text = resp.text().map_err(EndorseError::from)?;
    debug!("received response: {text}");
    println!("{text}");
    Ok(())
}

fn bootstrap_inventory_device(c: &mut Client) -> Result<()> {
    let ar = c.endorse_mut().do_authentication()?;
    let url = c.resolve_url("/v1/provisioning/soracom/inventory/bootstrap")?;

    let params = c.request_parameters()?;
    let endpoint = params.get_str("endpoint")?.to_string();

    let body = ProvisioningRequest {
        key_id: &ar.key_id,
        endpoint: Some(&endpoint),
        request_parameters: c.request_parameters_map()?,
    };

    let resp = c
        .endorse_mut()
        .post_with_signature(&url, &ar.ck, &body)
        .map_err(ProvisionError::Endorse)?;
    let text = resp.text().map_err(EndorseError::from)?;

    let mut response: Map<String, Value> = serde_json::from_str(&text)?;

    let app_key = application_key_for_inventory(&response, &ar.ck)?;
    response.insert("applicationKey".to_string(), Value::String(app_key));

    let filtered = filter_map(&response, &["applicationKey", "serverUri", "pskId"]);
    println!("{}", serde_json::to_string(&filtered)?);
    Ok(())
}

/// Uses the server-issued application key when present; otherwise derives
/// one from the bootstrap nonce, timestamp and CK.
fn application_key_for_inventory(response: &Map<String, Value>, ck: &[u8]) -> Result<String> {
    if let Some(Value::String(app_key)) = response.get("applicationKey") {
        return Ok(app_key.clone());
    }

    let nonce = response
        .get("nonce")
        .ok_or_else(|| ProvisionError::MissingResponseField("nonce".to_string()))?
        .as_str()
        .ok_or_else(|| ProvisionError::ParameterType("nonce".to_string()))?;
    let nonce = BASE64
        .decode(nonce.as_bytes())
        .map_err(|_| ProvisionError::ParameterType("nonce".to_string()))?;

    let timestamp = response
        .get("timestamp")
        .ok_or_else(|| ProvisionError::MissingResponseField("timestamp".to_string()))?
        .as_str()
        .ok_or_else(|| ProvisionError::ParameterType("timestamp".to_string()))?;

    let app_key = derive_inventory_application_key(&nonce, timestamp, ck);
    Ok(BASE64.encode(app_key))
}

fn derive_inventory_application_key(nonce: &[u8], timestamp: &str, ck: &[u8]) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(nonce);
    h.update(timestamp.as_bytes());
    h.update(ck);
    h.finalize()[..INVENTORY_APPLICATION_KEY_LENGTH].to_vec()
}

fn filter_map(m: &Map<String, Value>, keep: &[&str]) -> Map<String, Value> {
    m.iter()
        .filter(|(k, _)| keep.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
