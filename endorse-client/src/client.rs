//! The client: runs the AKA exchange against the key agreement service and
//! the UICC, and issues digest-signed provisioning requests with the
//! resulting cipher key.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::cache::{self, KeyCache};
use crate::config::Config;
use crate::error::{EndorseError, Result};
use crate::uicc::{self, UiccAuthResult, UiccInterface};
use crate::util::{b64, b64_opt};

pub const DEFAULT_KEYS_API_ENDPOINT_URL: &str = "https://g.api.soracom.io/v1/keys";

/// Outcome of a completed AKA round: the key the service knows us by, and
/// the cipher key both sides derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationResult {
    #[serde(rename = "keyId")]
    pub key_id: String,
    pub imsi: String,
    #[serde(with = "b64")]
    pub ck: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct Challenge {
    #[serde(rename = "keyId")]
    key_id: String,
    #[serde(alias = "RAND", with = "b64")]
    rand: Vec<u8>,
    #[serde(alias = "AUTN", with = "b64")]
    autn: Vec<u8>,
}

#[derive(Serialize)]
struct StartAkaRequest<'a> {
    imsi: &'a str,
    #[serde(skip_serializing_if = "Option::is_none", with = "b64_opt")]
    rand: Option<&'a [u8]>,
    #[serde(skip_serializing_if = "Option::is_none", with = "b64_opt")]
    auts: Option<&'a [u8]>,
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    #[serde(serialize_with = "b64::serialize")]
    res: &'a [u8],
}

pub struct Client {
    cfg: Config,
    keys_url: Url,
    key_cache: Box<dyn KeyCache>,
    ui: Option<Box<dyn UiccInterface>>,
    http: HttpClient,
}

impl Client {
    /// Opens the UICC transport selected by the configuration and loads the
    /// key cache.
    pub fn new(cfg: Config) -> Result<Client> {
        let ui = uicc::open_interface(&cfg)?;
        Client::build(cfg, ui)
    }

    /// As [`Client::new`], with a caller-provided transport.
    pub fn with_interface(cfg: Config, ui: Box<dyn UiccInterface>) -> Result<Client> {
        Client::build(cfg, Some(ui))
    }

    fn build(cfg: Config, ui: Option<Box<dyn UiccInterface>>) -> Result<Client> {
        let keys_url = match &cfg.keys_api_endpoint_url {
            Some(url) => url.clone(),
            None => Url::parse(DEFAULT_KEYS_API_ENDPOINT_URL)?,
        };

        let key_cache = cache::new_key_cache(&cfg.key_cache);
        let http = HttpClient::builder().build()?;

        Ok(Client {
            cfg,
            keys_url,
            key_cache,
            ui,
            http,
        })
    }

    pub fn close(&mut self) {
        if let Some(ui) = &mut self.ui {
            ui.close();
        }
        self.ui = None;
    }

    /// Produces an [`AuthenticationResult`] for the inserted SIM, from the
    /// cache when possible, otherwise by a full AKA round:
    /// challenge from the service, INTERNAL AUTHENTICATE on the card,
    /// verification of the response. A synchronisation failure from the
    /// card restarts the exchange once with the card's AUTS.
    pub fn do_authentication(&mut self) -> Result<AuthenticationResult> {
        let ui = self
            .ui
            .as_mut()
            .ok_or_else(|| EndorseError::Config("unable to open UICC interface".to_string()))?;

        let imsi = ui.read_imsi()?;

        if let Some(ar) = self.key_cache.find(&imsi) {
            debug!("master key found in the key cache");
            return Ok(ar);
        }

        debug!("start AKA (request 'challenge')");
        let chal = start_aka(&self.http, &self.keys_url, &imsi, None, None)?;
        let mut key_id = chal.key_id;

        debug!("authenticate using sim");
        let uar = ui.authenticate(&chal.rand, &chal.autn)?;

        let ck = match uar {
            UiccAuthResult::Success { res, ck, .. } => {
                debug!("finish AKA (send 'response' for the 'challenge')");
                finish_aka(&self.http, &self.keys_url, &key_id, &res).map_err(|e| {
                    debug!("verification failed: {e}");
                    EndorseError::MasterKeyVerification
                })?;
                ck
            }
            UiccAuthResult::SynchronisationFailure { auts } => {
                debug!("restart AKA (resync)");
                let chal = start_aka(
                    &self.http,
                    &self.keys_url,
                    &imsi,
                    Some(&chal.rand),
                    Some(&auts),
                )?;
                key_id = chal.key_id;

                debug!("authenticate using sim");
                match ui.authenticate(&chal.rand, &chal.autn)? {
                    UiccAuthResult::Success { res, ck, .. } => {
                        debug!("verifying master key");
                        finish_aka(&self.http, &self.keys_url, &key_id, &res)?;
                        ck
                    }
                    UiccAuthResult::SynchronisationFailure { .. } => {
                        return Err(EndorseError::Transport(
                            "synchronisation failed twice".to_string(),
                        ));
                    }
                }
            }
        };

        let ar = AuthenticationResult { key_id, imsi, ck };

        debug!("saving master key to key cache");
        if let Err(e) = self.key_cache.save(&ar.imsi, &ar) {
            debug!("error occurred while saving master key to key cache: {e}");
        }

        Ok(ar)
    }

    /// POSTs a JSON body with the digest-signature headers the provisioning
    /// service requires. The signature is a plain digest over
    /// `body ‖ timestamp-millis ‖ CK`, not an HMAC.
    pub fn post_with_signature<T: Serialize>(
        &self,
        url: &Url,
        ck: &[u8],
        body: &T,
    ) -> Result<Response> {
        let body_bytes = serde_json::to_vec(body)?;
        debug!("posting JSON to a service: {}", String::from_utf8_lossy(&body_bytes));

        let timestamp = current_timestamp_millis();
        let sig = calculate_signature(
            &self.cfg.signature_algorithm,
            &body_bytes,
            &timestamp,
            ck,
        )?;
        debug!("calculated signature: {}", hex::encode(&sig));

        let resp = self
            .http
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header("x-soracom-timestamp", timestamp.as_str())
            .header("x-soracom-digest-algorithm", self.cfg.signature_algorithm.as_str())
            .header("x-soracom-signature", BASE64.encode(&sig))
            .body(body_bytes)
            .send()?;

        Ok(resp)
    }

    /// Lists candidate serial devices on this machine.
    pub fn list_com_ports(&self) -> Result<Vec<String>> {
        crate::ports::list_com_ports()
    }

    /// Queries the modem for its identity. Only meaningful for the serial
    /// back-end.
    pub fn device_info(&mut self) -> Result<String> {
        let ui = self
            .ui
            .as_mut()
            .ok_or_else(|| EndorseError::Config("unable to open UICC interface".to_string()))?;

        let manufacturer = ui.at_command("AT+CGMI")?;
        let model = ui.at_command("AT+CGMM")?;
        let revision = ui.at_command("AT+CGMR")?;
        let serial_number = ui.at_command("AT+CGSN")?;

        Ok(format!(
            "Manufacturer: {}\nModel: {}\nRevision: {}\nS/N: {}",
            manufacturer.trim(),
            model.trim(),
            revision.trim(),
            serial_number.trim(),
        ))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

fn start_aka(
    http: &HttpClient,
    keys_url: &Url,
    imsi: &str,
    rand: Option<&[u8]>,
    auts: Option<&[u8]>,
) -> Result<Challenge> {
    let req = StartAkaRequest { imsi, rand, auts };
    let body = serde_json::to_vec(&req)?;
    debug!(
        "request url == {keys_url}, body == {}",
        String::from_utf8_lossy(&body)
    );

    let resp = http
        .post(keys_url.clone())
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()?;

    let status = resp.status();
    let text = resp.text()?;
    debug!("status == {status}, resp == {text}");

    if status.as_u16() != 200 && status.as_u16() != 401 {
        return Err(EndorseError::KeyServer(format!(
            "key agreement url responded with error: {status}"
        )));
    }

    let chal: Challenge = serde_json::from_str(&text)?;
    Ok(chal)
}

fn finish_aka(http: &HttpClient, keys_url: &Url, key_id: &str, res: &[u8]) -> Result<()> {
    let url = format!("{keys_url}/{key_id}/verify");
    let body = serde_json::to_vec(&VerifyRequest { res })?;
    debug!("url: {url}, sending body == {}", String::from_utf8_lossy(&body));

    let resp = http
        .post(url.as_str())
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()?;

    if resp.status().as_u16() != 200 {
        return Err(EndorseError::KeyServer(
            "unsuccessful response from key agreement server".to_string(),
        ));
    }

    Ok(())
}

fn current_timestamp_millis() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    millis.to_string()
}

/// Resolves the digest by its configured name and hashes
/// `body ‖ timestamp ‖ ck`. Only `SHA-256` is recognised.
pub(crate) fn calculate_signature(
    algorithm: &str,
    body: &[u8],
    timestamp: &str,
    ck: &[u8],
) -> Result<Vec<u8>> {
    match algorithm.to_ascii_lowercase().as_str() {
        "sha-256" => {
            let mut h = Sha256::new();
            h.update(body);
            h.update(timestamp.as_bytes());
            h.update(ck);
            Ok(h.finalize().to_vec())
        }
        _ => Err(EndorseError::UnknownHashAlgorithm(algorithm.to_string())),
    }
}
