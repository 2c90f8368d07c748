//! Provisioning operations: each named operation is a signed JSON call to
//! the provisioning service, authenticated by a cipher key obtained from
//! the SIM via [`endorse_client`].

#[macro_use]
extern crate tracing;

mod operations;
mod params;

use thiserror::Error;
use url::Url;

use endorse_client::EndorseError;

pub use crate::operations::operations_help_text;
pub use crate::params::RequestParameters;

pub const DEFAULT_PROVISIONING_API_ENDPOINT_URL: &str = "https://g.api.soracom.io/";

pub type Result<T> = std::result::Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("unknown operation name: {0}")]
    UnknownOperation(String),
    #[error("unsuccessful response: {0}")]
    UnsuccessfulResponse(String),
    #[error("parameter '{0}' must be specified in --params option")]
    MissingParameter(String),
    #[error("unable to parse --params / -p option")]
    MalformedParameters,
    #[error("{0} must be a string")]
    ParameterType(String),
    #[error("{0} is not found in the response from the server")]
    MissingResponseField(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Endorse(#[from] EndorseError),
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Provisioning service endpoint. `None` selects
    /// [`DEFAULT_PROVISIONING_API_ENDPOINT_URL`].
    pub provisioning_api_endpoint_url: Option<Url>,
    /// Raw `--params` JSON string, passed through to the service and mined
    /// for operation-specific values.
    pub request_parameters: String,
}

pub struct Client {
    base_url: Url,
    request_parameters: String,
    endorse: endorse_client::Client,
}

impl Client {
    pub fn new(cfg: Config, endorse: endorse_client::Client) -> Result<Client> {
        let base_url = match cfg.provisioning_api_endpoint_url {
            Some(url) => url,
            None => Url::parse(DEFAULT_PROVISIONING_API_ENDPOINT_URL)
                .map_err(EndorseError::from)?,
        };

        Ok(Client {
            base_url,
            request_parameters: cfg.request_parameters,
            endorse,
        })
    }

    /// Looks the operation up by name and runs it.
    pub fn perform_operation(&mut self, name: &str) -> Result<()> {
        let op = operations::find(name)
            .ok_or_else(|| ProvisionError::UnknownOperation(name.to_string()))?;
        debug!("performing {}", op.name);
        (op.handler)(self)
    }

    pub(crate) fn resolve_url(&self, path: &str) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}{path}"))
            .map_err(|e| ProvisionError::Endorse(EndorseError::from(e)))
    }

    pub(crate) fn endorse_mut(&mut self) -> &mut endorse_client::Client {
        &mut self.endorse
    }

    /// The `--params` JSON as a property bag; fails when it was never
    /// supplied or does not parse as an object.
    pub(crate) fn request_parameters(&self) -> Result<RequestParameters> {
        RequestParameters::parse(&self.request_parameters)
    }

    /// The `--params` JSON as an optional map for embedding into request
    /// bodies; an empty string becomes `None`.
    pub(crate) fn request_parameters_map(
        &self,
    ) -> Result<Option<serde_json::Map<String, serde_json::Value>>> {
        if self.request_parameters.is_empty() {
            return Ok(None);
        }
        let map = serde_json::from_str(&self.request_parameters)?;
        Ok(Some(map))
    }
}
