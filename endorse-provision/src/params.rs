//! Late-bound access to the caller-supplied `--params` JSON: a string-keyed
//! value tree with typed accessors that fail when a required name is absent
//! or of the wrong shape.

use serde_json::{Map, Value};

use crate::{ProvisionError, Result};

pub struct RequestParameters(Map<String, Value>);

impl RequestParameters {
    pub(crate) fn parse(raw: &str) -> Result<RequestParameters> {
        if raw.is_empty() {
            // Nothing was supplied; lookups report the missing name.
            return Ok(RequestParameters(Map::new()));
        }
        let map: Map<String, Value> =
            serde_json::from_str(raw).map_err(|_| ProvisionError::MalformedParameters)?;
        Ok(RequestParameters(map))
    }

    pub fn get(&self, name: &str) -> Result<&Value> {
        self.0
            .get(name)
            .ok_or_else(|| ProvisionError::MissingParameter(name.to_string()))
    }

    pub fn get_str(&self, name: &str) -> Result<&str> {
        self.get(name)?
            .as_str()
            .ok_or_else(|| ProvisionError::ParameterType(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_access() {
        let params = RequestParameters::parse(r#"{"endpoint":"coap://example.com","n":3}"#)
            .unwrap();
        assert_eq!(params.get_str("endpoint").unwrap(), "coap://example.com");
        assert_eq!(params.get("n").unwrap(), 3);
    }

    #[test]
    fn missing_name_fails() {
        let params = RequestParameters::parse(r#"{"a":1}"#).unwrap();
        let err = params.get_str("endpoint").unwrap_err();
        assert_eq!(
            err.to_string(),
            "parameter 'endpoint' must be specified in --params option"
        );
    }

    #[test]
    fn wrong_shape_fails() {
        let params = RequestParameters::parse(r#"{"endpoint":42}"#).unwrap();
        let err = params.get_str("endpoint").unwrap_err();
        assert_eq!(err.to_string(), "endpoint must be a string");
    }

    #[test]
    fn empty_input_reports_the_missing_name() {
        let params = RequestParameters::parse("").unwrap();
        assert!(matches!(
            params.get("endpoint"),
            Err(ProvisionError::MissingParameter(_))
        ));
    }

    #[test]
    fn invalid_input_fails() {
        assert!(RequestParameters::parse("not json").is_err());
        assert!(RequestParameters::parse("[1,2]").is_err());
    }
}
