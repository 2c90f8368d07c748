//! Client configuration.

use std::path::PathBuf;
use std::str::FromStr;

use url::Url;

use crate::error::EndorseError;

/// Top-level configuration for [`crate::Client`].
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Key agreement service endpoint. `None` selects the production
    /// default, [`crate::DEFAULT_KEYS_API_ENDPOINT_URL`].
    pub keys_api_endpoint_url: Option<Url>,
    /// Digest algorithm name sent in the `x-soracom-digest-algorithm`
    /// header. Only `SHA-256` (case-insensitive) is recognised.
    pub signature_algorithm: String,
    pub uicc_interface_type: UiccInterfaceType,
    pub key_cache: KeyCacheConfig,
    pub serial: SerialConfig,
}

#[derive(Debug, Clone, Default)]
pub struct KeyCacheConfig {
    /// Lookups always miss and saves are dropped.
    pub disabled: bool,
    /// Delete the cache file before the first use.
    pub clear: bool,
    /// Overrides the profile directory resolution (`SORACOM_PROFILE_DIR`,
    /// then `~/.soracom`).
    pub profile_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity_mode: ParityMode,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            port_name: String::new(),
            baud_rate: 57600,
            data_bits: 8,
            stop_bits: 1,
            parity_mode: ParityMode::None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParityMode {
    #[default]
    None,
    Odd,
    Even,
}

impl From<u8> for ParityMode {
    fn from(v: u8) -> Self {
        match v {
            1 => ParityMode::Odd,
            2 => ParityMode::Even,
            _ => ParityMode::None,
        }
    }
}

/// How to reach the UICC. `None` constructs a client with no transport,
/// used by commands which never touch the SIM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UiccInterfaceType {
    Iso7816,
    Comm,
    #[default]
    AutoDetect,
    None,
}

impl FromStr for UiccInterfaceType {
    type Err = EndorseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "iso7816" => Ok(UiccInterfaceType::Iso7816),
            "comm" => Ok(UiccInterfaceType::Comm),
            "autodetect" => Ok(UiccInterfaceType::AutoDetect),
            _ => Err(EndorseError::UnknownInterfaceType(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_type_from_str() {
        assert_eq!(
            "iso7816".parse::<UiccInterfaceType>().unwrap(),
            UiccInterfaceType::Iso7816
        );
        assert_eq!(
            "COMM".parse::<UiccInterfaceType>().unwrap(),
            UiccInterfaceType::Comm
        );
        assert_eq!(
            "autoDetect".parse::<UiccInterfaceType>().unwrap(),
            UiccInterfaceType::AutoDetect
        );

        let err = "mmcli".parse::<UiccInterfaceType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown UICC interface type: mmcli");
    }

    #[test]
    fn parity_mode_from_int() {
        assert_eq!(ParityMode::from(0), ParityMode::None);
        assert_eq!(ParityMode::from(1), ParityMode::Odd);
        assert_eq!(ParityMode::from(2), ParityMode::Even);
        assert_eq!(ParityMode::from(9), ParityMode::None);
    }
}
