use thiserror::Error;

pub type Result<T> = std::result::Result<T, EndorseError>;

#[derive(Debug, Error)]
pub enum EndorseError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unknown UICC interface type: {0}")]
    UnknownInterfaceType(String),
    #[error("unknown hash algorithm: {0}")]
    UnknownHashAlgorithm(String),
    #[error("no UICC interface is found")]
    NoUiccInterface,
    #[error("UICC transport error: {0}")]
    Transport(String),
    #[error("key agreement server error: {0}")]
    KeyServer(String),
    #[error("unable to verify master key")]
    MasterKeyVerification,
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}
