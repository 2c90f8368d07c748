//! `endorse-client` authenticates a cellular subscriber against a remote
//! key-agreement service using the SIM itself as the cryptographic engine.
//!
//! The library drives the 3GPP AKA challenge/response exchange over a
//! physical UICC, reachable either through a PC/SC smart-card reader
//! ([ISO 7816 APDUs][crate::UiccInterfaceType::Iso7816]) or through an AT
//! command modem on a serial port
//! ([`+CSIM` framing][crate::UiccInterfaceType::Comm]). The cipher key (CK)
//! produced by a successful exchange is cached in an encrypted, signed file
//! and used to sign subsequent provisioning requests.
//!
//! The entry point is [`Client`]: construct one from a [`Config`], then call
//! [`Client::do_authentication`] to obtain an [`AuthenticationResult`], and
//! [`Client::post_with_signature`] to issue signed HTTP calls with it.

#[macro_use]
extern crate tracing;

mod cache;
mod cipher;
mod client;
mod config;
mod error;
mod ports;
mod tlv;
mod uicc;
mod util;

pub use crate::{
    client::{AuthenticationResult, Client, DEFAULT_KEYS_API_ENDPOINT_URL},
    config::{Config, KeyCacheConfig, ParityMode, SerialConfig, UiccInterfaceType},
    error::{EndorseError, Result},
    uicc::{UiccAuthResult, UiccInterface},
};
