//! UICC transport abstraction.
//!
//! A [`UiccInterface`] exposes the two things the AKA exchange needs from a
//! SIM, reading the IMSI and running INTERNAL AUTHENTICATE, regardless of
//! whether the card sits in a PC/SC reader ([`iso7816`]) or behind an AT
//! command modem ([`comm`]).

pub(crate) mod comm;
pub(crate) mod detect;
pub(crate) mod iso7816;

use std::fmt;

use crate::config::{Config, UiccInterfaceType};
use crate::error::{EndorseError, Result};

/// A connection to a single UICC.
pub trait UiccInterface: Send {
    /// Reads the subscriber identity as a decimal digit string.
    fn read_imsi(&mut self) -> Result<String>;

    /// Runs the AKA challenge on the card and returns its verdict.
    fn authenticate(&mut self, rand: &[u8], autn: &[u8]) -> Result<UiccAuthResult>;

    /// Releases the underlying device. Idempotent.
    fn close(&mut self);

    /// Human-readable device name (reader name or port path).
    fn name(&self) -> &str;

    /// Sends a raw AT command and returns the response payload. Only the
    /// serial modem back-end supports this.
    fn at_command(&mut self, _cmd: &str) -> Result<String> {
        Err(EndorseError::Config(
            "get device info works only with comm ports".to_string(),
        ))
    }
}

impl fmt::Debug for dyn UiccInterface + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UiccInterface").field("name", &self.name()).finish()
    }
}

/// Outcome of INTERNAL AUTHENTICATE, decoded from the card's response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiccAuthResult {
    Success {
        res: Vec<u8>,
        ck: Vec<u8>,
        ik: Vec<u8>,
        kc: Vec<u8>,
    },
    SynchronisationFailure {
        auts: Vec<u8>,
    },
}

impl UiccAuthResult {
    /// Parses the authentication response body. A leading `0xDB` carries
    /// four length-prefixed fields (RES, CK, IK, KC); a leading `0xDC`
    /// carries a single length-prefixed AUTS.
    pub(crate) fn parse(rsp: &[u8]) -> Result<UiccAuthResult> {
        match rsp.first() {
            Some(0xdb) => {
                let mut r = &rsp[1..];
                let res = take_field(&mut r)?;
                let ck = take_field(&mut r)?;
                let ik = take_field(&mut r)?;
                let kc = take_field(&mut r)?;
                Ok(UiccAuthResult::Success { res, ck, ik, kc })
            }
            Some(0xdc) => {
                let mut r = &rsp[1..];
                let auts = take_field(&mut r)?;
                Ok(UiccAuthResult::SynchronisationFailure { auts })
            }
            _ => Err(EndorseError::Transport(
                "unable to authenticate".to_string(),
            )),
        }
    }
}

fn take_field(r: &mut &[u8]) -> Result<Vec<u8>> {
    let (&len, rest) = r.split_first().ok_or_else(truncated)?;
    let len = len as usize;
    if rest.len() < len {
        return Err(truncated());
    }
    let (field, rest) = rest.split_at(len);
    *r = rest;
    Ok(field.to_vec())
}

fn truncated() -> EndorseError {
    EndorseError::Transport("truncated authentication response".to_string())
}

/// Opens the transport selected by the configuration, racing all candidate
/// devices for [`UiccInterfaceType::AutoDetect`].
pub(crate) fn open_interface(cfg: &Config) -> Result<Option<Box<dyn UiccInterface>>> {
    match cfg.uicc_interface_type {
        UiccInterfaceType::Iso7816 => Ok(Some(Box::new(iso7816::Iso7816::new(0)?))),
        UiccInterfaceType::Comm => Ok(Some(Box::new(comm::Comm::open(&cfg.serial)?))),
        UiccInterfaceType::AutoDetect => Ok(Some(detect::auto_detect(cfg)?)),
        UiccInterfaceType::None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_response() {
        let mut rsp = vec![0xdb, 0x08];
        rsp.extend_from_slice(&[0x11; 8]); // RES
        rsp.push(0x10);
        rsp.extend_from_slice(&[0x22; 16]); // CK
        rsp.push(0x10);
        rsp.extend_from_slice(&[0x33; 16]); // IK
        rsp.push(0x08);
        rsp.extend_from_slice(&[0x44; 8]); // KC

        let parsed = UiccAuthResult::parse(&rsp).unwrap();
        assert_eq!(
            parsed,
            UiccAuthResult::Success {
                res: vec![0x11; 8],
                ck: vec![0x22; 16],
                ik: vec![0x33; 16],
                kc: vec![0x44; 8],
            }
        );
    }

    #[test]
    fn parses_synchronisation_failure() {
        let mut rsp = vec![0xdc, 0x0e];
        rsp.extend_from_slice(&[0x55; 14]); // AUTS

        let parsed = UiccAuthResult::parse(&rsp).unwrap();
        assert_eq!(
            parsed,
            UiccAuthResult::SynchronisationFailure {
                auts: vec![0x55; 14]
            }
        );
    }

    #[test]
    fn rejects_unknown_leading_byte() {
        let err = UiccAuthResult::parse(&[0x90, 0x00]).unwrap_err();
        assert!(err.to_string().contains("unable to authenticate"));
    }

    #[test]
    fn rejects_truncated_fields() {
        assert!(UiccAuthResult::parse(&[0xdb, 0x08, 0x11]).is_err());
        assert!(UiccAuthResult::parse(&[0xdc]).is_err());
        assert!(UiccAuthResult::parse(&[]).is_err());
    }
}
