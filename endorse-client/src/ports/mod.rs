//! Platform-specific device enumeration: candidate serial ports for the AT
//! back-end and PC/SC readers for the ISO 7816 back-end.

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
compile_error!("serial port enumeration is not implemented on this platform");

#[cfg_attr(target_os = "linux", path = "linux.rs")]
#[cfg_attr(target_os = "macos", path = "macos.rs")]
#[cfg_attr(target_os = "windows", path = "windows.rs")]
mod os;

use std::ffi::CString;

use pcsc::{Context, Scope};

use crate::error::Result;

/// Lists serial devices which could host an AT command modem.
pub(crate) fn list_com_ports() -> Result<Vec<String>> {
    os::list_com_ports()
}

/// Lists connected PC/SC smart-card readers by name.
pub(crate) fn list_card_readers() -> Result<Vec<String>> {
    let ctx = Context::establish(Scope::User)?;

    let mut readers_buf = vec![0; ctx.list_readers_len()?];
    let readers: Vec<CString> = ctx
        .list_readers(&mut readers_buf)?
        .map(|r| r.to_owned())
        .collect();

    Ok(readers
        .into_iter()
        .map(|r| r.to_string_lossy().into_owned())
        .collect())
}
