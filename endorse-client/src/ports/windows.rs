//! Windows serial port discovery via the SERIALCOMM device map.

use winreg::enums::HKEY_LOCAL_MACHINE;
use winreg::types::FromRegValue;
use winreg::RegKey;

use crate::error::Result;

pub(super) fn list_com_ports() -> Result<Vec<String>> {
    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    let key = hklm.open_subkey(r"HARDWARE\DEVICEMAP\SERIALCOMM")?;

    let mut ports = Vec::new();
    for value in key.enum_values() {
        let (_, data) = value?;
        if let Ok(port) = String::from_reg_value(&data) {
            ports.push(port);
        }
    }
    Ok(ports)
}
