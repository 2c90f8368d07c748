//! macOS serial port discovery: every callout device the I/O registry
//! advertises.

use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::Result;

pub(super) fn list_com_ports() -> Result<Vec<String>> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#""IOCalloutDevice" = "(.*)""#).expect("the ioreg pattern is valid")
    });

    let output = Command::new("ioreg").arg("-l").output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    Ok(re
        .captures_iter(&stdout)
        .map(|c| c[1].to_string())
        .collect())
}
