//! Linux serial port discovery via sysfs.
//!
//! Every entry under `/sys/class/tty` is a candidate. Virtual consoles are
//! skipped by their sysfs path; legacy `serial8250` nodes are probed with
//! the `TIOCGSERIAL` ioctl because the driver registers all of them whether
//! or not a UART is actually present.

#![allow(non_camel_case_types)]

use std::fs;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::ioctl_read_bad;
use nix::libc;

use crate::error::Result;

const TTY_DIR: &str = "/sys/class/tty";
const PORT_UNKNOWN: libc::c_int = 0;

// From linux/serial.h.
#[repr(C)]
struct serial_struct {
    type_: libc::c_int,
    line: libc::c_int,
    port: libc::c_uint,
    irq: libc::c_int,
    flags: libc::c_int,
    xmit_fifo_size: libc::c_int,
    custom_divisor: libc::c_int,
    baud_base: libc::c_int,
    close_delay: libc::c_ushort,
    io_type: libc::c_char,
    reserved_char: [libc::c_char; 1],
    hub6: libc::c_int,
    closing_wait: libc::c_ushort,
    closing_wait2: libc::c_ushort,
    iomem_base: *mut libc::c_uchar,
    iomem_reg_shift: libc::c_ushort,
    port_high: libc::c_uint,
    iomap_base: libc::c_ulong,
}

ioctl_read_bad!(tiocgserial, libc::TIOCGSERIAL, serial_struct);

pub(super) fn list_com_ports() -> Result<Vec<String>> {
    let mut result = Vec::new();

    for entry in fs::read_dir(TTY_DIR)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();

        let mut candidate = entry.path();
        match candidate.symlink_metadata() {
            Ok(meta) if !meta.file_type().is_symlink() => candidate.push("device"),
            Ok(_) => {}
            Err(_) => {
                trace!("lstat failed on {candidate:?}");
                continue;
            }
        }

        let target = match fs::read_link(&candidate) {
            Ok(t) => t,
            Err(_) => {
                trace!("readlink failed on {candidate:?}");
                continue;
            }
        };
        let target = target.to_string_lossy();

        if target.contains("virtual") {
            continue;
        }

        let device_path = format!("/dev/{name}");
        if target.contains("serial8250") && !is_present_8250(Path::new(&device_path)) {
            continue;
        }

        result.push(device_path);
    }

    Ok(result)
}

/// Asks the 8250 driver whether a UART was actually detected on the port.
fn is_present_8250(device: &Path) -> bool {
    let file = match fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
        .open(device)
    {
        Ok(f) => f,
        Err(e) => {
            trace!("open failed on {device:?}: {e}");
            return false;
        }
    };

    let mut info: serial_struct = unsafe { std::mem::zeroed() };
    match unsafe { tiocgserial(file.as_raw_fd(), &mut info) } {
        Ok(_) => info.type_ != PORT_UNKNOWN,
        Err(e) => {
            trace!("TIOCGSERIAL failed on {device:?}: {e}");
            false
        }
    }
}
