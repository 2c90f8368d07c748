//! Auto-detection: race every candidate serial port and smart-card reader,
//! return the first interface that produces an IMSI.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::config::{Config, SerialConfig};
use crate::error::{EndorseError, Result};
use crate::ports;
use crate::uicc::{comm::Comm, iso7816::Iso7816, UiccInterface};

/// Cap on how long the drain thread keeps waiting for stragglers; a hung
/// probe must not outlive the process.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

type Probe = Box<dyn FnOnce() -> Option<Box<dyn UiccInterface>> + Send>;

pub(crate) fn auto_detect(cfg: &Config) -> Result<Box<dyn UiccInterface>> {
    let mut probes: Vec<Probe> = Vec::new();

    match ports::list_com_ports() {
        Ok(port_names) => {
            for port_name in port_names {
                let serial = SerialConfig {
                    port_name,
                    ..cfg.serial.clone()
                };
                probes.push(Box::new(move || probe_comm_port(serial)));
            }
        }
        Err(e) => debug!("error occurred while trying COM ports: {e}"),
    }

    match ports::list_card_readers() {
        Ok(readers) => {
            for (index, reader) in readers.into_iter().enumerate() {
                probes.push(Box::new(move || probe_card_reader(index, &reader)));
            }
        }
        Err(e) => debug!("error occurred while trying smart card readers: {e}"),
    }

    race(probes)
}

/// Runs every probe on its own thread and returns the first interface that
/// comes back working. The remaining results are drained in the background
/// and their interfaces closed; a probe that never completes is abandoned
/// after [`DRAIN_TIMEOUT`].
fn race(probes: Vec<Probe>) -> Result<Box<dyn UiccInterface>> {
    let n = probes.len();
    if n == 0 {
        return Err(EndorseError::NoUiccInterface);
    }

    let (tx, rx) = mpsc::sync_channel::<Option<Box<dyn UiccInterface>>>(1);
    for probe in probes {
        let tx = tx.clone();
        thread::spawn(move || {
            // The receiver hangs up once a winner is drained; nothing to do.
            let _ = tx.send(probe());
        });
    }
    drop(tx);

    for i in 0..n {
        match rx.recv() {
            Ok(Some(ui)) => {
                debug!("found the first working interface: {}", ui.name());
                let remaining = n - i - 1;
                thread::spawn(move || {
                    for _ in 0..remaining {
                        match rx.recv_timeout(DRAIN_TIMEOUT) {
                            Ok(Some(mut other)) => {
                                debug!("closing: {}", other.name());
                                other.close();
                            }
                            Ok(None) => {}
                            Err(_) => break,
                        }
                    }
                });
                return Ok(ui);
            }
            Ok(None) => {}
            Err(_) => break,
        }
    }

    Err(EndorseError::NoUiccInterface)
}

fn probe_comm_port(serial: SerialConfig) -> Option<Box<dyn UiccInterface>> {
    debug!("trying comm port: {}", serial.port_name);
    let mut port = match Comm::open(&serial) {
        Ok(port) => port,
        Err(e) => {
            debug!("unable to open port {}: {e}", serial.port_name);
            return None;
        }
    };

    match port.read_imsi() {
        Ok(imsi) if !imsi.is_empty() => {
            debug!("found working port: {}", serial.port_name);
            Some(Box::new(port))
        }
        _ => {
            debug!("unable to read IMSI on port: {}", serial.port_name);
            port.close();
            None
        }
    }
}

fn probe_card_reader(index: usize, reader: &str) -> Option<Box<dyn UiccInterface>> {
    debug!("trying smart card reader: {reader}");
    let mut card = match Iso7816::new(index) {
        Ok(card) => card,
        Err(e) => {
            debug!("unable to connect to reader {reader}: {e}");
            return None;
        }
    };

    match card.read_imsi() {
        Ok(imsi) if !imsi.is_empty() => {
            debug!("found working smart card: {reader}");
            Some(Box::new(card))
        }
        _ => {
            debug!("unable to read IMSI on reader: {reader}");
            card.close();
            None
        }
    }
}
