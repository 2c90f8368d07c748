//! AT command back-end: talks to a UICC through a cellular modem on a
//! serial port, framing APDUs with `AT+CSIM`.

use std::io::{self, Read, Write};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serialport::{DataBits, Parity, SerialPort, StopBits};

use crate::config::{ParityMode, SerialConfig};
use crate::error::{EndorseError, Result};
use crate::uicc::{UiccAuthResult, UiccInterface};

/// Inter-character timeout; a silent port ends the read loop.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub(crate) struct Comm {
    cfg: SerialConfig,
    port: Box<dyn SerialPort>,
}

impl Comm {
    pub(crate) fn open(cfg: &SerialConfig) -> Result<Comm> {
        debug!("opening comm port: {}", cfg.port_name);
        let port = serialport::new(cfg.port_name.clone(), cfg.baud_rate)
            .data_bits(convert_data_bits(cfg.data_bits))
            .stop_bits(convert_stop_bits(cfg.stop_bits))
            .parity(convert_parity(cfg.parity_mode))
            .timeout(READ_TIMEOUT)
            .open()?;

        let mut comm = Comm {
            cfg: cfg.clone(),
            port,
        };

        debug!("initializing comm port: {}", cfg.port_name);
        exchange(&mut *comm.port, "ATE0V1")?;

        Ok(comm)
    }
}

impl UiccInterface for Comm {
    fn read_imsi(&mut self) -> Result<String> {
        let result = exchange(&mut *self.port, "AT+CIMI")?;
        debug!("response from SIM: {result:?}");
        Ok(result.trim().to_string())
    }

    fn authenticate(&mut self, rand: &[u8], autn: &[u8]) -> Result<UiccAuthResult> {
        authenticate_via_csim(&mut *self.port, rand, autn)
    }

    fn close(&mut self) {
        // Dropping the handle releases the port; nothing to flush.
    }

    fn name(&self) -> &str {
        &self.cfg.port_name
    }

    fn at_command(&mut self, cmd: &str) -> Result<String> {
        exchange(&mut *self.port, cmd)
    }
}

/// Writes one AT command and collects response lines until the modem
/// settles. A line ending `OK` (or the read timeout) ends the exchange; a
/// line ending `ERROR` or containing `+CME ERROR` fails with everything
/// collected so far.
fn exchange<P: Read + Write + ?Sized>(port: &mut P, cmd: &str) -> Result<String> {
    trace!("sending {cmd}");
    port.write_all(cmd.as_bytes())?;
    port.write_all(b"\r\n")?;
    port.flush()?;

    let mut collected = String::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 256];

    loop {
        let n = match port.read(&mut buf) {
            Ok(0) => return Ok(collected),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(collected),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(collected),
            Err(e) => return Err(e.into()),
        };
        pending.extend_from_slice(&buf[..n]);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);

            if line.ends_with("OK") {
                return Ok(collected);
            }

            collected.push_str(line);
            collected.push('\n');

            if line.ends_with("ERROR") || line.contains("+CME ERROR") {
                return Err(EndorseError::Transport(collected));
            }
        }
    }
}

fn authenticate_via_csim<P: Read + Write + ?Sized>(
    port: &mut P,
    rand: &[u8],
    autn: &[u8],
) -> Result<UiccAuthResult> {
    let mut apdu = vec![0x00, 0x88, 0x00, 0x81, (rand.len() + autn.len() + 2) as u8];
    apdu.push(rand.len() as u8);
    apdu.extend_from_slice(rand);
    apdu.push(autn.len() as u8);
    apdu.extend_from_slice(autn);

    let cmd = format!("AT+CSIM={},\"{}\"", apdu.len() * 2, hex::encode(&apdu));
    let result = exchange(port, &cmd)?;
    debug!("response from SIM: {result:?}");

    let rsp = parse_csim_response(&result)?;
    if rsp.len() != 2 || rsp[0] != 0x61 {
        return Err(unexpected_csim());
    }

    let cmd = format!("AT+CSIM=10,\"00C00000{:02X}\"", rsp[1]);
    let result = exchange(port, &cmd)?;
    debug!("response from SIM: {result:?}");

    let rsp = parse_csim_response(&result)?;
    if rsp.len() < 2 || rsp[rsp.len() - 2..] != [0x90, 0x00] {
        return Err(unexpected_csim());
    }

    UiccAuthResult::parse(&rsp[..rsp.len() - 2])
}

fn parse_csim_response(s: &str) -> Result<Vec<u8>> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new("[0-9]+,\"([0-9a-fA-F]*)\"").expect("the +CSIM pattern is valid")
    });

    let s = s.trim().trim_start_matches("+CSIM:").trim();
    let captures = re.captures(s).ok_or_else(unexpected_csim)?;
    hex::decode(&captures[1]).map_err(|_| unexpected_csim())
}

fn unexpected_csim() -> EndorseError {
    EndorseError::Transport("unexpected +CSIM response".to_string())
}

fn convert_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn convert_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

fn convert_parity(mode: ParityMode) -> Parity {
    match mode {
        ParityMode::Odd => Parity::Odd,
        ParityMode::Even => Parity::Even,
        ParityMode::None => Parity::None,
    }
}
