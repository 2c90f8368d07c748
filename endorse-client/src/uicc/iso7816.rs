//! ISO 7816 back-end: talks APDUs to a UICC in a PC/SC smart-card reader.

use std::ffi::CString;

use pcsc::{Card, Context, Disposition, Protocols, Scope, ShareMode, MAX_BUFFER_SIZE};

use crate::error::{EndorseError, Result};
use crate::tlv::Tlv;
use crate::uicc::{UiccAuthResult, UiccInterface};
use crate::util::decode_tbcd;

const CLA_UICC: u8 = 0x00;
const INS_INTERNAL_AUTHENTICATE: u8 = 0x88;
const INS_SELECT: u8 = 0xa4;
const INS_READ_BINARY: u8 = 0xb0;
const INS_READ_RECORD: u8 = 0xb2;
const INS_GET_RESPONSE: u8 = 0xc0;

const FID_MF: [u8; 2] = [0x3f, 0x00];
const FID_EF_DIR: [u8; 2] = [0x2f, 0x00];
const FID_EF_IMSI: [u8; 2] = [0x6f, 0x07];

pub(crate) struct Iso7816 {
    name: String,
    card: Option<Card>,
    // The context must outlive the card handle.
    _ctx: Context,
    adf_usim: Option<Vec<u8>>,
}

impl Iso7816 {
    /// Connects to the card in the reader at `index`.
    pub(crate) fn new(index: usize) -> Result<Iso7816> {
        let ctx = Context::establish(Scope::User)?;

        let mut readers_buf = vec![0; ctx.list_readers_len()?];
        let readers: Vec<CString> = ctx
            .list_readers(&mut readers_buf)?
            .map(|r| r.to_owned())
            .collect();

        let reader = readers.get(index).ok_or_else(|| {
            EndorseError::Transport("no smartcard readers found at the specified index".to_string())
        })?;

        let card = ctx.connect(reader, ShareMode::Shared, Protocols::ANY)?;

        Ok(Iso7816 {
            name: reader.to_string_lossy().into_owned(),
            card: Some(card),
            _ctx: ctx,
            adf_usim: None,
        })
    }

    fn transmit(&self, req: &[u8]) -> Result<Vec<u8>> {
        let card = self
            .card
            .as_ref()
            .ok_or_else(|| EndorseError::Transport("card connection is closed".to_string()))?;

        trace!(">>> {:02x?}", req);
        let mut rsp_buf = [0; MAX_BUFFER_SIZE];
        let rsp = card.transmit(req, &mut rsp_buf)?;
        trace!("<<< {:02x?}", rsp);

        Ok(rsp.to_vec())
    }

    fn ensure_adf_usim(&mut self) -> Result<Vec<u8>> {
        if let Some(aid) = &self.adf_usim {
            return Ok(aid.clone());
        }
        let aid = self.find_adf_usim()?;
        self.adf_usim = Some(aid.clone());
        Ok(aid)
    }

    /// Locates the USIM application by reading the first EF_DIR record.
    fn find_adf_usim(&self) -> Result<Vec<u8>> {
        // P1 = 0x00: select by file identifier
        // P2 = 0x04: return the FCP template, first or only occurrence
        let rsp = self.transmit(&select_apdu(0x00, 0x04, &FID_MF))?;
        if !is_successful_sw(&rsp) {
            return Err(EndorseError::Transport(format!(
                "unsuccessful response for SELECT MF: {}",
                hex::encode(&rsp)
            )));
        }

        let rsp = self.transmit(&select_apdu(0x00, 0x04, &FID_EF_DIR))?;
        if !is_successful_sw(&rsp) {
            return Err(EndorseError::Transport(
                "unsuccessful response for SELECT EF_DIR".to_string(),
            ));
        }
        if rsp[rsp.len() - 2] != 0x61 {
            return Err(EndorseError::Transport(
                "no response data for SELECT EF_DIR".to_string(),
            ));
        }

        let rsp = self.transmit(&get_response_apdu(0x00, 0x00, rsp[rsp.len() - 1]))?;
        if !is_successful_sw(&rsp) {
            return Err(EndorseError::Transport(
                "unsuccessful response for GET RESPONSE".to_string(),
            ));
        }

        let fcp = parse_fcp(&rsp)?;
        let record_size = fcp.record_size().ok_or_else(|| {
            EndorseError::Transport("EF_DIR file descriptor carries no record size".to_string())
        })?;

        // P1 = 0x01: record number 1
        // P2 = 0x04: absolute addressing by the record number in P1
        let rsp = self.transmit(&read_record_apdu(0x01, 0x04, record_size[1]))?;
        if !is_successful_sw(&rsp) {
            return Err(EndorseError::Transport(
                "unsuccessful response for READ ADF RECORD".to_string(),
            ));
        }
        debug!("ADF record == {}", hex::encode(&rsp));

        let template = parse_application_template(&rsp)?;
        debug!(
            "application identifier == {}",
            hex::encode(&template.application_identifier)
        );
        Ok(template.application_identifier)
    }
}

impl UiccInterface for Iso7816 {
    fn read_imsi(&mut self) -> Result<String> {
        let aid = self.ensure_adf_usim()?;

        let rsp = self.transmit(&select_apdu(0x04, 0x04, &aid))?;
        if !is_successful_sw(&rsp) {
            return Err(EndorseError::Transport(
                "unsuccessful response for SELECT ADF".to_string(),
            ));
        }

        let rsp = self.transmit(&select_apdu(0x00, 0x04, &FID_EF_IMSI))?;
        if !is_successful_sw(&rsp) {
            return Err(EndorseError::Transport(
                "unsuccessful response for SELECT EF_IMSI".to_string(),
            ));
        }

        let rsp = self.transmit(&read_binary_apdu(0x00, 0x00, 9))?;
        if !is_successful_sw(&rsp) {
            return Err(EndorseError::Transport(
                "unsuccessful response for READ BINARY EF_IMSI".to_string(),
            ));
        }

        decode_imsi(&rsp)
    }

    fn authenticate(&mut self, rand: &[u8], autn: &[u8]) -> Result<UiccAuthResult> {
        let aid = self.ensure_adf_usim()?;

        // P1 = 0x04: selection by DF name
        // P2 = 0x04: return the FCP template, first or only occurrence
        let rsp = self.transmit(&select_apdu(0x04, 0x04, &aid))?;
        if !is_successful_sw(&rsp) {
            return Err(EndorseError::Transport(
                "unsuccessful response for SELECT ADF".to_string(),
            ));
        }

        // Drain the FCI the card offers for the SELECT.
        let rsp = self.transmit(&get_response_apdu(0x00, 0x00, rsp[rsp.len() - 1]))?;
        if !is_successful_sw(&rsp) {
            return Err(EndorseError::Transport(
                "unsuccessful response for GET RESPONSE".to_string(),
            ));
        }

        // P1 = 0x00: no information given
        // P2 = 0x81: specific reference data, qualifier 1
        let rsp = self.transmit(&authenticate_apdu(0x00, 0x81, rand, autn))?;
        if rsp.len() < 2 {
            return Err(EndorseError::Transport(
                "short response for AUTHENTICATE".to_string(),
            ));
        }
        let sw1 = rsp[rsp.len() - 2];
        if sw1 != 0x61 && sw1 != 0x6e {
            return Err(EndorseError::Transport(
                "unsuccessful response for AUTHENTICATE".to_string(),
            ));
        }

        let rsp = self.transmit(&get_response_apdu(0x00, 0x00, rsp[rsp.len() - 1]))?;
        if !is_successful_sw(&rsp) {
            return Err(EndorseError::Transport(
                "unsuccessful response for GET RESPONSE".to_string(),
            ));
        }

        UiccAuthResult::parse(&rsp[..rsp.len() - 2])
    }

    fn close(&mut self) {
        if let Some(card) = self.card.take() {
            if let Err((_, e)) = card.disconnect(Disposition::LeaveCard) {
                debug!("unable to disconnect card: {e}");
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// SW1 values which indicate the command was accepted.
fn is_successful_sw(rsp: &[u8]) -> bool {
    if rsp.len() < 2 {
        return false;
    }
    matches!(rsp[rsp.len() - 2], 0x61 | 0x6f | 0x90)
}

/// EF_IMSI content is `[len, packed digits…]`; the first decoded nibble is
/// the parity digit and is dropped.
fn decode_imsi(rsp: &[u8]) -> Result<String> {
    let len = *rsp.first().ok_or_else(|| {
        EndorseError::Transport("empty response for READ BINARY EF_IMSI".to_string())
    })? as usize;
    let digits = rsp.get(1..1 + len).ok_or_else(|| {
        EndorseError::Transport("short response for READ BINARY EF_IMSI".to_string())
    })?;

    let decoded = decode_tbcd(digits);
    Ok(decoded[1..].to_string())
}

fn select_apdu(p1: u8, p2: u8, data: &[u8]) -> Vec<u8> {
    let mut apdu = vec![CLA_UICC, INS_SELECT, p1, p2, data.len() as u8];
    apdu.extend_from_slice(data);
    apdu
}

fn get_response_apdu(p1: u8, p2: u8, le: u8) -> Vec<u8> {
    vec![CLA_UICC, INS_GET_RESPONSE, p1, p2, le]
}

fn read_record_apdu(p1: u8, p2: u8, le: u8) -> Vec<u8> {
    vec![CLA_UICC, INS_READ_RECORD, p1, p2, le]
}

fn read_binary_apdu(p1: u8, p2: u8, le: u8) -> Vec<u8> {
    vec![CLA_UICC, INS_READ_BINARY, p1, p2, le]
}

fn authenticate_apdu(p1: u8, p2: u8, rand: &[u8], autn: &[u8]) -> Vec<u8> {
    let lc = (rand.len() + autn.len() + 2) as u8;
    let mut apdu = vec![CLA_UICC, INS_INTERNAL_AUTHENTICATE, p1, p2, lc];
    apdu.push(rand.len() as u8);
    apdu.extend_from_slice(rand);
    apdu.push(autn.len() as u8);
    apdu.extend_from_slice(autn);
    apdu
}

/// File control parameters, the TLV metadata a SELECT returns.
#[derive(Debug, Default, PartialEq, Eq)]
struct Fcp {
    file_size: u16,
    file_descriptor: Vec<u8>,
    file_identifier: Vec<u8>,
    short_file_identifier: Option<u8>,
    life_cycle_status: Option<u8>,
    security_attribute: Vec<u8>,
}

impl Fcp {
    /// Record size bytes of a linear-fixed file descriptor.
    fn record_size(&self) -> Option<[u8; 2]> {
        let b = self.file_descriptor.get(2..4)?;
        Some([b[0], b[1]])
    }
}

fn parse_fcp(b: &[u8]) -> Result<Fcp> {
    let inner = unwrap_template(b, 0x62)
        .ok_or_else(|| EndorseError::Transport("malformed FCP template".to_string()))?;

    let mut fcp = Fcp::default();
    for (tag, value) in Tlv::new(inner) {
        match tag {
            0x80 => {
                if value.len() != 2 {
                    return Err(EndorseError::Transport(
                        "unsupported file size length".to_string(),
                    ));
                }
                fcp.file_size = u16::from_be_bytes([value[0], value[1]]);
            }
            0x82 => fcp.file_descriptor = value.to_vec(),
            0x83 => fcp.file_identifier = value.to_vec(),
            0x88 => {
                if value.len() == 1 {
                    fcp.short_file_identifier = Some(value[0]);
                }
            }
            0x8a => fcp.life_cycle_status = value.first().copied(),
            0x8b => fcp.security_attribute = value.to_vec(),
            _ => {}
        }
    }
    Ok(fcp)
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ApplicationTemplate {
    application_identifier: Vec<u8>,
    application_label: Vec<u8>,
}

fn parse_application_template(b: &[u8]) -> Result<ApplicationTemplate> {
    let inner = unwrap_template(b, 0x61)
        .ok_or_else(|| EndorseError::Transport("malformed application template".to_string()))?;

    let mut template = ApplicationTemplate::default();
    for (tag, value) in Tlv::new(inner) {
        match tag {
            0x4f => template.application_identifier = value.to_vec(),
            0x50 => template.application_label = value.to_vec(),
            _ => {}
        }
    }
    Ok(template)
}

fn unwrap_template(b: &[u8], expected_tag: u8) -> Option<&[u8]> {
    if b.len() < 2 || b[0] != expected_tag {
        return None;
    }
    let len = b[1] as usize;
    b.get(2..2 + len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_apdu_bytes() {
        assert_eq!(
            select_apdu(0x00, 0x04, &FID_MF),
            [0x00, 0xa4, 0x00, 0x04, 0x02, 0x3f, 0x00]
        );
    }

    #[test]
    fn get_response_apdu_bytes() {
        assert_eq!(
            get_response_apdu(0x00, 0x00, 0x2c),
            [0x00, 0xc0, 0x00, 0x00, 0x2c]
        );
    }

    #[test]
    fn authenticate_apdu_bytes() {
        let rand = [0xaa; 16];
        let autn = [0xbb; 16];
        let apdu = authenticate_apdu(0x00, 0x81, &rand, &autn);

        assert_eq!(&apdu[..5], &[0x00, 0x88, 0x00, 0x81, 0x22]);
        assert_eq!(apdu[5], 0x10);
        assert_eq!(&apdu[6..22], &rand);
        assert_eq!(apdu[22], 0x10);
        assert_eq!(&apdu[23..39], &autn);
        assert_eq!(apdu.len(), 39);
    }

    #[test]
    fn parses_fcp() {
        let b = [
            0x62, 0x14, // FCP template
            0x80, 0x02, 0x00, 0x4c, // file size
            0x82, 0x05, 0x42, 0x21, 0x00, 0x26, 0x02, // file descriptor
            0x83, 0x02, 0x2f, 0x00, // file identifier
            0x8a, 0x01, 0x05, // life cycle status
        ];
        let fcp = parse_fcp(&b).unwrap();

        assert_eq!(fcp.file_size, 0x4c);
        assert_eq!(fcp.file_descriptor, [0x42, 0x21, 0x00, 0x26, 0x02]);
        assert_eq!(fcp.file_identifier, [0x2f, 0x00]);
        assert_eq!(fcp.life_cycle_status, Some(0x05));
        assert_eq!(fcp.record_size(), Some([0x00, 0x26]));
    }

    #[test]
    fn fcp_ignores_unknown_tags() {
        let b = [0x62, 0x07, 0xc6, 0x01, 0x00, 0x82, 0x02, 0x41, 0x21];
        let fcp = parse_fcp(&b).unwrap();
        assert_eq!(fcp.file_descriptor, [0x41, 0x21]);
        assert_eq!(fcp.record_size(), None);
    }

    #[test]
    fn fcp_requires_template_tag() {
        assert!(parse_fcp(&[0x61, 0x00]).is_err());
        assert!(parse_fcp(&[0x62]).is_err());
    }

    #[test]
    fn parses_application_template() {
        let aid = [
            0xa0, 0x00, 0x00, 0x00, 0x87, 0x10, 0x02, 0xff, 0xff, 0xff, 0xff, 0x89, 0x07, 0x09,
            0x00, 0x00,
        ];
        let mut b = vec![0x61, 0x19, 0x4f, 0x10];
        b.extend_from_slice(&aid);
        b.extend_from_slice(&[0x50, 0x05, b'e', b'S', b'I', b'M', b'1']);

        let template = parse_application_template(&b).unwrap();
        assert_eq!(template.application_identifier, aid);
        assert_eq!(template.application_label, b"eSIM1");
    }

    #[test]
    fn successful_sw_values() {
        assert!(is_successful_sw(&[0x61, 0x2c]));
        assert!(is_successful_sw(&[0x6f, 0x00]));
        assert!(is_successful_sw(&[0x01, 0x90, 0x00]));
        assert!(!is_successful_sw(&[0x6a, 0x82]));
        assert!(!is_successful_sw(&[0x90]));
    }

    #[test]
    fn decodes_imsi_from_ef_contents() {
        // len = 8, then the packed digits with a leading parity nibble.
        let rsp = [
            0x08, 0x29, 0x10, 0x10, 0x00, 0x00, 0x00, 0x00, 0x10, 0x90, 0x00,
        ];
        assert_eq!(decode_imsi(&rsp).unwrap(), "201010000000001");
    }

    #[test]
    fn rejects_short_imsi_response() {
        assert!(decode_imsi(&[0x08, 0x29]).is_err());
        assert!(decode_imsi(&[]).is_err());
    }
}
