//! Binary codec for the key cache file.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! magic: u32 = 0x1000CACE
//! version: u32 = 2
//! entryCount: u32
//! entryCount times:
//!   tag: u32 = 1
//!   aliasLen: u32, alias: UTF-8
//!   valueLen: u32, value: AES-128-CFB blob, 16-byte IV prepended
//! signature: HMAC-SHA256 of all preceding bytes, keyed with the cache
//!            password
//! ```
//!
//! The decrypted entry value is framed as an 8-byte big-endian Unix-nanos
//! creation timestamp, a 4-byte big-endian key length, and the key bytes.
//! Version 1 files used an opaque inner encoding and are rejected.

use std::collections::BTreeMap;
use std::time::{Duration, UNIX_EPOCH};

use super::{CacheError, KeyCacheEntry};
use crate::cipher;
use crate::util::{read_bytes, read_i64, read_u32, write_i64, write_u32};

const MAGIC: u32 = 0x1000_cace;
const VERSION: u32 = 2;
const TAG_SECRET_KEY_ENTRY: u32 = 1;
const SIGNATURE_LEN: usize = 32;

pub(super) fn parse(
    buf: &[u8],
    password: &[u8],
) -> Result<BTreeMap<String, KeyCacheEntry>, CacheError> {
    if buf.len() < SIGNATURE_LEN {
        return Err(CacheError::SignatureMismatch);
    }

    // Verify the trailer before decoding anything, so any flipped byte in
    // the signed region surfaces as a signature failure.
    let (body, sig) = buf.split_at(buf.len() - SIGNATURE_LEN);
    if !cipher::verify_signature(body, password, sig) {
        return Err(CacheError::SignatureMismatch);
    }

    let mut r = body;

    if read_u32(&mut r)? != MAGIC {
        return Err(CacheError::BadMagic);
    }

    let version = read_u32(&mut r)?;
    if version != VERSION {
        return Err(CacheError::UnsupportedVersion(version));
    }

    let count = read_u32(&mut r)?;
    let mut entries = BTreeMap::new();

    for _ in 0..count {
        let tag = read_u32(&mut r)?;
        if tag != TAG_SECRET_KEY_ENTRY {
            return Err(CacheError::UnsupportedTag(tag));
        }

        let alias_len = read_u32(&mut r)? as usize;
        let alias = String::from_utf8(read_bytes(&mut r, alias_len)?)
            .map_err(|_| CacheError::MalformedEntry)?;

        let value_len = read_u32(&mut r)? as usize;
        let value = read_bytes(&mut r, value_len)?;

        let plain = cipher::decode(&value, password)?;
        entries.insert(alias, parse_entry(&plain)?);
    }

    Ok(entries)
}

pub(super) fn serialize(
    entries: &BTreeMap<String, KeyCacheEntry>,
    password: &[u8],
) -> Result<Vec<u8>, CacheError> {
    let mut body = Vec::new();

    write_u32(&mut body, MAGIC)?;
    write_u32(&mut body, VERSION)?;
    write_u32(&mut body, entries.len() as u32)?;

    for (alias, entry) in entries {
        write_u32(&mut body, TAG_SECRET_KEY_ENTRY)?;

        write_u32(&mut body, alias.len() as u32)?;
        body.extend_from_slice(alias.as_bytes());

        let iv = cipher::generate_iv();
        let value = cipher::encode(&serialize_entry(entry)?, password, &iv);

        write_u32(&mut body, value.len() as u32)?;
        body.extend_from_slice(&value);
    }

    let sig = cipher::signature(&body, password);
    body.extend_from_slice(&sig);
    Ok(body)
}

fn serialize_entry(entry: &KeyCacheEntry) -> Result<Vec<u8>, CacheError> {
    let nanos = entry
        .created
        .duration_since(UNIX_EPOCH)
        .map_err(|_| CacheError::MalformedEntry)?
        .as_nanos() as i64;

    let mut buf = Vec::with_capacity(12 + entry.key.len());
    write_i64(&mut buf, nanos)?;
    write_u32(&mut buf, entry.key.len() as u32)?;
    buf.extend_from_slice(&entry.key);
    Ok(buf)
}

fn parse_entry(b: &[u8]) -> Result<KeyCacheEntry, CacheError> {
    let mut r = b;

    let nanos = read_i64(&mut r)?;
    if nanos < 0 {
        return Err(CacheError::MalformedEntry);
    }

    let key_len = read_u32(&mut r)? as usize;
    if r.len() != key_len {
        return Err(CacheError::MalformedEntry);
    }
    let key = read_bytes(&mut r, key_len)?;

    Ok(KeyCacheEntry {
        created: UNIX_EPOCH + Duration::from_nanos(nanos as u64),
        key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWORD: &[u8] = b"!_S0r4C0m_&";

    fn sample_entries() -> BTreeMap<String, KeyCacheEntry> {
        let created = UNIX_EPOCH + Duration::from_nanos(1_700_000_000_123_456_789);
        BTreeMap::from([
            (
                "001010000000001_k1".to_string(),
                KeyCacheEntry {
                    created,
                    key: vec![0x5a; 16],
                },
            ),
            (
                "001010000000002_k2".to_string(),
                KeyCacheEntry {
                    created,
                    key: vec![0xa5; 16],
                },
            ),
        ])
    }

    #[test]
    fn round_trip() {
        let entries = sample_entries();
        let buf = serialize(&entries, PASSWORD).unwrap();
        assert_eq!(parse(&buf, PASSWORD).unwrap(), entries);
    }

    #[test]
    fn wrong_password_is_a_signature_mismatch() {
        let buf = serialize(&sample_entries(), PASSWORD).unwrap();
        assert!(matches!(
            parse(&buf, b"some other password"),
            Err(CacheError::SignatureMismatch)
        ));
    }

    #[test]
    fn trailer_is_an_hmac_of_the_body_keyed_with_the_password() {
        let buf = serialize(&sample_entries(), PASSWORD).unwrap();
        let (body, sig) = buf.split_at(buf.len() - SIGNATURE_LEN);
        assert_eq!(sig, cipher::signature(body, PASSWORD));
    }

    #[test]
    fn any_flipped_byte_in_the_signed_region_fails_verification() {
        let buf = serialize(&sample_entries(), PASSWORD).unwrap();
        for pos in [0, 4, 11, buf.len() - SIGNATURE_LEN - 1] {
            let mut corrupted = buf.clone();
            corrupted[pos] ^= 0x01;
            assert!(
                matches!(
                    parse(&corrupted, PASSWORD),
                    Err(CacheError::SignatureMismatch)
                ),
                "flip at {pos}"
            );
        }
    }

    #[test]
    fn repeated_saves_differ_only_in_ivs() {
        let entries = sample_entries();
        let a = serialize(&entries, PASSWORD).unwrap();
        let b = serialize(&entries, PASSWORD).unwrap();

        assert_eq!(a.len(), b.len());
        assert_ne!(a, b);
        assert_eq!(parse(&a, PASSWORD).unwrap(), parse(&b, PASSWORD).unwrap());
    }

    fn signed(mut body: Vec<u8>) -> Vec<u8> {
        let sig = cipher::signature(&body, PASSWORD);
        body.extend_from_slice(&sig);
        body
    }

    #[test]
    fn rejects_bad_magic() {
        let mut body = Vec::new();
        write_u32(&mut body, 0xdead_beef).unwrap();
        write_u32(&mut body, VERSION).unwrap();
        write_u32(&mut body, 0).unwrap();
        assert!(matches!(
            parse(&signed(body), PASSWORD),
            Err(CacheError::BadMagic)
        ));
    }

    #[test]
    fn rejects_old_version() {
        let mut body = Vec::new();
        write_u32(&mut body, MAGIC).unwrap();
        write_u32(&mut body, 1).unwrap();
        write_u32(&mut body, 0).unwrap();
        assert!(matches!(
            parse(&signed(body), PASSWORD),
            Err(CacheError::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn rejects_unknown_entry_tag() {
        let mut body = Vec::new();
        write_u32(&mut body, MAGIC).unwrap();
        write_u32(&mut body, VERSION).unwrap();
        write_u32(&mut body, 1).unwrap();
        write_u32(&mut body, 7).unwrap();
        assert!(matches!(
            parse(&signed(body), PASSWORD),
            Err(CacheError::UnsupportedTag(7))
        ));
    }

    #[test]
    fn rejects_truncated_file() {
        assert!(matches!(
            parse(&[0u8; 8], PASSWORD),
            Err(CacheError::SignatureMismatch)
        ));
    }
}
