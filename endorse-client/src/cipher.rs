//! Cipher primitives for the key cache file: AES-128-CFB with a prepended
//! random IV for entry payloads, HMAC-SHA256 for the file trailer.

use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::cache::CacheError;

type Aes128CfbEnc = cfb_mode::Encryptor<Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<Aes128>;
type HmacSha256 = Hmac<Sha256>;

pub(crate) const BLOCK_SIZE: usize = 16;

/// Derives the AES key: zero-pad the password to a block multiple and keep
/// the first block.
pub(crate) fn make_key_from_password(password: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut key = [0u8; BLOCK_SIZE];
    let n = password.len().min(BLOCK_SIZE);
    key[..n].copy_from_slice(&password[..n]);
    key
}

pub(crate) fn generate_iv() -> [u8; BLOCK_SIZE] {
    let mut iv = [0u8; BLOCK_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// The IV needs to be unique, but doesn't have to be secret; it is placed
/// at the beginning of the encoded data.
pub(crate) fn encode(plain: &[u8], password: &[u8], iv: &[u8; BLOCK_SIZE]) -> Vec<u8> {
    let key = make_key_from_password(password);

    let mut encoded = Vec::with_capacity(BLOCK_SIZE + plain.len());
    encoded.extend_from_slice(iv);
    encoded.extend_from_slice(plain);

    let enc = Aes128CfbEnc::new(&key.into(), iv.into());
    enc.encrypt(&mut encoded[BLOCK_SIZE..]);

    encoded
}

pub(crate) fn decode(encoded: &[u8], password: &[u8]) -> Result<Vec<u8>, CacheError> {
    if encoded.len() < BLOCK_SIZE {
        return Err(CacheError::ShortCiphertext);
    }

    let key = make_key_from_password(password);
    let (iv, data) = encoded.split_at(BLOCK_SIZE);

    let mut plain = data.to_vec();
    let dec =
        Aes128CfbDec::new_from_slices(&key, iv).map_err(|_| CacheError::ShortCiphertext)?;
    dec.decrypt(&mut plain);

    Ok(plain)
}

pub(crate) fn signature(data: &[u8], key: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time comparison against an expected signature.
pub(crate) fn verify_signature(data: &[u8], key: &[u8], sig: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.verify_slice(sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation_pads_and_truncates() {
        assert_eq!(
            make_key_from_password(b"abc"),
            *b"abc\0\0\0\0\0\0\0\0\0\0\0\0\0"
        );
        assert_eq!(
            make_key_from_password(b"0123456789abcdefghij"),
            *b"0123456789abcdef"
        );
    }

    #[test]
    fn encode_decode_round_trip() {
        let iv = generate_iv();
        let encoded = encode(b"some entry bytes", b"!_S0r4C0m_&", &iv);

        assert_eq!(&encoded[..BLOCK_SIZE], &iv);
        assert_ne!(&encoded[BLOCK_SIZE..], b"some entry bytes");

        let plain = decode(&encoded, b"!_S0r4C0m_&").unwrap();
        assert_eq!(plain, b"some entry bytes");
    }

    #[test]
    fn decode_with_wrong_password_garbles() {
        let iv = generate_iv();
        let encoded = encode(b"some entry bytes", b"password-a", &iv);
        let plain = decode(&encoded, b"password-b").unwrap();
        assert_ne!(plain, b"some entry bytes");
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(matches!(
            decode(&[0u8; 5], b"pw"),
            Err(CacheError::ShortCiphertext)
        ));
    }

    #[test]
    fn signature_verifies() {
        let sig = signature(b"payload", b"key");
        assert_eq!(sig.len(), 32);
        assert!(verify_signature(b"payload", b"key", &sig));
        assert!(!verify_signature(b"payload", b"other", &sig));
        assert!(!verify_signature(b"tampered", b"key", &sig));
    }
}
