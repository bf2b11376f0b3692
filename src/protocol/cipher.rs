//! Cryptographic primitives used by both protocol revisions.
//!
//! The controller only speaks AES-128 in ECB mode with PKCS#7 padding, so the
//! block loop lives here instead of in a mode crate.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use crc::{Crc, CRC_32_ISO_HDLC};
use ring::hmac;

use super::error::FrameError;
use super::KEY_LEN;

const BLOCK: usize = 16;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const HMAC_LEN: usize = 32;

pub struct EcbCipher {
    inner: Aes128,
}

impl EcbCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            inner: Aes128::new(GenericArray::from_slice(key)),
        }
    }

    /// PKCS#7-pads and encrypts `plaintext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let pad = BLOCK - plaintext.len() % BLOCK;
        let mut buf = Vec::with_capacity(plaintext.len() + pad);
        buf.extend_from_slice(plaintext);
        buf.extend(std::iter::repeat(pad as u8).take(pad));
        self.encrypt_blocks(&mut buf);
        buf
    }

    /// Encrypts data that is already block aligned, without padding.
    pub fn encrypt_unpadded(&self, data: &[u8; BLOCK]) -> [u8; BLOCK] {
        let mut block = GenericArray::clone_from_slice(data);
        self.inner.encrypt_block(&mut block);
        let mut out = [0u8; BLOCK];
        out.copy_from_slice(&block);
        out
    }

    /// Decrypts and strips PKCS#7 padding.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, FrameError> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK != 0 {
            return Err(FrameError::Decrypt(format!(
                "ciphertext length {} is not a multiple of {BLOCK}",
                ciphertext.len()
            )));
        }

        let mut buf = ciphertext.to_vec();
        for chunk in buf.chunks_exact_mut(BLOCK) {
            let block = GenericArray::from_mut_slice(chunk);
            self.inner.decrypt_block(block);
        }

        let pad = usize::from(buf[buf.len() - 1]);
        if pad == 0 || pad > BLOCK || buf[buf.len() - pad..].iter().any(|b| usize::from(*b) != pad) {
            return Err(FrameError::Decrypt("invalid padding".to_string()));
        }
        buf.truncate(buf.len() - pad);
        Ok(buf)
    }

    fn encrypt_blocks(&self, buf: &mut [u8]) {
        for chunk in buf.chunks_exact_mut(BLOCK) {
            let block = GenericArray::from_mut_slice(chunk);
            self.inner.encrypt_block(block);
        }
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; HMAC_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let tag = hmac::sign(&key, data);
    let mut out = [0u8; HMAC_LEN];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Constant-time tag comparison.
pub fn hmac_sha256_verify(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::verify(&key, data, tag).is_ok()
}
