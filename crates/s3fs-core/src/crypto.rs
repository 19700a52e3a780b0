//! Optional client-side AES-CTR-256 encryption, keyed per file.
//!
//! The key is generated once per file at create time, wrapped and stashed in
//! the object's user metadata (see [`crate::object::meta_keys::KEY`]), and
//! used to encrypt the whole file before it reaches the HTTP layer. CTR mode
//! is a keystream cipher, which is what makes it usable for parallel
//! multipart uploads/downloads: the keystream at any byte offset can be
//! produced independently by seeking to `offset / 16` blocks, with no
//! dependency on bytes before it.

use std::path::Path;

use aes::Aes256;
use base64::Engine as _;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use md5::{Digest, Md5};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;

type Aes256Ctr = ctr::Ctr64BE<Aes256>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be {KEY_SIZE} bytes, got {0}")]
    BadKeyLength(usize),
    #[error("initialization vector must be {BLOCK_SIZE} bytes, got {0}")]
    BadIvLength(usize),
}

pub type Key = Zeroizing<[u8; KEY_SIZE]>;

/// Generates a fresh random key for a newly created file.
pub fn generate_key() -> Key {
    let mut bytes = [0u8; KEY_SIZE];
    rand::rng().fill_bytes(&mut bytes);
    Zeroizing::new(bytes)
}

pub fn generate_iv() -> [u8; BLOCK_SIZE] {
    let mut iv = [0u8; BLOCK_SIZE];
    rand::rng().fill_bytes(&mut iv);
    iv
}

/// Encrypts or decrypts `buf` in place, as if it were the bytes of a larger
/// stream starting at `offset` — the counter is advanced to the block
/// containing `offset` before the keystream is applied, so disjoint ranges
/// of the same file can be processed independently and in any order.
pub fn apply_keystream_at(key: &Key, iv: &[u8; BLOCK_SIZE], offset: u64, buf: &mut [u8]) -> Result<(), CryptoError> {
    let mut cipher = Aes256Ctr::new(key.as_slice().into(), iv.into());
    cipher
        .try_seek(offset)
        .expect("offset within a 64-bit counter space never overflows the cipher's seek range");
    cipher.apply_keystream(buf);
    Ok(())
}

pub fn encrypt_at(key: &Key, iv: &[u8; BLOCK_SIZE], offset: u64, buf: &mut [u8]) -> Result<(), CryptoError> {
    apply_keystream_at(key, iv, offset, buf)
}

pub fn decrypt_at(key: &Key, iv: &[u8; BLOCK_SIZE], offset: u64, buf: &mut [u8]) -> Result<(), CryptoError> {
    apply_keystream_at(key, iv, offset, buf)
}

/// MD5 over whatever bytes are actually handed to the HTTP layer — the
/// ciphertext when encrypting, the plaintext otherwise. S3 verifies this
/// against its own computation of the body it received, so this must never
/// be computed over the "logical" (pre-encryption) bytes.
pub fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    hex::encode(digest)
}

pub fn md5_base64(data: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, Md5::digest(data))
}

/// Encodes a per-file key for storage in the object's user metadata
/// (`meta_keys::KEY`). The bytes stored are the key wrapped under the volume
/// key, never the bare key — see [`wrap_key`].
pub fn encode_key(wrapped: &[u8; KEY_SIZE]) -> String {
    base64::engine::general_purpose::STANDARD.encode(wrapped)
}

pub fn decode_key(s: &str) -> Option<[u8; KEY_SIZE]> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(s).ok()?;
    bytes.try_into().ok()
}

pub fn encode_iv(iv: &[u8; BLOCK_SIZE]) -> String {
    hex::encode(iv)
}

pub fn decode_iv(s: &str) -> Option<[u8; BLOCK_SIZE]> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// Wraps a freshly generated per-file key under the volume key, using the
/// file's own IV as the wrapping nonce so no two files reuse a
/// (volume key, nonce) pair.
pub fn wrap_key(volume_key: &Key, iv: &[u8; BLOCK_SIZE], file_key: &Key) -> [u8; KEY_SIZE] {
    let mut wrapped = **file_key;
    apply_keystream_at(volume_key, iv, 0, &mut wrapped).expect("ctr encryption is infallible for valid keys");
    wrapped
}

pub fn unwrap_key(volume_key: &Key, iv: &[u8; BLOCK_SIZE], wrapped: &[u8; KEY_SIZE]) -> Key {
    let mut bytes = *wrapped;
    apply_keystream_at(volume_key, iv, 0, &mut bytes).expect("ctr decryption is infallible for valid keys");
    Zeroizing::new(bytes)
}

/// Loads the volume (master) key from `volume_key_file`: a hex-encoded
/// `KEY_SIZE`-byte key, one line, whitespace trimmed.
pub fn load_volume_key(path: &Path) -> std::io::Result<Key> {
    let contents = std::fs::read_to_string(path)?;
    let bytes = hex::decode(contents.trim())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let bytes: [u8; KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "volume key must be 32 bytes"))?;
    Ok(Zeroizing::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_inverts_encrypt() {
        let key = generate_key();
        let iv = generate_iv();
        let plaintext = b"the quick brown fox jumps over the lazy dog!!!!".to_vec();

        let mut ciphertext = plaintext.clone();
        encrypt_at(&key, &iv, 0, &mut ciphertext).unwrap();
        assert_ne!(ciphertext, plaintext);

        let mut roundtrip = ciphertext.clone();
        decrypt_at(&key, &iv, 0, &mut roundtrip).unwrap();
        assert_eq!(roundtrip, plaintext);
    }

    #[test]
    fn offset_seek_matches_contiguous_encryption() {
        let key = generate_key();
        let iv = generate_iv();
        let plaintext: Vec<u8> = (0..64u8).collect();

        let mut whole = plaintext.clone();
        encrypt_at(&key, &iv, 0, &mut whole).unwrap();

        // Encrypt the second half independently, seeking to its offset.
        let mut second_half = plaintext[32..].to_vec();
        encrypt_at(&key, &iv, 32, &mut second_half).unwrap();

        assert_eq!(&whole[32..], second_half.as_slice());
    }

    #[test]
    fn parallel_offset_encryption_matches_serial() {
        let key = generate_key();
        let iv = generate_iv();
        let plaintext: Vec<u8> = (0..256u8).cycle().take(1024).collect();

        let mut serial = plaintext.clone();
        encrypt_at(&key, &iv, 0, &mut serial).unwrap();

        let mut parallel = plaintext.clone();
        for chunk_start in (0..plaintext.len()).step_by(128) {
            let end = (chunk_start + 128).min(plaintext.len());
            encrypt_at(&key, &iv, chunk_start as u64, &mut parallel[chunk_start..end]).unwrap();
        }

        assert_eq!(serial, parallel);
    }

    #[test]
    fn md5_hex_matches_known_value() {
        // RFC 1321 test vector.
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    /// NIST SP 800-38A AES-256-CTR known-answer vector (F.5.5), first block
    /// only. Self-consistency round-trips can't catch a keystream generated
    /// from the wrong key schedule or block order; this pins the primitive
    /// to a vector nobody in this codebase chose.
    #[test]
    fn encrypt_matches_nist_sp800_38a_ctr_vector() {
        let key: Key = Zeroizing::new(
            hex_to_array("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff"),
        );
        let icb = hex_to_array::<16>("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff");
        let plaintext = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let expected_ciphertext = "601ec313775789a5b7a7f504bbf3d228";

        let mut buf = plaintext.clone();
        encrypt_at(&key, &icb, 0, &mut buf).unwrap();
        assert_eq!(hex::encode(&buf), expected_ciphertext);

        decrypt_at(&key, &icb, 0, &mut buf).unwrap();
        assert_eq!(buf, plaintext);
    }

    fn hex_to_array<const N: usize>(s: &str) -> [u8; N] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn key_wrapping_round_trips_through_encode_decode() {
        let volume_key = generate_key();
        let iv = generate_iv();
        let file_key = generate_key();

        let wrapped = wrap_key(&volume_key, &iv, &file_key);
        let encoded = encode_key(&wrapped);
        let decoded = decode_key(&encoded).unwrap();
        let unwrapped = unwrap_key(&volume_key, &iv, &decoded);

        assert_eq!(*unwrapped, *file_key);
    }

    proptest::proptest! {
        /// Encrypting then decrypting at any offset and length recovers the
        /// original plaintext, for arbitrary keys, IVs, and data.
        #[test]
        fn decrypt_inverts_encrypt_for_arbitrary_inputs(
            key_bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), KEY_SIZE),
            iv_bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), BLOCK_SIZE),
            offset in 0u64..1_000_000,
            data in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256),
        ) {
            let key: Key = Zeroizing::new(key_bytes.try_into().unwrap());
            let iv: [u8; BLOCK_SIZE] = iv_bytes.try_into().unwrap();

            let mut ciphertext = data.clone();
            encrypt_at(&key, &iv, offset, &mut ciphertext).unwrap();
            let mut roundtrip = ciphertext;
            decrypt_at(&key, &iv, offset, &mut roundtrip).unwrap();

            prop_assert_eq!(roundtrip, data);
        }

        /// Wrapping then unwrapping a per-file key under any volume key/IV
        /// pair recovers the original per-file key, through the same
        /// base64 encode/decode round trip used for metadata storage.
        #[test]
        fn key_wrap_round_trips_for_arbitrary_keys(
            volume_bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), KEY_SIZE),
            file_bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), KEY_SIZE),
            iv_bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), BLOCK_SIZE),
        ) {
            let volume_key: Key = Zeroizing::new(volume_bytes.try_into().unwrap());
            let file_key: Key = Zeroizing::new(file_bytes.try_into().unwrap());
            let iv: [u8; BLOCK_SIZE] = iv_bytes.try_into().unwrap();

            let wrapped = wrap_key(&volume_key, &iv, &file_key);
            let encoded = encode_key(&wrapped);
            let decoded = decode_key(&encoded).unwrap();
            let unwrapped = unwrap_key(&volume_key, &iv, &decoded);

            prop_assert_eq!(*unwrapped, *file_key);
        }
    }
}
