//! Cipher plumbing for both container flavours.
//!
//! Format-A manifests and entries use AES-128-CFB with 128-bit feedback and
//! no padding; the key/IV are the ASCII-hex strings derived in
//! [`crate::keys`].  Format-B uses the vendor block cipher in [`ops`].

use aes::Aes128;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};

pub mod ops;

type Aes128CfbDec = cfb_mode::Decryptor<Aes128>;
type Aes128CfbEnc = cfb_mode::Encryptor<Aes128>;

/// Decrypt AES-128-CFB the way the vendor tool does it: zero-pad the
/// ciphertext to a 16-byte multiple, decrypt, discard the surplus.
///
/// A fresh cipher is built per call — every entry restarts from the IV.
pub fn aes_cfb_decrypt(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    let mut buf = data.to_vec();
    buf.resize(data.len().div_ceil(16) * 16, 0);
    Aes128CfbDec::new(key.into(), iv.into()).decrypt(&mut buf);
    buf.truncate(data.len());
    buf
}

/// CFB encryption counterpart, with the same pad-then-truncate shape.
/// The extraction pipeline never encrypts; this exists for fixture builders
/// and round-trip tests.
pub fn aes_cfb_encrypt(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    let mut buf = data.to_vec();
    buf.resize(data.len().div_ceil(16) * 16, 0);
    Aes128CfbEnc::new(key.into(), iv.into()).encrypt(&mut buf);
    buf.truncate(data.len());
    buf
}
