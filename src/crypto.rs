//! Crypto primitives (spec §4.2).
//!
//! RSA-OAEP/SHA-256 2048-bit for asymmetric key wrap, and Blowfish in
//! ECB mode with ASCII-space padding to a 16-byte boundary for the
//! symmetric half. The symmetric choice is a deliberately preserved
//! legacy one, not a new design decision — see DESIGN.md and SPEC_FULL.md §9.

use blowfish::Blowfish;
use ecb::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyInit};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::MeshError;

pub const RSA_KEY_BITS: usize = 2048;
const PAD_BLOCK: usize = 16;

type BlowfishEcbEnc = ecb::Encryptor<Blowfish>;
type BlowfishEcbDec = ecb::Decryptor<Blowfish>;

/// A freshly generated identity keypair, PEM-encoded.
pub struct KeyPair {
    pub public_key_text: String,
    pub private_key_text: String,
}

pub fn generate_rsa_keypair() -> Result<KeyPair, MeshError> {
    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| MeshError::Crypto(format!("rsa keygen failed: {e}")))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_text = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| MeshError::Crypto(format!("pkcs8 private encode failed: {e}")))?
        .to_string();
    let public_key_text = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| MeshError::Crypto(format!("pkcs8 public encode failed: {e}")))?;

    Ok(KeyPair {
        public_key_text,
        private_key_text,
    })
}

/// `rsa_encrypt(plaintext, peer_public_key) -> bytes`
pub fn rsa_encrypt(plaintext: &[u8], peer_public_key_pem: &str) -> Result<Vec<u8>, MeshError> {
    let public_key = RsaPublicKey::from_public_key_pem(peer_public_key_pem)
        .map_err(|e| MeshError::Crypto(format!("invalid public key: {e}")))?;

    public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| MeshError::Crypto(format!("rsa encrypt failed: {e}")))
}

/// `rsa_decrypt(ciphertext, own_private_key) -> bytes | ValueError`
///
/// Callers in the seek protocol treat a `Crypto` error here as "this
/// frame wasn't addressed to us" rather than a reportable failure (see
/// discovery.rs); callers in messaging/response handling treat it as an
/// authentic failure.
pub fn rsa_decrypt(ciphertext: &[u8], own_private_key_pem: &str) -> Result<Vec<u8>, MeshError> {
    let private_key = RsaPrivateKey::from_pkcs8_pem(own_private_key_pem)
        .map_err(|e| MeshError::Crypto(format!("invalid private key: {e}")))?;

    private_key
        .decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|e| MeshError::Crypto(format!("rsa decrypt failed: {e}")))
}

/// Right-pads with ASCII space to the next 16-byte boundary. Matches
/// the original's `pad_content`: a content that is already aligned
/// still receives a full extra block of padding.
fn pad_with_spaces(content: &[u8]) -> Vec<u8> {
    let pad_len = PAD_BLOCK - (content.len() % PAD_BLOCK);
    let mut padded = Vec::with_capacity(content.len() + pad_len);
    padded.extend_from_slice(content);
    padded.extend(std::iter::repeat(b' ').take(pad_len));
    padded
}

/// `symmetric_encrypt(plaintext, password) -> bytes`
pub fn symmetric_encrypt(plaintext: &[u8], password: &[u8]) -> Result<Vec<u8>, MeshError> {
    let padded = pad_with_spaces(plaintext);
    let enc = BlowfishEcbEnc::new_from_slice(password)
        .map_err(|_| MeshError::Crypto("invalid symmetric key length".into()))?;
    Ok(enc.encrypt_padded_vec_mut::<NoPadding>(&padded))
}

/// `symmetric_decrypt(ciphertext, password) -> bytes`
///
/// Returns the raw decrypted bytes, padding included — the primitive
/// does not strip trailing ASCII spaces (see spec §8's round-trip
/// property: decrypt(encrypt(x)) equals x padded, not x). Callers that
/// need trimmed text (seek tokens, JSON parsing) trim explicitly.
pub fn symmetric_decrypt(ciphertext: &[u8], password: &[u8]) -> Result<Vec<u8>, MeshError> {
    let dec = BlowfishEcbDec::new_from_slice(password)
        .map_err(|_| MeshError::Crypto("invalid symmetric key length".into()))?;
    dec.decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| MeshError::Crypto("ecb decrypt failed".into()))
}

/// `symmetric_decrypt` with `decode_utf8=true`: decode to a `String`,
/// still including the trailing space padding.
pub fn symmetric_decrypt_text(ciphertext: &[u8], password: &[u8]) -> Result<String, MeshError> {
    let bytes = symmetric_decrypt(ciphertext, password)?;
    String::from_utf8(bytes).map_err(|e| MeshError::Crypto(format!("invalid utf8: {e}")))
}

/// `sha256_hex(s)`
pub fn sha256_hex(s: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_ref());
    hex::encode(hasher.finalize())
}

pub fn hexstr2bytes(hs: &str) -> Result<Vec<u8>, MeshError> {
    hex::decode(hs).map_err(|e| MeshError::Decode(format!("invalid hex: {e}")))
}

pub fn bytes2hexstr(bs: &[u8]) -> String {
    hex::encode(bs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(&[])]
    #[case::one_byte(b"x")]
    #[case::exactly_one_block(b"0123456789012345")]
    #[case::spans_two_blocks(b"this plaintext is longer than one block")]
    fn symmetric_round_trip_pads_every_size_to_a_16_byte_boundary(#[case] plaintext: &[u8]) {
        let password = b"correct horse battery staple";
        let ciphertext = symmetric_encrypt(plaintext, password).unwrap();
        assert_eq!(ciphertext.len() % PAD_BLOCK, 0);

        let decrypted = symmetric_decrypt(&ciphertext, password).unwrap();
        assert!(decrypted.starts_with(plaintext));
        assert!(decrypted[plaintext.len()..].iter().all(|&b| b == b' '));
    }

    #[test]
    fn symmetric_round_trip_pads_to_16_bytes() {
        let password = b"correct horse battery staple";
        let plaintext = b"hello";
        let ciphertext = symmetric_encrypt(plaintext, password).unwrap();
        assert_eq!(ciphertext.len(), 16);

        let decrypted = symmetric_decrypt(&ciphertext, password).unwrap();
        assert_eq!(decrypted.len(), 16);
        assert!(decrypted.starts_with(plaintext));
        assert!(decrypted[plaintext.len()..].iter().all(|&b| b == b' '));
    }

    #[test]
    fn symmetric_encrypt_pads_full_block_when_already_aligned() {
        let password = b"some-password";
        let plaintext = [b'x'; 16];
        let ciphertext = symmetric_encrypt(&plaintext, password).unwrap();
        assert_eq!(ciphertext.len(), 32);
    }

    #[test]
    fn symmetric_decrypt_does_not_strip_padding() {
        let password = b"password-123";
        let plaintext = b"short";
        let ciphertext = symmetric_encrypt(plaintext, password).unwrap();
        let decrypted_text = symmetric_decrypt_text(&ciphertext, password).unwrap();
        assert_eq!(decrypted_text.trim_end(), "short");
        assert_ne!(decrypted_text, "short");
    }

    #[test]
    fn rsa_round_trip_under_190_bytes() {
        let keypair = generate_rsa_keypair().unwrap();
        let message = b"a seek token or a small json blob";
        let ciphertext = rsa_encrypt(message, &keypair.public_key_text).unwrap();
        let plaintext = rsa_decrypt(&ciphertext, &keypair.private_key_text).unwrap();
        assert_eq!(plaintext, message);
    }

    #[test]
    fn rsa_decrypt_with_wrong_key_errors_not_panics() {
        let a = generate_rsa_keypair().unwrap();
        let b = generate_rsa_keypair().unwrap();
        let ciphertext = rsa_encrypt(b"hi", &a.public_key_text).unwrap();
        let result = rsa_decrypt(&ciphertext, &b.private_key_text);
        assert!(result.is_err());
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex("alice"),
            "2bd806c97f0e00af1a1fc3328fa763a9269723c8db8fac4f93af71db186d6e90"
        );
    }

    #[test]
    fn hex_round_trip() {
        let bytes = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let hexstr = bytes2hexstr(&bytes);
        assert_eq!(hexstr2bytes(&hexstr).unwrap(), bytes);
    }
}
