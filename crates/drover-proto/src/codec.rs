//! Frame codec for control messages
//!
//! Frame layout: `[iv: 16 bytes][AES-CFB(base64(plaintext))]`
//!
//! The payload is base64-encoded before encryption and the IV is drawn fresh from the OS
//! random source for every frame. Status-query responses additionally carry a trailing
//! [`RESPONSE_DELIMITER`](crate::RESPONSE_DELIMITER); command frames do not.

use crate::{IV_SIZE, RESPONSE_DELIMITER, SUPPORTED_KEY_LENGTHS};
use aes::{Aes128, Aes192, Aes256};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use tracing::debug;

type Aes128CfbEnc = cfb_mode::Encryptor<Aes128>;
type Aes192CfbEnc = cfb_mode::Encryptor<Aes192>;
type Aes256CfbEnc = cfb_mode::Encryptor<Aes256>;
type Aes128CfbDec = cfb_mode::Decryptor<Aes128>;
type Aes192CfbDec = cfb_mode::Decryptor<Aes192>;
type Aes256CfbDec = cfb_mode::Decryptor<Aes256>;

/// Fresh IVs tried before giving up on a delimiter-free response frame
const MAX_RESPONSE_ATTEMPTS: usize = 32;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid key length: {0} bytes (expected 16, 24 or 32)")]
    InvalidKey(usize),

    #[error("Secure random source unavailable: {0}")]
    RandomSourceFailure(String),

    #[error("Frame too short: {len} bytes (need at least 16 for the IV)")]
    FrameTooShort { len: usize },

    #[error("Decrypted payload is not valid base64: {0}")]
    DecodeFailure(#[from] base64::DecodeError),

    #[error("Could not produce a response frame free of the delimiter byte")]
    DelimiterCollision,
}

/// Symmetric key shared out-of-band between proxy and agents
///
/// The length is validated once, at construction; a bad key is a configuration error.
#[derive(Clone, PartialEq, Eq)]
pub struct ControlKey(Vec<u8>);

impl ControlKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, CodecError> {
        let bytes = bytes.into();
        if !SUPPORTED_KEY_LENGTHS.contains(&bytes.len()) {
            return Err(CodecError::InvalidKey(bytes.len()));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ControlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ControlKey(<{} bytes redacted>)", self.0.len())
    }
}

/// Encrypts and decrypts control frames with a shared key
#[derive(Debug, Clone)]
pub struct FrameCodec {
    key: ControlKey,
}

impl FrameCodec {
    pub fn new(key: ControlKey) -> Self {
        Self { key }
    }

    /// Encrypt a plaintext payload into an unterminated frame
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let encoded = BASE64.encode(plaintext);

        let mut frame = vec![0u8; IV_SIZE + encoded.len()];
        let (iv, body) = frame.split_at_mut(IV_SIZE);
        OsRng
            .try_fill_bytes(iv)
            .map_err(|e| CodecError::RandomSourceFailure(e.to_string()))?;
        body.copy_from_slice(encoded.as_bytes());

        self.encrypt_in_place(iv, body)?;
        Ok(frame)
    }

    /// Decrypt a frame back into its plaintext payload
    ///
    /// A frame encrypted under a different key normally fails base64 decoding; when it
    /// happens to decode, the result is garbage that callers must match against the
    /// message vocabulary rather than trust.
    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, CodecError> {
        let encoded = self.open(frame)?;
        Ok(BASE64.decode(encoded)?)
    }

    /// Strip the IV and reverse the stream cipher without base64-decoding
    ///
    /// Never fails on content: the wrong key yields garbage, not an error.
    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>, CodecError> {
        if frame.len() < IV_SIZE {
            return Err(CodecError::FrameTooShort { len: frame.len() });
        }

        let (iv, body) = frame.split_at(IV_SIZE);
        let mut body = body.to_vec();
        self.decrypt_in_place(iv, &mut body)?;
        Ok(body)
    }

    /// Encrypt a status-query response: a frame followed by the delimiter byte
    ///
    /// The receiver reads up to the first delimiter, so the frame itself must not contain
    /// one. A fresh IV changes every ciphertext byte, so collisions are re-rolled.
    pub fn encode_response(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        for attempt in 1..=MAX_RESPONSE_ATTEMPTS {
            let mut frame = self.encrypt(plaintext)?;
            if !frame.contains(&RESPONSE_DELIMITER) {
                frame.push(RESPONSE_DELIMITER);
                return Ok(frame);
            }
            debug!(attempt, "Response frame contained delimiter, re-rolling IV");
        }
        Err(CodecError::DelimiterCollision)
    }

    /// Decrypt a status-query response read up to and including the delimiter
    pub fn decode_response(&self, line: &[u8]) -> Result<Vec<u8>, CodecError> {
        let frame = line.strip_suffix(&[RESPONSE_DELIMITER]).unwrap_or(line);
        self.decrypt(frame)
    }

    fn encrypt_in_place(&self, iv: &[u8], buf: &mut [u8]) -> Result<(), CodecError> {
        let key = self.key.as_bytes();
        let invalid = |_| CodecError::InvalidKey(key.len());
        match key.len() {
            16 => Aes128CfbEnc::new_from_slices(key, iv)
                .map_err(invalid)?
                .encrypt(buf),
            24 => Aes192CfbEnc::new_from_slices(key, iv)
                .map_err(invalid)?
                .encrypt(buf),
            32 => Aes256CfbEnc::new_from_slices(key, iv)
                .map_err(invalid)?
                .encrypt(buf),
            n => return Err(CodecError::InvalidKey(n)),
        }
        Ok(())
    }

    fn decrypt_in_place(&self, iv: &[u8], buf: &mut [u8]) -> Result<(), CodecError> {
        let key = self.key.as_bytes();
        let invalid = |_| CodecError::InvalidKey(key.len());
        match key.len() {
            16 => Aes128CfbDec::new_from_slices(key, iv)
                .map_err(invalid)?
                .decrypt(buf),
            24 => Aes192CfbDec::new_from_slices(key, iv)
                .map_err(invalid)?
                .decrypt(buf),
            32 => Aes256CfbDec::new_from_slices(key, iv)
                .map_err(invalid)?
                .decrypt(buf),
            n => return Err(CodecError::InvalidKey(n)),
        }
        Ok(())
    }
}
