//! Copy/paste-safe signaling tokens.
//!
//! A token carries one [`ConnectionDescription`]: the SDP produced by the
//! local peer connection plus, for one-way sessions, the key material that
//! sealed it and the relay address the answer should be dropped at.
//!
//! Layout before base64: `version (1) | bincode(record) | crc32c (4, BE)`.
//! The whole frame is encoded with unpadded URL-safe base64 so the token is a
//! single word that survives terminals, chat clients and shell quoting.

pub mod crypto;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

pub use crypto::{CryptoError, KeyMaterial, generate_key_material};

pub const TOKEN_FORMAT_VERSION: u8 = 1;
const CHECKSUM_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("connection description has an empty payload")]
    EmptyPayload,
    #[error("token contains whitespace; paste it as a single line")]
    EmbeddedWhitespace,
    #[error("token is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("token is truncated ({0} bytes)")]
    Truncated(usize),
    #[error("unsupported token version {0}")]
    UnsupportedVersion(u8),
    #[error("token checksum mismatch (expected {expected:08x}, found {actual:08x})")]
    Checksum { expected: u32, actual: u32 },
    #[error("failed to serialize connection description: {0}")]
    Serialize(String),
    #[error("failed to parse connection description: {0}")]
    Deserialize(String),
    #[error("token carries only half of the key material")]
    PartialKeyMaterial,
}

/// One side's connection metadata as exchanged out of band.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescription {
    /// Session description, or its sealed form when key material is attached.
    pub sdp: String,
    /// Base64 XChaCha20-Poly1305 key.
    pub key: Option<String>,
    /// Base64 24 byte nonce.
    pub nonce: Option<String>,
    /// Relay slug the responder uploads its answer to (one-way only).
    pub relay_address: Option<String>,
}

impl ConnectionDescription {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            ..Self::default()
        }
    }

    pub fn has_key_material(&self) -> bool {
        self.key.is_some() || self.nonce.is_some()
    }

    pub fn attach_key_material(&mut self, material: &KeyMaterial) {
        self.key = Some(material.encoded_key());
        self.nonce = Some(material.encoded_nonce());
    }

    /// Removes key and nonce so the record can leave the process without
    /// disclosing them.
    pub fn strip_key_material(&mut self) {
        self.key = None;
        self.nonce = None;
    }

    pub fn key_material(&self) -> Result<KeyMaterial, CryptoError> {
        match (self.key.as_deref(), self.nonce.as_deref()) {
            (Some(key), Some(nonce)) => KeyMaterial::from_encoded(key, nonce),
            _ => Err(CryptoError::MissingKeyMaterial),
        }
    }

    /// Replaces the payload with its authenticated ciphertext.
    pub fn encrypt(&mut self) -> Result<(), CryptoError> {
        let material = self.key_material()?;
        self.sdp = crypto::seal(&material, material.nonce(), self.sdp.as_bytes())?;
        Ok(())
    }

    /// Restores the plaintext payload, failing hard if it was tampered with.
    pub fn decrypt(&mut self) -> Result<(), CryptoError> {
        let material = self.key_material()?;
        self.sdp = crypto::open(&material, material.nonce(), &self.sdp)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), SignalingError> {
        if self.sdp.is_empty() {
            return Err(SignalingError::EmptyPayload);
        }
        if self.key.is_some() != self.nonce.is_some() {
            return Err(SignalingError::PartialKeyMaterial);
        }
        Ok(())
    }
}

pub fn encode(description: &ConnectionDescription) -> Result<String, SignalingError> {
    description.validate()?;
    let body =
        bincode::serialize(description).map_err(|err| SignalingError::Serialize(err.to_string()))?;

    let mut frame = Vec::with_capacity(1 + body.len() + CHECKSUM_LEN);
    frame.push(TOKEN_FORMAT_VERSION);
    frame.extend_from_slice(&body);
    let checksum = crc32c(&frame);
    frame.extend_from_slice(&checksum.to_be_bytes());

    Ok(URL_SAFE_NO_PAD.encode(frame))
}

pub fn decode(token: &str) -> Result<ConnectionDescription, SignalingError> {
    let token = token.trim();
    if token.chars().any(char::is_whitespace) {
        return Err(SignalingError::EmbeddedWhitespace);
    }
    let frame = URL_SAFE_NO_PAD.decode(token)?;
    if frame.len() <= 1 + CHECKSUM_LEN {
        return Err(SignalingError::Truncated(frame.len()));
    }

    let (signed, trailer) = frame.split_at(frame.len() - CHECKSUM_LEN);
    let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = crc32c(signed);
    if expected != actual {
        return Err(SignalingError::Checksum { expected, actual });
    }
    if signed[0] != TOKEN_FORMAT_VERSION {
        return Err(SignalingError::UnsupportedVersion(signed[0]));
    }

    let description: ConnectionDescription = bincode::deserialize(&signed[1..])
        .map_err(|err| SignalingError::Deserialize(err.to_string()))?;
    description.validate()?;
    Ok(description)
}

/// Resolves operator input to a token. Input naming an existing file is
/// replaced by the file's last non-empty line.
pub fn resolve_token(input: &str) -> io::Result<String> {
    let input = input.trim();
    let path = Path::new(input);
    if input.is_empty() || !path.is_file() {
        return Ok(input.to_string());
    }
    let contents = fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_SDP: &str = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=group:BUNDLE 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n";

    #[test]
    fn plain_description_roundtrips() {
        let description = ConnectionDescription::new(SAMPLE_SDP);
        let token = encode(&description).unwrap();
        assert_eq!(decode(&token).unwrap(), description);
    }

    #[test]
    fn sealed_description_with_relay_roundtrips() {
        let mut description = ConnectionDescription::new(SAMPLE_SDP);
        description.attach_key_material(&generate_key_material());
        description.encrypt().unwrap();
        description.relay_address = Some("a".repeat(100));

        let token = encode(&description).unwrap();
        assert_eq!(decode(&token).unwrap(), description);
    }

    #[test]
    fn token_is_a_single_word() {
        let token = encode(&ConnectionDescription::new(SAMPLE_SDP)).unwrap();
        assert!(!token.is_empty());
        assert!(!token.chars().any(char::is_whitespace));
    }

    #[test]
    fn surrounding_whitespace_is_tolerated() {
        let description = ConnectionDescription::new(SAMPLE_SDP);
        let token = format!("  {}\n", encode(&description).unwrap());
        assert_eq!(decode(&token).unwrap(), description);
    }

    #[test]
    fn empty_payload_is_rejected() {
        let err = encode(&ConnectionDescription::default()).unwrap_err();
        assert!(matches!(err, SignalingError::EmptyPayload));
    }

    #[test]
    fn half_key_material_is_rejected() {
        let mut description = ConnectionDescription::new(SAMPLE_SDP);
        description.key = Some("abc".into());
        assert!(matches!(
            encode(&description).unwrap_err(),
            SignalingError::PartialKeyMaterial
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(decode("not-base64!").unwrap_err(), SignalingError::Base64(_)));
        assert!(matches!(decode("AAAA").unwrap_err(), SignalingError::Truncated(_)));
        assert!(matches!(
            decode("two words").unwrap_err(),
            SignalingError::EmbeddedWhitespace
        ));
    }

    #[test]
    fn transcription_errors_fail_the_checksum() {
        let token = encode(&ConnectionDescription::new(SAMPLE_SDP)).unwrap();
        let mut frame = URL_SAFE_NO_PAD.decode(&token).unwrap();
        frame[10] ^= 0x01;
        let damaged = URL_SAFE_NO_PAD.encode(frame);
        assert!(matches!(
            decode(&damaged).unwrap_err(),
            SignalingError::Checksum { .. }
        ));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let token = encode(&ConnectionDescription::new(SAMPLE_SDP)).unwrap();
        let mut frame = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let body_len = frame.len() - CHECKSUM_LEN;
        frame[0] = 9;
        let checksum = crc32c(&frame[..body_len]);
        frame[body_len..].copy_from_slice(&checksum.to_be_bytes());
        assert!(matches!(
            decode(&URL_SAFE_NO_PAD.encode(frame)).unwrap_err(),
            SignalingError::UnsupportedVersion(9)
        ));
    }

    #[test]
    fn strip_key_material_clears_both_halves() {
        let mut description = ConnectionDescription::new(SAMPLE_SDP);
        description.attach_key_material(&generate_key_material());
        assert!(description.has_key_material());
        description.strip_key_material();
        assert!(!description.has_key_material());
        assert!(matches!(
            description.key_material().unwrap_err(),
            CryptoError::MissingKeyMaterial
        ));
    }

    #[test_timeout::timeout(5)]
    fn tokens_are_read_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("webtty.offer");
        fs::write(&path, "old-token\nnew-token\n\n").unwrap();
        assert_eq!(resolve_token(path.to_str().unwrap()).unwrap(), "new-token");
        assert_eq!(resolve_token(" literal-token \n").unwrap(), "literal-token");
    }
}
