use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
const SIGNALING_AAD: &[u8] = b"webtty:signaling:v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("connection description carries no key material")]
    MissingKeyMaterial,
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid nonce: {0}")]
    InvalidNonce(String),
    #[error("sealed payload is not valid base64: {0}")]
    MalformedCiphertext(String),
    #[error("signaling payload failed authentication")]
    Authentication,
    #[error("signaling payload encryption failed")]
    Seal,
}

/// Symmetric key and nonce shared between the two ends of a one-way session.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    key: [u8; KEY_LEN],
    nonce: [u8; NONCE_LEN],
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

pub fn generate_key_material() -> KeyMaterial {
    let mut key = [0u8; KEY_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    KeyMaterial { key, nonce }
}

impl KeyMaterial {
    pub fn from_encoded(key: &str, nonce: &str) -> Result<Self, CryptoError> {
        let key_bytes = BASE64_STANDARD
            .decode(key.as_bytes())
            .map_err(|err| CryptoError::InvalidKey(err.to_string()))?;
        let key: [u8; KEY_LEN] = key_bytes.try_into().map_err(|bytes: Vec<u8>| {
            CryptoError::InvalidKey(format!("expected {KEY_LEN} bytes, got {}", bytes.len()))
        })?;

        let nonce_bytes = BASE64_STANDARD
            .decode(nonce.as_bytes())
            .map_err(|err| CryptoError::InvalidNonce(err.to_string()))?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes.try_into().map_err(|bytes: Vec<u8>| {
            CryptoError::InvalidNonce(format!("expected {NONCE_LEN} bytes, got {}", bytes.len()))
        })?;

        Ok(Self { key, nonce })
    }

    pub fn encoded_key(&self) -> String {
        BASE64_STANDARD.encode(self.key)
    }

    pub fn encoded_nonce(&self) -> String {
        BASE64_STANDARD.encode(self.nonce)
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    /// Nonce used when the responder seals its answer under the offer's key.
    /// Differs from the offer nonce in the top bit of the last byte so the
    /// same (key, nonce) pair never seals two messages.
    pub fn answer_nonce(&self) -> [u8; NONCE_LEN] {
        let mut nonce = self.nonce;
        nonce[NONCE_LEN - 1] ^= 0x80;
        nonce
    }

    /// Seals an answer payload; see [`KeyMaterial::answer_nonce`].
    pub fn seal_answer(&self, sdp: &str) -> Result<String, CryptoError> {
        seal(self, &self.answer_nonce(), sdp.as_bytes())
    }

    pub fn open_answer(&self, sealed: &str) -> Result<String, CryptoError> {
        open(self, &self.answer_nonce(), sealed)
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, CryptoError> {
        XChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|err| CryptoError::InvalidKey(err.to_string()))
    }
}

pub(crate) fn seal(
    material: &KeyMaterial,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<String, CryptoError> {
    let ciphertext = material
        .cipher()?
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: SIGNALING_AAD,
            },
        )
        .map_err(|_| CryptoError::Seal)?;
    Ok(BASE64_STANDARD.encode(ciphertext))
}

pub(crate) fn open(
    material: &KeyMaterial,
    nonce: &[u8; NONCE_LEN],
    sealed: &str,
) -> Result<String, CryptoError> {
    let ciphertext = BASE64_STANDARD
        .decode(sealed.as_bytes())
        .map_err(|err| CryptoError::MalformedCiphertext(err.to_string()))?;
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Authentication);
    }
    let plaintext = material
        .cipher()?
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: &ciphertext,
                aad: SIGNALING_AAD,
            },
        )
        .map_err(|_| CryptoError::Authentication)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::Authentication)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::ConnectionDescription;

    const SDP: &str = "v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n";

    fn sealed() -> ConnectionDescription {
        let mut description = ConnectionDescription::new(SDP);
        description.attach_key_material(&generate_key_material());
        description.encrypt().unwrap();
        description
    }

    #[test]
    fn key_material_has_documented_sizes() {
        let material = generate_key_material();
        let key = BASE64_STANDARD.decode(material.encoded_key()).unwrap();
        let nonce = BASE64_STANDARD.decode(material.encoded_nonce()).unwrap();
        assert_eq!(key.len(), KEY_LEN);
        assert_eq!(nonce.len(), NONCE_LEN);
        assert_ne!(generate_key_material(), material);
    }

    #[test]
    fn decrypt_restores_the_payload() {
        let mut description = sealed();
        assert_ne!(description.sdp, SDP);
        description.decrypt().unwrap();
        assert_eq!(description.sdp, SDP);
    }

    #[test]
    fn every_flipped_ciphertext_byte_fails_authentication() {
        let original = sealed();
        let raw = BASE64_STANDARD.decode(&original.sdp).unwrap();
        assert_eq!(raw.len(), SDP.len() + TAG_LEN);

        for index in 0..raw.len() {
            let mut tampered = raw.clone();
            tampered[index] ^= 0x01;
            let mut description = original.clone();
            description.sdp = BASE64_STANDARD.encode(&tampered);
            let err = description.decrypt().unwrap_err();
            assert!(
                matches!(err, CryptoError::Authentication),
                "byte {index} produced {err:?}"
            );
        }
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let mut description = sealed();
        let other = generate_key_material();
        description.key = Some(other.encoded_key());
        assert!(matches!(
            description.decrypt().unwrap_err(),
            CryptoError::Authentication
        ));
    }

    #[test]
    fn malformed_key_material_is_reported() {
        let mut description = ConnectionDescription::new(SDP);
        description.key = Some(BASE64_STANDARD.encode([0u8; 7]));
        description.nonce = Some(generate_key_material().encoded_nonce());
        assert!(matches!(
            description.encrypt().unwrap_err(),
            CryptoError::InvalidKey(_)
        ));

        description.key = Some(generate_key_material().encoded_key());
        description.nonce = Some("%%%".into());
        assert!(matches!(
            description.encrypt().unwrap_err(),
            CryptoError::InvalidNonce(_)
        ));
    }

    #[test]
    fn encrypt_without_key_material_fails() {
        let mut description = ConnectionDescription::new(SDP);
        assert!(matches!(
            description.encrypt().unwrap_err(),
            CryptoError::MissingKeyMaterial
        ));
    }

    #[test]
    fn answer_leg_uses_a_distinct_nonce() {
        let material = generate_key_material();
        assert_ne!(&material.answer_nonce(), material.nonce());

        let sealed_answer = material.seal_answer(SDP).unwrap();
        assert_eq!(material.open_answer(&sealed_answer).unwrap(), SDP);

        let mut as_offer = ConnectionDescription::new(sealed_answer);
        as_offer.attach_key_material(&material);
        assert!(matches!(
            as_offer.decrypt().unwrap_err(),
            CryptoError::Authentication
        ));
    }
}
