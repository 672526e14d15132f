//! Payload integrity.
//!
//! When an integrity key is configured, outbound publish payloads are
//! prefixed with an 8-byte XxHash64 digest computed over key + payload, and
//! inbound payloads are verified and stripped before the commit reaches the
//! application. A failed verification drops that single message; it never
//! affects other peers or messages.

use std::hash::Hasher;

use twox_hash::XxHash64;

use crate::state::StateError;

const DIGEST_LEN: usize = 8;

#[derive(Debug, Default)]
pub struct SecurityService {
    key: Option<Vec<u8>>,
}

impl SecurityService {
    pub fn disabled() -> Self {
        Self { key: None }
    }

    pub fn with_key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Some(key.into()),
        }
    }

    pub fn from_config(key: Option<&str>) -> Self {
        match key {
            Some(k) if !k.is_empty() => Self::with_key(k.as_bytes().to_vec()),
            _ => Self::disabled(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.key.is_some()
    }

    fn digest(&self, key: &[u8], payload: &[u8]) -> [u8; DIGEST_LEN] {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(key);
        hasher.write(payload);
        hasher.finish().to_be_bytes()
    }

    /// Prefix the payload with its digest. Pass-through when disabled.
    pub fn wrap(&self, payload: &[u8]) -> Vec<u8> {
        match &self.key {
            None => payload.to_vec(),
            Some(key) => {
                let mut out = Vec::with_capacity(DIGEST_LEN + payload.len());
                out.extend_from_slice(&self.digest(key, payload));
                out.extend_from_slice(payload);
                out
            }
        }
    }

    /// Verify and strip the digest prefix. Pass-through when disabled.
    pub fn unwrap(&self, payload: &[u8]) -> Result<Vec<u8>, StateError> {
        match &self.key {
            None => Ok(payload.to_vec()),
            Some(key) => {
                if payload.len() < DIGEST_LEN {
                    return Err(StateError::SecurityCheckFailed);
                }
                let (prefix, body) = payload.split_at(DIGEST_LEN);
                if prefix != self.digest(key, body) {
                    return Err(StateError::SecurityCheckFailed);
                }
                Ok(body.to_vec())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_round_trips() {
        let svc = SecurityService::with_key(b"sekrit".to_vec());
        let wrapped = svc.wrap(b"payload");
        assert_eq!(wrapped.len(), 8 + 7);
        assert_eq!(svc.unwrap(&wrapped).unwrap(), b"payload");
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let svc = SecurityService::with_key(b"sekrit".to_vec());
        let mut wrapped = svc.wrap(b"payload");
        *wrapped.last_mut().unwrap() ^= 0xFF;
        assert_eq!(svc.unwrap(&wrapped), Err(StateError::SecurityCheckFailed));
    }

    #[test]
    fn key_mismatch_is_rejected() {
        let a = SecurityService::with_key(b"alpha".to_vec());
        let b = SecurityService::with_key(b"beta".to_vec());
        assert_eq!(
            b.unwrap(&a.wrap(b"payload")),
            Err(StateError::SecurityCheckFailed)
        );
    }

    #[test]
    fn disabled_service_is_a_pass_through() {
        let svc = SecurityService::disabled();
        assert_eq!(svc.wrap(b"x"), b"x");
        assert_eq!(svc.unwrap(b"x").unwrap(), b"x");
    }
}
