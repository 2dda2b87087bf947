use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

pub fn generate_wg_keys() -> KeyPair {
    let secret = StaticSecret::random_from_rng(&mut OsRng);
    let public = PublicKey::from(&secret);
    KeyPair {
        private_key: STANDARD.encode(secret.to_bytes()),
        public_key: STANDARD.encode(public.to_bytes()),
    }
}

pub fn wg_keys_from_private_base64(private_key: &str) -> Result<KeyPair> {
    let bytes = STANDARD
        .decode(private_key.trim())
        .context("invalid wireguard private key: not base64")?;
    if bytes.len() != 32 {
        return Err(anyhow!(
            "invalid wireguard private key: expected 32 bytes, got {} bytes",
            bytes.len()
        ));
    }
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&bytes);
    let secret = StaticSecret::from(secret);
    let public = PublicKey::from(&secret);
    Ok(KeyPair {
        private_key: STANDARD.encode(secret.to_bytes()),
        public_key: STANDARD.encode(public.to_bytes()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_base64_encoded() {
        let pair = generate_wg_keys();
        assert_eq!(STANDARD.decode(&pair.private_key).expect("decode").len(), 32);
        assert_eq!(STANDARD.decode(&pair.public_key).expect("decode").len(), 32);
    }

    #[test]
    fn private_key_derives_stable_public_key() {
        let private = STANDARD.encode([9u8; 32]);
        let first = wg_keys_from_private_base64(&private).expect("wg key parse");
        let second = wg_keys_from_private_base64(&private).expect("wg key parse");
        assert_eq!(first.public_key, second.public_key);
        assert!(!first.public_key.is_empty());
    }

    #[test]
    fn private_key_rejects_invalid_len() {
        let private = STANDARD.encode([1u8; 16]);
        let err = wg_keys_from_private_base64(&private).unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes"));
    }
}
