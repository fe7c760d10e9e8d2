use std::net::SocketAddr;

use base64::Engine;
use p384::ecdsa::{signature::Signer, Signature, SigningKey, VerifyingKey};
use p384::SecretKey;

use crate::spectral::protocol::{Handshake, Packet};

/// Field separator of the BungeeCord RealIP serverAddress convention.
pub const SEPARATOR: &str = "///";

/// Which RealIP generation to emit. New (v2.5) wins when both are configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealIpMode {
    Old,
    New,
}

/// Signs RealIP v2.5 tokens with the backend's P-384 key.
#[derive(Clone)]
pub struct RealIpSigner {
    key: SigningKey,
}

impl RealIpSigner {
    pub fn new(secret: &SecretKey) -> Self {
        Self {
            key: SigningKey::from(secret),
        }
    }

    /// Signature over the UTF-8 bytes of `clientIP || timestampMs` in decimal
    /// form, DER-encoded, base64url.
    pub fn token(&self, client_ip: &str, timestamp_ms: u64) -> String {
        let message = format!("{client_ip}{timestamp_ms}");
        let signature: Signature = self.key.sign(message.as_bytes());
        base64::engine::general_purpose::URL_SAFE.encode(signature.to_der().as_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.key.verifying_key()
    }
}

impl std::fmt::Debug for RealIpSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealIpSigner").finish_non_exhaustive()
    }
}

/// Rewrite a handshake's serverAddress with the RealIP token and re-encode.
///
/// `host` is the normalized virtual host (suffixes already stripped); the
/// remaining fields of the handshake are re-emitted unchanged.
pub fn rewrite_handshake(
    handshake: &Handshake,
    host: &str,
    client: SocketAddr,
    timestamp_ms: u64,
    signer: Option<&RealIpSigner>,
) -> Packet {
    let client_ip = client.ip().to_string();
    let server_address = match signer {
        None => format!("{host}{SEPARATOR}{client_ip}{SEPARATOR}{timestamp_ms}"),
        Some(signer) => {
            let sig = signer.token(&client_ip, timestamp_ms);
            format!("{host}{SEPARATOR}{client_ip}{SEPARATOR}{timestamp_ms}{SEPARATOR}{sig}")
        }
    };

    Handshake {
        server_address,
        ..handshake.clone()
    }
    .encode()
}
