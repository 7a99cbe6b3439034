//! Client-mix envelope (§3.6, §4.6): the outer curve25519-AES-GCM wrapping
//! that carries a `{Forward, Relay}` header through a mix.
//!
//! The envelope shape — an ephemeral/static key pair, a DH-derived shared
//! secret, and an AEAD-sealed payload — follows the same layering as the
//! teacher's sealed-sender envelope (`sealed_sender::seal`/`open`), adapted
//! from XChaCha20-Poly1305 to the spec's fixed AES-GCM + u16-length-prefixed
//! header framing.

use thiserror::Error;

use crate::mixkeys::MixKeyList;
use crate::nymaddress::NymAddress;
use crate::primitives::{self, expand_shared_secret, x25519_base, x25519_dh, Rand};

const HEADER_ABSENT: u8 = 0x00;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope shorter than the minimum 96-byte outer framing")]
    TooShort,
    #[error("no mix key found for the envelope's peer_pub")]
    NoMixKey,
    #[error("AES-GCM open failed")]
    Aead,
    #[error("malformed ClientMixHeader")]
    BadHeader,
}

/// `Forward` carries the next mix's own client-mix envelope; `Relay` carries
/// a full nym address plus a revoke tag and an end-to-end ciphertext.
#[derive(Debug, Clone)]
pub enum ClientMixHeader {
    Forward {
        next_hop_mix_pub: [u8; 32],
        inner_envelope: Vec<u8>,
    },
    Relay {
        nym_address: NymAddress,
        revoke_id: Option<[u8; 32]>,
        token: Option<Vec<u8>>,
        payload: Vec<u8>,
    },
}

impl ClientMixHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            ClientMixHeader::Forward {
                next_hop_mix_pub,
                inner_envelope,
            } => {
                buf.push(0x01);
                buf.extend_from_slice(next_hop_mix_pub);
                buf.extend_from_slice(&(inner_envelope.len() as u32).to_be_bytes());
                buf.extend_from_slice(inner_envelope);
            }
            ClientMixHeader::Relay {
                nym_address,
                revoke_id,
                token,
                payload,
            } => {
                buf.push(0x02);
                let addr_bytes = nym_address.encode();
                buf.extend_from_slice(&(addr_bytes.len() as u16).to_be_bytes());
                buf.extend_from_slice(&addr_bytes);
                encode_optional_32(&mut buf, revoke_id.as_ref());
                encode_optional_bytes(&mut buf, token.as_deref());
                buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                buf.extend_from_slice(payload);
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.is_empty() {
            return Err(EnvelopeError::BadHeader);
        }
        match bytes[0] {
            0x01 => {
                if bytes.len() < 1 + 32 + 4 {
                    return Err(EnvelopeError::BadHeader);
                }
                let next_hop_mix_pub: [u8; 32] =
                    bytes[1..33].try_into().map_err(|_| EnvelopeError::BadHeader)?;
                let len = u32::from_be_bytes(bytes[33..37].try_into().unwrap()) as usize;
                if bytes.len() != 37 + len {
                    return Err(EnvelopeError::BadHeader);
                }
                Ok(ClientMixHeader::Forward {
                    next_hop_mix_pub,
                    inner_envelope: bytes[37..].to_vec(),
                })
            }
            0x02 => {
                if bytes.len() < 3 {
                    return Err(EnvelopeError::BadHeader);
                }
                let addr_len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
                let mut off = 3;
                if bytes.len() < off + addr_len {
                    return Err(EnvelopeError::BadHeader);
                }
                let nym_address = NymAddress::decode(&bytes[off..off + addr_len])
                    .map_err(|_| EnvelopeError::BadHeader)?;
                off += addr_len;
                let (revoke_id, off2) = decode_optional_32(bytes, off)?;
                off = off2;
                let (token, off3) = decode_optional_bytes(bytes, off)?;
                off = off3;
                if bytes.len() < off + 4 {
                    return Err(EnvelopeError::BadHeader);
                }
                let payload_len =
                    u32::from_be_bytes(bytes[off..off + 4].try_into().unwrap()) as usize;
                off += 4;
                if bytes.len() != off + payload_len {
                    return Err(EnvelopeError::BadHeader);
                }
                Ok(ClientMixHeader::Relay {
                    nym_address,
                    revoke_id,
                    token,
                    payload: bytes[off..].to_vec(),
                })
            }
            _ => Err(EnvelopeError::BadHeader),
        }
    }
}

fn encode_optional_32(buf: &mut Vec<u8>, v: Option<&[u8; 32]>) {
    match v {
        None => buf.push(HEADER_ABSENT),
        Some(bytes) => {
            buf.push(0x01);
            buf.extend_from_slice(bytes);
        }
    }
}

fn decode_optional_32(bytes: &[u8], off: usize) -> Result<(Option<[u8; 32]>, usize), EnvelopeError> {
    if bytes.len() <= off {
        return Err(EnvelopeError::BadHeader);
    }
    match bytes[off] {
        HEADER_ABSENT => Ok((None, off + 1)),
        0x01 => {
            if bytes.len() < off + 1 + 32 {
                return Err(EnvelopeError::BadHeader);
            }
            let v: [u8; 32] = bytes[off + 1..off + 33].try_into().unwrap();
            Ok((Some(v), off + 33))
        }
        _ => Err(EnvelopeError::BadHeader),
    }
}

fn encode_optional_bytes(buf: &mut Vec<u8>, v: Option<&[u8]>) {
    match v {
        None => buf.push(HEADER_ABSENT),
        Some(bytes) => {
            buf.push(0x01);
            buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            buf.extend_from_slice(bytes);
        }
    }
}

fn decode_optional_bytes(bytes: &[u8], off: usize) -> Result<(Option<Vec<u8>>, usize), EnvelopeError> {
    if bytes.len() <= off {
        return Err(EnvelopeError::BadHeader);
    }
    match bytes[off] {
        HEADER_ABSENT => Ok((None, off + 1)),
        0x01 => {
            if bytes.len() < off + 3 {
                return Err(EnvelopeError::BadHeader);
            }
            let len = u16::from_be_bytes([bytes[off + 1], bytes[off + 2]]) as usize;
            if bytes.len() < off + 3 + len {
                return Err(EnvelopeError::BadHeader);
            }
            Ok((Some(bytes[off + 3..off + 3 + len].to_vec()), off + 3 + len))
        }
        _ => Err(EnvelopeError::BadHeader),
    }
}

/// Encrypts `header` (and the trailing payload it already carries) into the
/// outer `peer_pub ‖ my_pub ‖ nonce ‖ AES-GCM(shared, plaintext)` framing.
pub fn encrypt(
    peer_pub: &[u8; 32],
    header: &ClientMixHeader,
    rng: &mut dyn Rand,
) -> Result<Vec<u8>, EnvelopeError> {
    let mut my_priv = [0u8; 32];
    rng.fill(&mut my_priv).map_err(|_| EnvelopeError::Aead)?;
    let my_pub = x25519_base(&my_priv);

    let mut nonce = [0u8; 32];
    rng.fill(&mut nonce).map_err(|_| EnvelopeError::Aead)?;

    let dh = x25519_dh(peer_pub, &my_priv);
    let (key, gcm_nonce) = expand_shared_secret(&dh, &nonce);

    let header_bytes = header.encode();
    let mut plaintext = Vec::with_capacity(2 + header_bytes.len());
    plaintext.extend_from_slice(&(header_bytes.len() as u16).to_be_bytes());
    plaintext.extend_from_slice(&header_bytes);

    let ciphertext = primitives::aes_gcm_seal(&key, &gcm_nonce, &plaintext);

    let mut out = Vec::with_capacity(96 + ciphertext.len());
    out.extend_from_slice(peer_pub);
    out.extend_from_slice(&my_pub);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts an envelope, looking up the mix's private key for `my_pub` in
/// `mix_keys`.
pub async fn decrypt(
    envelope: &[u8],
    mix_keys: &MixKeyList,
) -> Result<ClientMixHeader, EnvelopeError> {
    if envelope.len() <= 96 {
        return Err(EnvelopeError::TooShort);
    }
    let my_pub: [u8; 32] = envelope[0..32].try_into().unwrap();
    let peer_pub: [u8; 32] = envelope[32..64].try_into().unwrap();
    let nonce: [u8; 32] = envelope[64..96].try_into().unwrap();
    let ciphertext = &envelope[96..];

    let my_priv = mix_keys
        .get_private(&my_pub)
        .await
        .ok_or(EnvelopeError::NoMixKey)?;
    let dh = x25519_dh(&peer_pub, &my_priv);
    let (key, gcm_nonce) = expand_shared_secret(&dh, &nonce);

    let plaintext =
        primitives::aes_gcm_open(&key, &gcm_nonce, ciphertext).map_err(|_| EnvelopeError::Aead)?;
    if plaintext.len() < 2 {
        return Err(EnvelopeError::BadHeader);
    }
    let header_len = u16::from_be_bytes([plaintext[0], plaintext[1]]) as usize;
    if plaintext.len() != 2 + header_len {
        return Err(EnvelopeError::BadHeader);
    }
    ClientMixHeader::decode(&plaintext[2..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::OsRand;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn sample_nym_address() -> NymAddress {
        NymAddress {
            mix_address: "https://mix.mute.berlin/hop".into(),
            expire: 123,
            single_use: false,
            token_pub_key: [1u8; 32],
            mix_pub_key: [2u8; 32],
            address_key: [3u8; 32],
            private_data: vec![9u8; 64],
        }
    }

    #[tokio::test]
    async fn relay_header_roundtrip_through_envelope() {
        let mix_keys = MixKeyList::new(
            "https://mix.mute.berlin/hop".into(),
            [1u8; 32],
            SigningKey::generate(&mut OsRng),
            3600,
        );
        mix_keys.add_key(3600).await;
        let stmt = mix_keys.statement().await;
        let peer_pub: [u8; 32] = stmt.entries[0].0.clone().try_into().unwrap();

        let header = ClientMixHeader::Relay {
            nym_address: sample_nym_address(),
            revoke_id: Some([7u8; 32]),
            token: None,
            payload: b"end-to-end ciphertext".to_vec(),
        };
        let envelope = encrypt(&peer_pub, &header, &mut OsRand).unwrap();
        let decoded = decrypt(&envelope, &mix_keys).await.unwrap();
        match decoded {
            ClientMixHeader::Relay {
                nym_address,
                revoke_id,
                token,
                payload,
            } => {
                assert_eq!(nym_address, sample_nym_address());
                assert_eq!(revoke_id, Some([7u8; 32]));
                assert_eq!(token, None);
                assert_eq!(payload, b"end-to-end ciphertext");
            }
            _ => panic!("expected Relay header"),
        }
    }

    #[test]
    fn header_absent_sentinel_roundtrips() {
        let header = ClientMixHeader::Relay {
            nym_address: sample_nym_address(),
            revoke_id: None,
            token: Some(b"tok".to_vec()),
            payload: vec![],
        };
        let bytes = header.encode();
        let decoded = ClientMixHeader::decode(&bytes).unwrap();
        match decoded {
            ClientMixHeader::Relay { revoke_id, token, .. } => {
                assert_eq!(revoke_id, None);
                assert_eq!(token, Some(b"tok".to_vec()));
            }
            _ => panic!("expected Relay"),
        }
    }

    #[tokio::test]
    async fn decrypt_rejects_short_envelope() {
        let mix_keys = MixKeyList::new(
            "https://mix.mute.berlin/hop".into(),
            [1u8; 32],
            SigningKey::generate(&mut OsRng),
            3600,
        );
        let err = decrypt(&[0u8; 10], &mix_keys).await.unwrap_err();
        assert!(matches!(err, EnvelopeError::TooShort));
    }
}
