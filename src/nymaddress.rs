//! Nym address / mix relay (§3.5, §4.5): a self-opening ASN.1 blob that
//! authorizes a mix to deliver a message to a mailbox pseudonym, plus the
//! mix-side and recipient-side handling of a `Relay` client-mix header.
//!
//! The outer shape — an encrypted private block addressed by a curve25519
//! public key, opened by deriving a shared secret and decrypting — follows
//! the layering the teacher's onion module uses for its own forward/deliver
//! envelopes (`encrypt_layer`/`decrypt_layer`), generalized here to the
//! spec's ASN.1 nym-address fields and LIONESS inner cipher.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::primitives::{
    self, aes256_ctr_zero_iv, hmac_sha256, lioness_decrypt, lioness_encrypt, sha256, x25519_base,
    x25519_dh, Rand,
};

pub const RELAY_MIN: usize = 4096;
pub const RELAY_MAX: usize = 65536;

#[derive(Debug, Error)]
pub enum NymAddressError {
    #[error("malformed ASN.1 DER nym address")]
    Decode,
    #[error("nym address has expired")]
    Expired,
    #[error("plaintext length outside [{RELAY_MIN}, {RELAY_MAX}]")]
    BadPlaintextLength,
    #[error("no mix key found for the requested MixPubKey")]
    NoMixKey,
    #[error("LIONESS decryption of PrivateData failed")]
    PrivateDataDecrypt,
    #[error("HMAC verification of the relay header failed")]
    BadHmac,
    #[error("duplicate relay tag — already seen")]
    Replay,
    #[error("recipient addressing does not match")]
    WrongRecipient,
    #[error("AES-GCM open failed")]
    Aead,
}

/// The plaintext carried inside `PrivateData` once LIONESS-decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPrivate {
    pub system_tag: u8, // must be 0
    pub mailbox_address: Vec<u8>,
    pub expire: u64,
    pub single_use: bool,
    pub min_delay: u32,
    pub max_delay: u32,
    pub nonce: [u8; 32],
    pub receiver_pub_key: [u8; 32],
    pub enc_nym: Vec<u8>,
    pub hmac_head: [u8; 32],
}

impl AddressPrivate {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.system_tag);
        buf.extend_from_slice(&(self.mailbox_address.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.mailbox_address);
        buf.extend_from_slice(&self.expire.to_be_bytes());
        buf.push(self.single_use as u8);
        buf.extend_from_slice(&self.min_delay.to_be_bytes());
        buf.extend_from_slice(&self.max_delay.to_be_bytes());
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.receiver_pub_key);
        buf.extend_from_slice(&(self.enc_nym.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.enc_nym);
        buf.extend_from_slice(&self.hmac_head);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, NymAddressError> {
        if bytes.len() < 1 + 2 {
            return Err(NymAddressError::Decode);
        }
        let system_tag = bytes[0];
        let mailbox_len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
        let mut off = 3;
        if bytes.len() < off + mailbox_len + 8 + 1 + 4 + 4 + 32 + 32 + 2 {
            return Err(NymAddressError::Decode);
        }
        let mailbox_address = bytes[off..off + mailbox_len].to_vec();
        off += mailbox_len;
        let expire = u64::from_be_bytes(bytes[off..off + 8].try_into().unwrap());
        off += 8;
        let single_use = bytes[off] != 0;
        off += 1;
        let min_delay = u32::from_be_bytes(bytes[off..off + 4].try_into().unwrap());
        off += 4;
        let max_delay = u32::from_be_bytes(bytes[off..off + 4].try_into().unwrap());
        off += 4;
        let mut nonce = [0u8; 32];
        nonce.copy_from_slice(&bytes[off..off + 32]);
        off += 32;
        let mut receiver_pub_key = [0u8; 32];
        receiver_pub_key.copy_from_slice(&bytes[off..off + 32]);
        off += 32;
        let enc_nym_len = u16::from_be_bytes([bytes[off], bytes[off + 1]]) as usize;
        off += 2;
        if bytes.len() < off + enc_nym_len + 32 {
            return Err(NymAddressError::Decode);
        }
        let enc_nym = bytes[off..off + enc_nym_len].to_vec();
        off += enc_nym_len;
        let mut hmac_head = [0u8; 32];
        hmac_head.copy_from_slice(&bytes[off..off + 32]);
        Ok(Self {
            system_tag,
            mailbox_address,
            expire,
            single_use,
            min_delay,
            max_delay,
            nonce,
            receiver_pub_key,
            enc_nym,
            hmac_head,
        })
    }
}

/// The ASN.1 DER nym address sequence of §3.5. Minimal DER tags are used so
/// the wire format is genuinely ASN.1-shaped — there is no ASN.1 crate
/// anywhere in this crate's dependency set, so this follows the teacher's
/// own idiom of a hand-rolled, explicit byte-layout codec (`onion.rs`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NymAddress {
    pub mix_address: String,
    pub expire: u64,
    pub single_use: bool,
    pub token_pub_key: [u8; 32],
    pub mix_pub_key: [u8; 32],
    pub address_key: [u8; 32],
    pub private_data: Vec<u8>,
}

fn der_len_prefixed(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    // Minimal-DER length: short form under 128, else 0x80|n_bytes + big-endian length.
    if content.len() < 128 {
        out.push(content.len() as u8);
    } else {
        let len_bytes = (content.len() as u64).to_be_bytes();
        let trimmed: Vec<u8> = len_bytes
            .iter()
            .skip_while(|&&b| b == 0)
            .cloned()
            .collect();
        out.push(0x80 | trimmed.len() as u8);
        out.extend_from_slice(&trimmed);
    }
    out.extend_from_slice(content);
    out
}

fn der_read_tlv<'a>(bytes: &'a [u8], expect_tag: u8) -> Result<(&'a [u8], &'a [u8]), NymAddressError> {
    if bytes.len() < 2 || bytes[0] != expect_tag {
        return Err(NymAddressError::Decode);
    }
    let (len, mut off) = if bytes[1] & 0x80 == 0 {
        (bytes[1] as usize, 2)
    } else {
        let n = (bytes[1] & 0x7F) as usize;
        if bytes.len() < 2 + n {
            return Err(NymAddressError::Decode);
        }
        let mut len = 0usize;
        for &b in &bytes[2..2 + n] {
            len = (len << 8) | b as usize;
        }
        (len, 2 + n)
    };
    if bytes.len() < off + len {
        return Err(NymAddressError::Decode);
    }
    let content = &bytes[off..off + len];
    off += len;
    Ok((content, &bytes[off..]))
}

impl NymAddress {
    pub fn encode(&self) -> Vec<u8> {
        let mut seq_body = Vec::new();
        seq_body.extend(der_len_prefixed(0x0C, self.mix_address.as_bytes())); // UTF8String
        seq_body.extend(der_len_prefixed(0x02, &self.expire.to_be_bytes())); // INTEGER
        seq_body.extend(der_len_prefixed(0x01, &[self.single_use as u8])); // BOOLEAN
        seq_body.extend(der_len_prefixed(0x04, &self.token_pub_key)); // OCTET STRING
        seq_body.extend(der_len_prefixed(0x04, &self.mix_pub_key));
        seq_body.extend(der_len_prefixed(0x04, &self.address_key));
        seq_body.extend(der_len_prefixed(0x04, &self.private_data));
        der_len_prefixed(0x30, &seq_body) // SEQUENCE
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NymAddressError> {
        let (seq_body, _) = der_read_tlv(bytes, 0x30)?;
        let (mix_address_b, rest) = der_read_tlv(seq_body, 0x0C)?;
        let (expire_b, rest) = der_read_tlv(rest, 0x02)?;
        let (single_use_b, rest) = der_read_tlv(rest, 0x01)?;
        let (token_pub_b, rest) = der_read_tlv(rest, 0x04)?;
        let (mix_pub_b, rest) = der_read_tlv(rest, 0x04)?;
        let (addr_key_b, rest) = der_read_tlv(rest, 0x04)?;
        let (priv_data_b, _) = der_read_tlv(rest, 0x04)?;

        let mix_address =
            String::from_utf8(mix_address_b.to_vec()).map_err(|_| NymAddressError::Decode)?;
        let mut expire_buf = [0u8; 8];
        let off = 8usize.saturating_sub(expire_b.len());
        expire_buf[off..].copy_from_slice(expire_b);
        let expire = u64::from_be_bytes(expire_buf);
        let single_use = single_use_b.first().copied().unwrap_or(0) != 0;

        fn as32(b: &[u8]) -> Result<[u8; 32], NymAddressError> {
            b.try_into().map_err(|_| NymAddressError::Decode)
        }

        Ok(Self {
            mix_address,
            expire,
            single_use,
            token_pub_key: as32(token_pub_b)?,
            mix_pub_key: as32(mix_pub_b)?,
            address_key: as32(addr_key_b)?,
            private_data: priv_data_b.to_vec(),
        })
    }
}

/// Derivation inputs the recipient holds permanently.
pub struct AddressTemplate {
    pub secret: [u8; 32],
}

impl AddressTemplate {
    /// Derives `(priv_key, pub_key)` for a specific `(nonce, nym)` pair.
    pub fn derive_address_key(&self, nonce: &[u8; 32], nym: &[u8]) -> ([u8; 32], [u8; 32]) {
        let priv_key = hmac_sha256(&self.secret, &[nonce.as_slice(), nym].concat());
        let pub_key = x25519_base(&priv_key);
        (priv_key, pub_key)
    }

    fn sym_key(&self, nonce: &[u8; 32], receiver_pub: &[u8; 32], mailbox: &[u8]) -> [u8; 32] {
        hmac_sha256(
            &self.secret,
            &[nonce.as_slice(), receiver_pub.as_slice(), mailbox].concat(),
        )
    }

    /// Recipient creates a nym address authorizing delivery of messages
    /// tagged `nym` to `mailbox_address` through the mix described by
    /// `mix_pub_key`/`mix_address`/`token_pub_key`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_address(
        &self,
        mix_address: String,
        mix_pub_key: [u8; 32],
        token_pub_key: [u8; 32],
        mailbox_address: Vec<u8>,
        nym: &[u8],
        expire: u64,
        single_use: bool,
        min_delay: u32,
        max_delay: u32,
        rng: &mut dyn Rand,
    ) -> Result<NymAddress, NymAddressError> {
        let mut nonce = [0u8; 32];
        rng.fill(&mut nonce).map_err(|_| NymAddressError::Decode)?;
        let (_, receiver_pub_key) = self.derive_address_key(&nonce, nym);
        let sym_key = self.sym_key(&nonce, &receiver_pub_key, &mailbox_address);

        let mut padded_nym = vec![0u8; 64.max(nym.len())];
        padded_nym[..nym.len()].copy_from_slice(nym);
        let enc_nym = aes256_ctr_zero_iv(&sym_key, &padded_nym);
        let hmac_head = hmac_sha256(
            &sym_key,
            &[nonce.as_slice(), receiver_pub_key.as_slice(), enc_nym.as_slice()].concat(),
        );

        let mut address_priv = [0u8; 32];
        rng.fill(&mut address_priv).map_err(|_| NymAddressError::Decode)?;
        let address_key = x25519_base(&address_priv);

        let shared = x25519_dh(&mix_pub_key, &address_priv);
        let plaintext = AddressPrivate {
            system_tag: 0,
            mailbox_address,
            expire,
            single_use,
            min_delay,
            max_delay,
            nonce,
            receiver_pub_key,
            enc_nym,
            hmac_head,
        }
        .encode();
        let private_data = lioness_encrypt(&shared, &plaintext)
            .map_err(|_| NymAddressError::PrivateDataDecrypt)?;

        Ok(NymAddress {
            mix_address,
            expire,
            single_use,
            token_pub_key,
            mix_pub_key,
            address_key,
            private_data,
        })
    }
}

/// Relay header carried through the mix after it re-encrypts toward the
/// mailbox: `(sender_pub, Nonce, ReceiverPubKey, EncNym, HMACHead)`.
#[derive(Debug, Clone)]
pub struct RelayHeader {
    pub sender_pub: [u8; 32],
    pub nonce: [u8; 32],
    pub receiver_pub_key: [u8; 32],
    pub enc_nym: Vec<u8>,
    pub hmac_head: [u8; 32],
}

impl RelayHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.sender_pub);
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.receiver_pub_key);
        buf.extend_from_slice(&(self.enc_nym.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.enc_nym);
        buf.extend_from_slice(&self.hmac_head);
        buf
    }
}

/// Provides the mix's private key given a `MixPubKey`, abstracting the mix
/// key list lookup (§4.4) from the relay logic itself.
pub trait MixKeyLookup {
    fn get_private(&self, mix_pub_key: &[u8; 32]) -> Option<[u8; 32]>;
}

/// The mix's replay-uniqueness set (§4.5 step 4): a tag together with the
/// time it should be purged.
pub struct ReplaySet {
    seen: Mutex<HashMap<[u8; 32], u64>>,
}

impl Default for ReplaySet {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplaySet {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts `tag` with `expire`; returns `Err(Replay)` if already present.
    pub async fn insert_or_reject(&self, tag: [u8; 32], expire: u64) -> Result<(), NymAddressError> {
        let mut guard = self.seen.lock().await;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs();
        guard.retain(|_, &mut exp| exp >= now);
        if guard.contains_key(&tag) {
            return Err(NymAddressError::Replay);
        }
        guard.insert(tag, expire);
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// Mix-side handling of a `Relay` header whose payload is `inner_plaintext`
/// (already length-validated and separated from the client-mix header by
/// the caller — see `envelope.rs`).
pub async fn mix_handle_relay(
    nym_address_bytes: &[u8],
    inner_plaintext: &[u8],
    mix_keys: &dyn MixKeyLookup,
    replay_set: &ReplaySet,
    rng: &mut dyn Rand,
) -> Result<(RelayHeader, Vec<u8>, Vec<u8>), NymAddressError> {
    if !(RELAY_MIN..=RELAY_MAX).contains(&inner_plaintext.len()) {
        return Err(NymAddressError::BadPlaintextLength);
    }
    let addr = NymAddress::decode(nym_address_bytes)?;
    if addr.expire < now_secs() {
        return Err(NymAddressError::Expired);
    }
    let mix_priv = mix_keys
        .get_private(&addr.mix_pub_key)
        .ok_or(NymAddressError::NoMixKey)?;
    let shared = x25519_dh(&addr.address_key, &mix_priv);
    let plaintext = lioness_decrypt(&shared, &addr.private_data)
        .map_err(|_| NymAddressError::PrivateDataDecrypt)?;
    let inner = AddressPrivate::decode(&plaintext)?;
    if inner.system_tag != 0 {
        return Err(NymAddressError::Decode);
    }

    let dedup_tag = sha256(&inner_plaintext[..inner_plaintext.len().min(256)]);
    replay_set.insert_or_reject(dedup_tag, inner.expire).await?;
    if inner.single_use {
        replay_set
            .insert_or_reject(inner.receiver_pub_key, inner.expire)
            .await?;
    }

    let mut ephemeral_priv = [0u8; 32];
    rng.fill(&mut ephemeral_priv)
        .map_err(|_| NymAddressError::Decode)?;
    let sender_pub = x25519_base(&ephemeral_priv);
    let shared_to_recipient = x25519_dh(&inner.receiver_pub_key, &ephemeral_priv);

    let header = RelayHeader {
        sender_pub,
        nonce: inner.nonce,
        receiver_pub_key: inner.receiver_pub_key,
        enc_nym: inner.enc_nym.clone(),
        hmac_head: inner.hmac_head,
    };
    let header_bytes = header.encode();
    let gcm_nonce12: [u8; 12] = sha256(&header_bytes)[..12].try_into().unwrap();
    let ciphertext = primitives::aes_gcm_seal(&shared_to_recipient, &gcm_nonce12, inner_plaintext);

    let mut delivery = Vec::new();
    delivery.extend_from_slice(&(header_bytes.len() as u16).to_be_bytes());
    delivery.extend_from_slice(&header_bytes);
    delivery.extend_from_slice(&ciphertext);

    Ok((header, inner.mailbox_address, delivery))
}

/// Recipient-side opening of a delivered `u16-len ‖ header ‖ ciphertext`
/// blob (§4.5 recipient-side steps), given the account's long-lived
/// `Secret`. Returns the recovered `nym` and the decrypted inner message.
pub fn recipient_open(
    template: &AddressTemplate,
    delivered: &[u8],
    mailbox_address: &[u8],
    expected_my_id_hash: &[u8; 32],
) -> Result<(Vec<u8>, Vec<u8>), NymAddressError> {
    if delivered.len() < 2 {
        return Err(NymAddressError::Decode);
    }
    let header_len = u16::from_be_bytes([delivered[0], delivered[1]]) as usize;
    if delivered.len() < 2 + header_len {
        return Err(NymAddressError::Decode);
    }
    let header_bytes = &delivered[2..2 + header_len];
    let ciphertext = &delivered[2 + header_len..];

    if header_bytes.len() < 32 + 32 + 32 + 2 + 32 {
        return Err(NymAddressError::Decode);
    }
    let sender_pub: [u8; 32] = header_bytes[0..32].try_into().unwrap();
    let nonce: [u8; 32] = header_bytes[32..64].try_into().unwrap();
    let receiver_pub_key: [u8; 32] = header_bytes[64..96].try_into().unwrap();
    let enc_nym_len = u16::from_be_bytes([header_bytes[96], header_bytes[97]]) as usize;
    if header_bytes.len() != 98 + enc_nym_len + 32 {
        return Err(NymAddressError::Decode);
    }
    let enc_nym = &header_bytes[98..98 + enc_nym_len];
    let hmac_head: [u8; 32] = header_bytes[98 + enc_nym_len..].try_into().unwrap();

    let sym_key = template.sym_key(&nonce, &receiver_pub_key, mailbox_address);
    let expected_hmac = hmac_sha256(
        &sym_key,
        &[nonce.as_slice(), receiver_pub_key.as_slice(), enc_nym].concat(),
    );
    if expected_hmac != hmac_head {
        return Err(NymAddressError::BadHmac);
    }

    let nym_padded = aes256_ctr_zero_iv(&sym_key, enc_nym);
    let nym: Vec<u8> = nym_padded.into_iter().take_while(|&b| b != 0).collect();

    let (rec_priv, rec_pub) = template.derive_address_key(&nonce, &nym);
    if rec_pub != receiver_pub_key {
        return Err(NymAddressError::WrongRecipient);
    }

    let shared = x25519_dh(&sender_pub, &rec_priv);
    let gcm_nonce12: [u8; 12] = sha256(header_bytes)[..12].try_into().unwrap();
    let plaintext = primitives::aes_gcm_open(&shared, &gcm_nonce12, ciphertext)
        .map_err(|_| NymAddressError::Aead)?;

    if sha256(&nym) != *expected_my_id_hash {
        return Err(NymAddressError::WrongRecipient);
    }

    Ok((nym, plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::OsRand;
    use std::collections::HashMap as Map;

    struct FakeMixKeys(Map<[u8; 32], [u8; 32]>);

    impl MixKeyLookup for FakeMixKeys {
        fn get_private(&self, pk: &[u8; 32]) -> Option<[u8; 32]> {
            self.0.get(pk).copied()
        }
    }

    #[test]
    fn nym_address_der_roundtrip() {
        let addr = NymAddress {
            mix_address: "https://mix.mute.berlin/hop".into(),
            expire: 123456,
            single_use: true,
            token_pub_key: [1u8; 32],
            mix_pub_key: [2u8; 32],
            address_key: [3u8; 32],
            private_data: vec![9u8; 100],
        };
        let bytes = addr.encode();
        let decoded = NymAddress::decode(&bytes).unwrap();
        assert_eq!(decoded, addr);
    }

    #[tokio::test]
    async fn end_to_end_mix_relay_and_recipient_open() {
        let template = AddressTemplate { secret: [42u8; 32] };
        let nym = b"alice-mailbox-nym";
        let my_id_hash = sha256(nym);

        let mut mix_priv = [0u8; 32];
        OsRand.fill(&mut mix_priv).unwrap();
        let mix_pub = x25519_base(&mix_priv);

        let addr = template
            .create_address(
                "https://mix.mute.berlin/hop".into(),
                mix_pub,
                [7u8; 32],
                b"mailbox-bob".to_vec(),
                nym,
                now_secs() + 3600,
                true,
                0,
                1000,
                &mut OsRand,
            )
            .unwrap();

        let mut keys = Map::new();
        keys.insert(mix_pub, mix_priv);
        let mix_keys = FakeMixKeys(keys);
        let replay_set = ReplaySet::new();

        let inner_plaintext = vec![7u8; RELAY_MIN];
        let (_, mailbox, delivered) = mix_handle_relay(
            &addr.encode(),
            &inner_plaintext,
            &mix_keys,
            &replay_set,
            &mut OsRand,
        )
        .await
        .unwrap();
        assert_eq!(mailbox, b"mailbox-bob");

        let (recovered_nym, plaintext) =
            recipient_open(&template, &delivered, b"mailbox-bob", &my_id_hash).unwrap();
        assert_eq!(recovered_nym, nym);
        assert_eq!(plaintext, inner_plaintext);
    }

    #[tokio::test]
    async fn single_use_replay_is_rejected_on_second_delivery() {
        let replay_set = ReplaySet::new();
        let tag = [5u8; 32];
        replay_set.insert_or_reject(tag, now_secs() + 60).await.unwrap();
        let err = replay_set.insert_or_reject(tag, now_secs() + 60).await.unwrap_err();
        assert!(matches!(err, NymAddressError::Replay));
    }
}
