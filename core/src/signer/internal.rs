use async_trait::async_trait;
use nostr::{EventBuilder, Keys, Kind, Tag, Timestamp};

use super::{SignedEvent, Signer, UnsignedEvent};
use crate::error::{CoreError, Result};

/// 内蔵Signer（nostrクレートの鍵ペア）
///
/// 鍵の永続化は行わない。呼び出し側が秘密鍵の保管に責任を持つ
pub struct InternalSigner {
    keys: Keys,
}

impl InternalSigner {
    /// 新規生成
    pub fn generate() -> Self {
        Self {
            keys: Keys::generate(),
        }
    }

    /// 秘密鍵から復元
    pub fn from_secret_key(secret_key: &[u8]) -> Result<Self> {
        let secret_key_hex = hex::encode(secret_key);
        let keys = Keys::parse(&secret_key_hex)
            .map_err(|e| CoreError::SignerError(format!("Invalid secret key: {}", e)))?;
        Ok(Self { keys })
    }
}

#[async_trait(?Send)]
impl Signer for InternalSigner {
    async fn get_public_key(&self) -> Result<String> {
        Ok(self.keys.public_key().to_hex())
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<SignedEvent> {
        // Tagsを変換
        let tags: Vec<Tag> = unsigned
            .tags
            .iter()
            .filter_map(|tag_vec| Tag::parse(tag_vec).ok())
            .collect();

        let kind = Kind::from(unsigned.kind);
        let event = EventBuilder::new(kind, unsigned.content)
            .tags(tags)
            .custom_created_at(Timestamp::from(unsigned.created_at.max(0) as u64))
            .sign(&self.keys)
            .await
            .map_err(|e| CoreError::SignerError(format!("Failed to sign event: {}", e)))?;

        Ok(SignedEvent {
            id: event.id.to_hex(),
            pubkey: event.pubkey.to_hex(),
            created_at: event.created_at.as_u64() as i64,
            kind: event.kind.as_u16(),
            tags: event
                .tags
                .iter()
                .map(|t| {
                    let vec = t.clone().to_vec();
                    vec.iter().map(|s| s.to_string()).collect()
                })
                .collect(),
            content: event.content,
            sig: event.sig.to_string(),
        })
    }

    async fn nip04_encrypt(&self, pubkey: &str, plaintext: &str) -> Result<String> {
        let public_key = nostr::PublicKey::from_hex(pubkey)
            .map_err(|e| CoreError::SignerError(format!("Invalid pubkey: {}", e)))?;

        let encrypted = nostr::nips::nip04::encrypt(self.keys.secret_key(), &public_key, plaintext)
            .map_err(|e| CoreError::SignerError(format!("NIP-04 encryption failed: {}", e)))?;

        Ok(encrypted)
    }

    async fn nip04_decrypt(&self, pubkey: &str, ciphertext: &str) -> Result<String> {
        let public_key = nostr::PublicKey::from_hex(pubkey)
            .map_err(|e| CoreError::SignerError(format!("Invalid pubkey: {}", e)))?;

        let decrypted =
            nostr::nips::nip04::decrypt(self.keys.secret_key(), &public_key, ciphertext)
                .map_err(|e| CoreError::SignerError(format!("NIP-04 decryption failed: {}", e)))?;

        Ok(decrypted)
    }
}
