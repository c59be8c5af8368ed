pub mod nip07;
pub mod internal;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{now_unix, NostrEvent};

/// 署名者の抽象trait
/// WASM環境ではシングルスレッドのため、Send + Sync要件なし
#[async_trait(?Send)]
pub trait Signer {
    /// 公開鍵を取得
    async fn get_public_key(&self) -> Result<String>;

    /// イベントに署名
    async fn sign_event(&self, unsigned_event: UnsignedEvent) -> Result<SignedEvent>;

    /// NIP-04暗号化
    async fn nip04_encrypt(&self, pubkey: &str, plaintext: &str) -> Result<String>;

    /// NIP-04復号化
    async fn nip04_decrypt(&self, pubkey: &str, ciphertext: &str) -> Result<String>;
}

/// 未署名イベント
#[derive(Debug, Clone)]
pub struct UnsignedEvent {
    pub kind: u16,
    pub content: String,
    pub tags: Vec<Vec<String>>,
    pub created_at: i64,
}

impl UnsignedEvent {
    pub fn new(kind: u16, content: String, tags: Vec<Vec<String>>) -> Self {
        Self {
            kind,
            content,
            tags,
            created_at: now_unix(),
        }
    }
}

/// 署名済みイベント
#[derive(Debug, Clone)]
pub struct SignedEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl SignedEvent {
    /// JSONに変換
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "id": self.id,
            "pubkey": self.pubkey,
            "created_at": self.created_at,
            "kind": self.kind,
            "tags": self.tags,
            "content": self.content,
            "sig": self.sig,
        })
        .to_string()
    }

    /// 受信イベントと同じ型へ変換（Mockストアへの反映用）
    pub fn to_event(&self) -> NostrEvent {
        NostrEvent {
            id: self.id.clone(),
            pubkey: self.pubkey.clone(),
            kind: self.kind,
            content: self.content.clone(),
            tags: self.tags.clone(),
            created_at: self.created_at,
            sig: self.sig.clone(),
        }
    }
}

/// 現在のユーザー（公開鍵 + 署名能力）
///
/// グローバルな「現在のユーザー」状態は持たず、
/// 整合・メッセージング処理へ引数として明示的に渡す
#[derive(Clone)]
pub struct Identity {
    pub pubkey: String,
    pub signer: Arc<dyn Signer>,
}

impl Identity {
    pub async fn from_signer(signer: Arc<dyn Signer>) -> Result<Self> {
        let pubkey = signer.get_public_key().await?;
        Ok(Self { pubkey, signer })
    }
}
