use std::cell::Cell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{CoreError, Result};

/// オークション出品 (NIP-15, dタグで識別されるreplaceableイベント)
pub const KIND_AUCTION: u16 = 30020;
/// 入札
pub const KIND_BID: u16 = 1021;
/// 入札への確認（売り手発のみ有効）
pub const KIND_BID_CONFIRMATION: u16 = 1022;
/// オークションステータス更新（売り手発のみ有効）
pub const KIND_AUCTION_STATUS: u16 = 1023;
/// NIP-04 暗号化DM
pub const KIND_DM: u16 = 4;
/// リアクション
pub const KIND_REACTION: u16 = 7;
/// 公開コメント
pub const KIND_COMMENT: u16 = 1111;

/// Relayから受信した署名済みイベント
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NostrEvent {
    pub id: String,
    pub pubkey: String,
    pub kind: u16,
    pub content: String,
    pub tags: Vec<Vec<String>>,
    pub created_at: i64,
    pub sig: String,
}

impl NostrEvent {
    /// 最初に現れる該当タグの値
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 2 && t[0] == name)
            .map(|t| t[1].as_str())
    }

    /// 該当タグの値すべて
    pub fn tag_values(&self, name: &str) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|t| t.len() >= 2 && t[0] == name)
            .map(|t| t[1].as_str())
            .collect()
    }

    /// マーカー付きeタグ（コメントスレッド用）
    pub fn e_tag_with_marker(&self, marker: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 4 && t[0] == "e" && t[3] == marker)
            .map(|t| t[1].as_str())
    }
}

/// Relayへの問い合わせフィルター
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub kinds: Option<Vec<u16>>,
    pub authors: Option<Vec<String>>,
    pub ids: Option<Vec<String>>,
    pub e_tags: Option<Vec<String>>,
    pub d_tags: Option<Vec<String>>,
    pub p_tags: Option<Vec<String>>,
    pub since: Option<i64>,
    pub limit: Option<u32>,
}

impl Filter {
    pub fn kinds(kinds: &[u16]) -> Self {
        Self {
            kinds: Some(kinds.to_vec()),
            ..Default::default()
        }
    }

    /// REQ用のJSON表現
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        if let Some(kinds) = &self.kinds {
            obj.insert("kinds".to_string(), json!(kinds));
        }
        if let Some(authors) = &self.authors {
            obj.insert("authors".to_string(), json!(authors));
        }
        if let Some(ids) = &self.ids {
            obj.insert("ids".to_string(), json!(ids));
        }
        if let Some(e_tags) = &self.e_tags {
            obj.insert("#e".to_string(), json!(e_tags));
        }
        if let Some(d_tags) = &self.d_tags {
            obj.insert("#d".to_string(), json!(d_tags));
        }
        if let Some(p_tags) = &self.p_tags {
            obj.insert("#p".to_string(), json!(p_tags));
        }
        if let Some(since) = self.since {
            obj.insert("since".to_string(), json!(since));
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".to_string(), json!(limit));
        }
        Value::Object(obj)
    }

    /// イベントがこのフィルターに合致するか（Mockストア用）
    pub fn matches(&self, event: &NostrEvent) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|i| i == &event.id) {
                return false;
            }
        }
        if let Some(e_tags) = &self.e_tags {
            let values = event.tag_values("e");
            if !e_tags.iter().any(|t| values.contains(&t.as_str())) {
                return false;
            }
        }
        if let Some(d_tags) = &self.d_tags {
            let values = event.tag_values("d");
            if !d_tags.iter().any(|t| values.contains(&t.as_str())) {
                return false;
            }
        }
        if let Some(p_tags) = &self.p_tags {
            let values = event.tag_values("p");
            if !p_tags.iter().any(|t| values.contains(&t.as_str())) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        true
    }
}

/// 実行中の問い合わせを呼び出し側から中断するためのトークン
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Rc<Cell<bool>>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(false)))
    }

    pub fn cancel(&self) {
        self.0.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }
}

/// 現在のUNIXタイムスタンプ（秒）
pub fn now_unix() -> i64 {
    #[cfg(target_arch = "wasm32")]
    {
        (js_sys::Date::now() / 1000.0) as i64
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// ランダムな16進ID
pub fn random_hex(bytes: usize) -> Result<String> {
    let mut buf = vec![0u8; bytes];
    getrandom::getrandom(&mut buf)
        .map_err(|e| CoreError::Other(format!("getrandom failed: {}", e)))?;
    Ok(hex::encode(buf))
}
