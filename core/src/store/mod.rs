pub mod mock;

use async_trait::async_trait;

use crate::error::Result;
use crate::signer::SignedEvent;
use crate::types::{CancelToken, Filter, NostrEvent};

/// 問い合わせタイムアウトの既定値（ミリ秒）
pub const DEFAULT_QUERY_TIMEOUT_MS: u32 = 4_000;

/// イベントストア抽象trait
///
/// Relay群への問い合わせと署名済みイベントの発行だけを提供する。
/// ローカルに永続状態は持たず、毎回ストアから真実を導出し直す。
/// WASM環境ではシングルスレッドのため、Send + Sync要件なし
#[async_trait(?Send)]
pub trait EventStore {
    /// フィルターに合致するイベントを取得
    ///
    /// タイムアウト・キャンセルは「結果ゼロ」ではなく失敗として返す
    async fn query(
        &self,
        filters: &[Filter],
        timeout_ms: u32,
        cancel: &CancelToken,
    ) -> Result<Vec<NostrEvent>>;

    /// 署名済みイベントを発行
    async fn publish(&self, event: &SignedEvent, timeout_ms: u32) -> Result<()>;
}
