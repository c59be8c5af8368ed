use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{CoreError, Result};
use crate::signer::SignedEvent;
use crate::store::EventStore;
use crate::types::{CancelToken, Filter, NostrEvent};

/// テスト用のモックイベントストア実装
#[derive(Clone, Default)]
pub struct MockEventStore {
    events: Arc<Mutex<Vec<NostrEvent>>>,
    published: Arc<Mutex<Vec<SignedEvent>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl MockEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// イベントを直接投入（他者発のイベントを模す）
    pub fn seed(&self, event: NostrEvent) {
        self.events.lock().unwrap().push(event);
    }

    /// トランスポート障害を模す
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    /// 発行されたイベント一覧
    pub fn published(&self) -> Vec<SignedEvent> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait(?Send)]
impl EventStore for MockEventStore {
    async fn query(
        &self,
        filters: &[Filter],
        _timeout_ms: u32,
        cancel: &CancelToken,
    ) -> Result<Vec<NostrEvent>> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        if *self.unavailable.lock().unwrap() {
            return Err(CoreError::Unavailable("mock store unavailable".to_string()));
        }

        let events = self.events.lock().unwrap();
        let mut seen = HashSet::new();
        let mut result = Vec::new();

        for filter in filters {
            // フィルター毎に新しい順で取得、limit適用
            let mut matched: Vec<&NostrEvent> =
                events.iter().filter(|e| filter.matches(e)).collect();
            matched.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            if let Some(limit) = filter.limit {
                matched.truncate(limit as usize);
            }
            for event in matched {
                if seen.insert(event.id.clone()) {
                    result.push(event.clone());
                }
            }
        }

        result.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(result)
    }

    async fn publish(&self, event: &SignedEvent, _timeout_ms: u32) -> Result<()> {
        if *self.unavailable.lock().unwrap() {
            return Err(CoreError::PublishError("mock store unavailable".to_string()));
        }
        self.published.lock().unwrap().push(event.clone());
        // 発行済みイベントは以後の問い合わせにも現れる
        self.events.lock().unwrap().push(event.to_event());
        Ok(())
    }
}
