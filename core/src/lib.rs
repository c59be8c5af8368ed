pub mod types;
pub mod error;
pub mod store;
pub mod relay;
pub mod signer;
pub mod auction;
pub mod dm;
pub mod comment;
pub mod payment;
pub mod poller;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub use error::{CoreError, Result};

use crate::auction::{
    encode_confirmation, encode_status, reconcile, AuctionView, Bid, BidConfirmation, BidStatus,
    BidSubmission, LifecycleState, ListingDraft, ListingStatus, ShippingOption,
};
use crate::auction::bid::decode_confirmation;
use crate::comment::{build_comment_tree, count_reactions, CommentNode};
use crate::dm::{auction_participants, build_threads, DmPayload, Thread};
use crate::relay::RelayPool;
use crate::signer::{Identity, Signer, UnsignedEvent};
use crate::store::{EventStore, DEFAULT_QUERY_TIMEOUT_MS};
use crate::types::{
    now_unix, random_hex, CancelToken, Filter, NostrEvent, KIND_AUCTION, KIND_AUCTION_STATUS,
    KIND_BID, KIND_BID_CONFIRMATION, KIND_COMMENT, KIND_DM, KIND_REACTION,
};

/// 出品一覧問い合わせの上限
const LISTING_QUERY_LIMIT: u32 = 100;

/// MarketHandle: UIから使用されるメインAPI
///
/// 真実は毎回ストアから導出する。読みはquery→整合、
/// 書きは署名→発行の使い切りで、失敗は操作毎にそのまま返す
pub struct MarketHandle {
    store: Arc<dyn EventStore>,
    pool: Option<Arc<RelayPool>>,
    identity: Option<Identity>,
    query_timeout_ms: u32,
}

impl MarketHandle {
    /// Relay URLから初期化
    pub async fn init(relay_urls: Vec<String>) -> Result<Self> {
        let pool = Arc::new(RelayPool::new(relay_urls));
        pool.connect_all().await;
        Ok(Self {
            store: pool.clone(),
            pool: Some(pool),
            identity: None,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
        })
    }

    /// 任意のストア実装から初期化（テスト用）
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            pool: None,
            identity: None,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
        }
    }

    /// Signerを設定
    pub async fn set_signer(&mut self, signer: Arc<dyn Signer>) -> Result<()> {
        self.identity = Some(Identity::from_signer(signer).await?);
        Ok(())
    }

    pub fn set_identity(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }

    /// 現在のユーザー。Signer未設定は能力欠如エラー
    pub fn identity(&self) -> Result<&Identity> {
        self.identity
            .as_ref()
            .ok_or_else(|| CoreError::CapabilityMissing("no signer configured".to_string()))
    }

    pub fn pubkey(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.pubkey.as_str())
    }

    /// 定期処理（Relay再接続チェック）
    pub async fn tick(&self) {
        if let Some(pool) = &self.pool {
            pool.maintain().await;
        }
    }

    async fn query(&self, filters: &[Filter], cancel: &CancelToken) -> Result<Vec<NostrEvent>> {
        self.store.query(filters, self.query_timeout_ms, cancel).await
    }

    async fn sign_and_publish(
        &self,
        kind: u16,
        content: String,
        tags: Vec<Vec<String>>,
    ) -> Result<String> {
        let identity = self.identity()?;
        let unsigned = UnsignedEvent::new(kind, content, tags);
        let signed = identity.signer.sign_event(unsigned).await?;
        self.store.publish(&signed, self.query_timeout_ms).await?;
        Ok(signed.id)
    }

    /// 出品一覧を取得して整合ビューを導出
    pub async fn fetch_auctions(&self, cancel: &CancelToken) -> Result<Vec<AuctionView>> {
        let filter = Filter {
            kinds: Some(vec![KIND_AUCTION]),
            limit: Some(LISTING_QUERY_LIMIT),
            ..Default::default()
        };
        let listing_events = self.query(&[filter], cancel).await?;
        self.reconcile_listings(listing_events, cancel).await
    }

    /// 安定IDで1オークションを取得
    ///
    /// 同じIDを複数の売り手が使っていた場合は最新の出品を採る
    pub async fn fetch_auction(
        &self,
        auction_id: &str,
        cancel: &CancelToken,
    ) -> Result<Option<AuctionView>> {
        let filter = Filter {
            kinds: Some(vec![KIND_AUCTION]),
            d_tags: Some(vec![auction_id.to_string()]),
            ..Default::default()
        };
        let listing_events = self.query(&[filter], cancel).await?;
        let views = self.reconcile_listings(listing_events, cancel).await?;
        Ok(views.into_iter().next())
    }

    /// 出品イベント群に関連イベントを重ねて整合
    async fn reconcile_listings(
        &self,
        listing_events: Vec<NostrEvent>,
        cancel: &CancelToken,
    ) -> Result<Vec<AuctionView>> {
        if listing_events.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = listing_events.iter().map(|e| e.id.clone()).collect();
        let related = self
            .query(
                &[Filter {
                    kinds: Some(vec![KIND_BID, KIND_BID_CONFIRMATION, KIND_AUCTION_STATUS]),
                    e_tags: Some(ids),
                    ..Default::default()
                }],
                cancel,
            )
            .await?;

        let mut bid_events = Vec::new();
        let mut confirmation_events = Vec::new();
        let mut status_events = Vec::new();
        for event in related {
            match event.kind {
                KIND_BID => bid_events.push(event),
                KIND_BID_CONFIRMATION => confirmation_events.push(event),
                KIND_AUCTION_STATUS => status_events.push(event),
                _ => {}
            }
        }

        Ok(reconcile(
            &listing_events,
            &bid_events,
            &confirmation_events,
            &status_events,
            now_unix(),
        ))
    }

    /// 出品を発行。同じ安定IDでの再発行が既存を置き換える
    pub async fn publish_listing(&self, draft: &ListingDraft) -> Result<String> {
        self.identity()?;
        draft.validate()?;

        let auction_id = match &draft.auction_id {
            Some(id) => id.clone(),
            None => random_hex(16)?,
        };
        let content = draft.content_json(&auction_id)?;
        let tags = vec![vec!["d".to_string(), auction_id.clone()]];
        self.sign_and_publish(KIND_AUCTION, content, tags).await?;
        Ok(auction_id)
    }

    /// 入札を発行
    ///
    /// 発行前にドメイン検証し、理由つきで弾く
    pub async fn place_bid(&self, view: &AuctionView, submission: &BidSubmission) -> Result<String> {
        self.identity()?;

        if submission.amount == 0 {
            return Err(CoreError::Validation("bid amount must be positive".to_string()));
        }
        match view.lifecycle {
            LifecycleState::Active | LifecycleState::Extended => {}
            LifecycleState::Scheduled => {
                return Err(CoreError::Validation("auction has not started yet".to_string()));
            }
            _ => return Err(CoreError::Validation("auction has ended".to_string())),
        }
        if submission.amount <= view.current_price {
            return Err(CoreError::Validation(format!(
                "bid must be above the current price of {}",
                view.current_price
            )));
        }
        if submission.shipping_option == ShippingOption::Local {
            let countries = &view.listing.shipping.local.countries;
            if !countries.is_empty() && !countries.iter().any(|c| c == &submission.buyer_country) {
                return Err(CoreError::Validation(format!(
                    "local shipping is not available in {}",
                    submission.buyer_country
                )));
            }
        }

        let content = serde_json::to_string(submission)?;
        let tags = vec![vec!["e".to_string(), view.listing.event_id.clone()]];
        self.sign_and_publish(KIND_BID, content, tags).await
    }

    /// 入札への確認を発行（売り手のみ）
    pub async fn confirm_bid(
        &self,
        view: &AuctionView,
        bid: &Bid,
        status: BidStatus,
        message: Option<&str>,
        duration_extended: Option<i64>,
        total_cost: Option<u64>,
    ) -> Result<String> {
        let identity = self.identity()?;
        if identity.pubkey != view.listing.seller {
            return Err(CoreError::Validation("only the seller can confirm bids".to_string()));
        }

        let content = encode_confirmation(status, message, duration_extended, total_cost)?;
        let tags = vec![
            vec!["e".to_string(), bid.event_id.clone()],
            vec!["e".to_string(), view.listing.event_id.clone()],
            vec!["p".to_string(), bid.bidder.clone()],
        ];
        self.sign_and_publish(KIND_BID_CONFIRMATION, content, tags).await
    }

    /// 終了ステータスを発行（売り手のみ）
    pub async fn update_status(
        &self,
        view: &AuctionView,
        status: ListingStatus,
        message: Option<&str>,
    ) -> Result<String> {
        let identity = self.identity()?;
        if identity.pubkey != view.listing.seller {
            return Err(CoreError::Validation(
                "only the seller can update the auction status".to_string(),
            ));
        }

        let content = encode_status(status, message)?;
        let tags = vec![vec!["e".to_string(), view.listing.event_id.clone()]];
        self.sign_and_publish(KIND_AUCTION_STATUS, content, tags).await
    }

    /// NIP-04 DM送信
    pub async fn send_dm(&self, peer: &str, payload: &DmPayload) -> Result<String> {
        let identity = self.identity()?;
        let plaintext = serde_json::to_string(payload)?;
        let encrypted = identity.signer.nip04_encrypt(peer, &plaintext).await?;
        let tags = vec![vec!["p".to_string(), peer.to_string()]];
        self.sign_and_publish(KIND_DM, encrypted, tags).await
    }

    /// 会話スレッド一覧
    ///
    /// scope指定時はそのオークションの参加者に限定し、
    /// 売り手ビューには入札確認をシステムメッセージとして混ぜる
    pub async fn fetch_threads(
        &self,
        scope: Option<&AuctionView>,
        last_seen: &HashMap<String, i64>,
        cancel: &CancelToken,
    ) -> Result<Vec<Thread>> {
        let identity = self.identity()?;
        let me = identity.pubkey.clone();

        let filters = [
            Filter {
                kinds: Some(vec![KIND_DM]),
                authors: Some(vec![me.clone()]),
                ..Default::default()
            },
            Filter {
                kinds: Some(vec![KIND_DM]),
                p_tags: Some(vec![me.clone()]),
                ..Default::default()
            },
        ];
        let dm_events = self.query(&filters, cancel).await?;

        let view = match scope {
            Some(view) => view,
            None => return Ok(build_threads(identity, &dm_events, &[], None, last_seen).await),
        };

        let conf_events = self
            .query(
                &[Filter {
                    kinds: Some(vec![KIND_BID_CONFIRMATION]),
                    e_tags: Some(vec![view.listing.event_id.clone()]),
                    ..Default::default()
                }],
                cancel,
            )
            .await?;
        let confirmations: Vec<BidConfirmation> = conf_events
            .iter()
            .filter_map(|event| match decode_confirmation(event) {
                Ok(confirmation) => Some(confirmation),
                Err(e) => {
                    log::debug!("Dropping malformed confirmation {}: {}", event.id, e);
                    None
                }
            })
            .filter(|c| c.author == view.listing.seller)
            .collect();

        let participants: HashSet<String> =
            auction_participants(&me, view, &confirmations).into_iter().collect();
        let injected = if view.listing.seller == me {
            confirmations
        } else {
            Vec::new()
        };

        let mut threads = build_threads(
            identity,
            &dm_events,
            &injected,
            Some(view.listing.auction_id.as_str()),
            last_seen,
        )
        .await;
        threads.retain(|t| participants.contains(&t.peer));
        Ok(threads)
    }

    /// コメント木を取得
    pub async fn fetch_comments(
        &self,
        view: &AuctionView,
        cancel: &CancelToken,
    ) -> Result<Vec<CommentNode>> {
        let events = self
            .query(
                &[Filter {
                    kinds: Some(vec![KIND_COMMENT]),
                    e_tags: Some(vec![view.listing.event_id.clone()]),
                    ..Default::default()
                }],
                cancel,
            )
            .await?;
        Ok(build_comment_tree(&events, &view.listing.event_id))
    }

    /// コメントを投稿
    pub async fn publish_comment(
        &self,
        view: &AuctionView,
        content: &str,
        parent: Option<&str>,
    ) -> Result<String> {
        self.identity()?;
        if content.trim().is_empty() {
            return Err(CoreError::Validation("comment cannot be empty".to_string()));
        }

        let mut tags = vec![
            vec![
                "e".to_string(),
                view.listing.event_id.clone(),
                String::new(),
                "root".to_string(),
            ],
            vec!["p".to_string(), view.listing.seller.clone()],
        ];
        if let Some(parent) = parent {
            tags.push(vec![
                "e".to_string(),
                parent.to_string(),
                String::new(),
                "reply".to_string(),
            ]);
        }
        self.sign_and_publish(KIND_COMMENT, content.to_string(), tags).await
    }

    /// リアクションを発行
    pub async fn publish_reaction(&self, view: &AuctionView) -> Result<String> {
        self.identity()?;
        let tags = vec![
            vec!["e".to_string(), view.listing.event_id.clone()],
            vec!["p".to_string(), view.listing.seller.clone()],
        ];
        self.sign_and_publish(KIND_REACTION, "+".to_string(), tags).await
    }

    /// リアクション数を取得
    pub async fn fetch_reaction_count(
        &self,
        view: &AuctionView,
        cancel: &CancelToken,
    ) -> Result<usize> {
        let events = self
            .query(
                &[Filter {
                    kinds: Some(vec![KIND_REACTION]),
                    e_tags: Some(vec![view.listing.event_id.clone()]),
                    ..Default::default()
                }],
                cancel,
            )
            .await?;
        Ok(count_reactions(&events, &view.listing.event_id))
    }
}
