use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::auction::{AuctionView, BidConfirmation};
use crate::error::Result;
use crate::signer::{Identity, Signer};
use crate::types::{now_unix, random_hex, NostrEvent, KIND_DM};

/// DMメッセージ種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    PaymentRequest,
    OrderUpdate,
    BidInquiry,
    ShippingUpdate,
    General,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::PaymentRequest => 1,
            MessageType::OrderUpdate => 2,
            MessageType::BidInquiry => 3,
            MessageType::ShippingUpdate => 4,
            MessageType::General => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MessageType::PaymentRequest),
            2 => Some(MessageType::OrderUpdate),
            3 => Some(MessageType::BidInquiry),
            4 => Some(MessageType::ShippingUpdate),
            5 => Some(MessageType::General),
            _ => None,
        }
    }
}

/// 支払いオプション
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentOption {
    #[serde(rename = "type")]
    pub kind: String,
    pub link: String,
}

/// 復号後のDMペイロード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmPayload {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: u8,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub auction_id: Option<String>,
    #[serde(default)]
    pub auction_title: Option<String>,
    #[serde(default)]
    pub bid_amount: Option<u64>,
    #[serde(default)]
    pub payment_options: Option<Vec<PaymentOption>>,
    #[serde(default)]
    pub paid: Option<bool>,
    #[serde(default)]
    pub shipped: Option<bool>,
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub created_at: i64,
}

impl DmPayload {
    pub fn new(message_type: MessageType, message: &str) -> Result<Self> {
        Ok(Self {
            id: random_hex(16)?,
            message_type: message_type.code(),
            message: message.to_string(),
            auction_id: None,
            auction_title: None,
            bid_amount: None,
            payment_options: None,
            paid: None,
            shipped: None,
            tracking_number: None,
            created_at: now_unix(),
        })
    }

    pub fn for_auction(mut self, view: &AuctionView) -> Self {
        self.auction_id = Some(view.listing.auction_id.clone());
        self.auction_title = Some(view.listing.title.clone());
        self
    }
}

/// スレッド内の1メッセージ
///
/// 売り手の入札確認は合成のシステムメッセージとして混ざる
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadContent {
    Chat(DmPayload),
    Confirmation(BidConfirmation),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadMessage {
    pub event_id: String,
    pub from_me: bool,
    pub created_at: i64,
    pub content: ThreadContent,
}

/// 相手毎の会話スレッド
#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    pub peer: String,
    pub messages: Vec<ThreadMessage>,
    pub last_incoming_at: i64,
    pub unread_count: u32,
}

/// 対象オークションの会話相手を列挙
///
/// 自分が売り手なら入札者全員、そうでなければ売り手だけ
pub fn auction_participants(
    self_pubkey: &str,
    view: &AuctionView,
    confirmations: &[BidConfirmation],
) -> Vec<String> {
    if view.listing.seller != self_pubkey {
        return vec![view.listing.seller.clone()];
    }

    let mut seen = HashSet::new();
    let mut participants = Vec::new();
    for ranked in &view.ranked_bids {
        if seen.insert(ranked.bid.bidder.clone()) {
            participants.push(ranked.bid.bidder.clone());
        }
    }
    for confirmation in confirmations {
        if confirmation.author != view.listing.seller {
            continue;
        }
        if let Some(bidder) = &confirmation.bidder {
            if seen.insert(bidder.clone()) {
                participants.push(bidder.clone());
            }
        }
    }
    participants
}

/// 暗号化DM群からスレッド一覧を組み立てる
///
/// 復号や構文の失敗はそのイベントだけを除外し、バッチは止めない。
/// scope指定時は復号後のauction_idで絞り込む
pub async fn build_threads(
    identity: &Identity,
    dm_events: &[NostrEvent],
    confirmations: &[BidConfirmation],
    scope: Option<&str>,
    last_seen: &HashMap<String, i64>,
) -> Vec<Thread> {
    let mut by_peer: HashMap<String, Vec<ThreadMessage>> = HashMap::new();

    for event in dm_events {
        if event.kind != KIND_DM {
            continue;
        }
        let from_me = event.pubkey == identity.pubkey;
        let peer = if from_me {
            match event.tag_value("p") {
                Some(peer) => peer.to_string(),
                None => continue,
            }
        } else {
            // 自分宛てでなければ対象外
            if event.tag_value("p") != Some(identity.pubkey.as_str()) {
                continue;
            }
            event.pubkey.clone()
        };

        let plaintext = match identity.signer.nip04_decrypt(&peer, &event.content).await {
            Ok(plaintext) => plaintext,
            Err(e) => {
                log::debug!("Skipping undecryptable DM {}: {}", event.id, e);
                continue;
            }
        };
        let payload: DmPayload = match serde_json::from_str(&plaintext) {
            Ok(payload) => payload,
            Err(e) => {
                log::debug!("Skipping malformed DM payload {}: {}", event.id, e);
                continue;
            }
        };
        if let Some(scope) = scope {
            if payload.auction_id.as_deref() != Some(scope) {
                continue;
            }
        }

        by_peer.entry(peer).or_default().push(ThreadMessage {
            event_id: event.id.clone(),
            from_me,
            created_at: event.created_at,
            content: ThreadContent::Chat(payload),
        });
    }

    for confirmation in confirmations {
        let bidder = match &confirmation.bidder {
            Some(bidder) => bidder,
            None => continue,
        };
        let from_me = confirmation.author == identity.pubkey;
        let peer = if from_me { bidder.clone() } else { confirmation.author.clone() };
        by_peer.entry(peer).or_default().push(ThreadMessage {
            event_id: confirmation.event_id.clone(),
            from_me,
            created_at: confirmation.created_at,
            content: ThreadContent::Confirmation(confirmation.clone()),
        });
    }

    let mut threads: Vec<Thread> = by_peer
        .into_iter()
        .map(|(peer, mut messages)| {
            messages.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.event_id.cmp(&b.event_id))
            });
            let seen = last_seen.get(&peer).copied().unwrap_or(0);
            let last_incoming_at = messages
                .iter()
                .filter(|m| !m.from_me)
                .map(|m| m.created_at)
                .max()
                .unwrap_or(0);
            let unread_count = messages
                .iter()
                .filter(|m| !m.from_me && m.created_at > seen)
                .count() as u32;
            Thread {
                peer,
                messages,
                last_incoming_at,
                unread_count,
            }
        })
        .collect();

    // 新着のあるスレッドを上に
    threads.sort_by(|a, b| {
        b.last_incoming_at
            .cmp(&a.last_incoming_at)
            .then_with(|| a.peer.cmp(&b.peer))
    });
    threads
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::signer::internal::InternalSigner;
    use serde_json::json;

    async fn identity(signer: InternalSigner) -> (Identity, String) {
        let identity = Identity::from_signer(Arc::new(signer)).await.unwrap();
        let pubkey = identity.pubkey.clone();
        (identity, pubkey)
    }

    async fn dm_event(
        id: &str,
        sender: &Identity,
        recipient_pubkey: &str,
        payload: serde_json::Value,
        created_at: i64,
    ) -> NostrEvent {
        let content = sender
            .signer
            .nip04_encrypt(recipient_pubkey, &payload.to_string())
            .await
            .unwrap();
        NostrEvent {
            id: id.to_string(),
            pubkey: sender.pubkey.clone(),
            kind: KIND_DM,
            content,
            tags: vec![vec!["p".to_string(), recipient_pubkey.to_string()]],
            created_at,
            sig: String::new(),
        }
    }

    fn payload(message: &str, auction_id: Option<&str>) -> serde_json::Value {
        json!({
            "id": "m1",
            "type": 5,
            "message": message,
            "auction_id": auction_id,
            "created_at": 0
        })
    }

    #[tokio::test]
    async fn test_threads_group_by_peer_and_sort() {
        let (alice, _) = identity(InternalSigner::generate()).await;
        let (bob, bob_pub) = identity(InternalSigner::generate()).await;
        let (carol, _) = identity(InternalSigner::generate()).await;

        let events = vec![
            dm_event("e1", &bob, &alice.pubkey, payload("hi from bob", None), 100).await,
            dm_event("e2", &alice, &bob_pub, payload("hi bob", None), 150).await,
            dm_event("e3", &carol, &alice.pubkey, payload("hi from carol", None), 200).await,
        ];

        let threads = build_threads(&alice, &events, &[], None, &HashMap::new()).await;
        assert_eq!(threads.len(), 2);
        // 最新の受信があるcarolのスレッドが先
        assert_eq!(threads[0].peer, carol.pubkey);
        assert_eq!(threads[1].peer, bob.pubkey);

        let bob_thread = &threads[1];
        assert_eq!(bob_thread.messages.len(), 2);
        assert!(!bob_thread.messages[0].from_me);
        assert!(bob_thread.messages[1].from_me);
        assert_eq!(bob_thread.last_incoming_at, 100);
    }

    #[tokio::test]
    async fn test_undecryptable_event_is_isolated() {
        let (alice, _) = identity(InternalSigner::generate()).await;
        let (bob, _) = identity(InternalSigner::generate()).await;

        let mut events = Vec::new();
        for i in 0..4 {
            events.push(
                dm_event(
                    &format!("e{}", i),
                    &bob,
                    &alice.pubkey,
                    payload(&format!("message {}", i), None),
                    100 + i,
                )
                .await,
            );
        }
        // 復号できないイベントはそれだけが除外される
        let mut broken = dm_event("e4", &bob, &alice.pubkey, payload("never seen", None), 104).await;
        broken.content = "ZGVhZGJlZWY=?iv=AAAA".to_string();
        events.push(broken);

        let threads = build_threads(&alice, &events, &[], None, &HashMap::new()).await;
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].messages.len(), 4);
    }

    #[tokio::test]
    async fn test_scope_filters_by_auction_id() {
        let (alice, _) = identity(InternalSigner::generate()).await;
        let (bob, _) = identity(InternalSigner::generate()).await;

        let events = vec![
            dm_event("e1", &bob, &alice.pubkey, payload("about a1", Some("a1")), 100).await,
            dm_event("e2", &bob, &alice.pubkey, payload("about a2", Some("a2")), 110).await,
            dm_event("e3", &bob, &alice.pubkey, payload("no auction", None), 120).await,
        ];

        let threads = build_threads(&alice, &events, &[], Some("a1"), &HashMap::new()).await;
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].messages.len(), 1);
        match &threads[0].messages[0].content {
            ThreadContent::Chat(payload) => assert_eq!(payload.message, "about a1"),
            _ => panic!("Expected chat message"),
        }
    }

    #[tokio::test]
    async fn test_confirmations_injected_in_order() {
        let (seller, _) = identity(InternalSigner::generate()).await;
        let (buyer, buyer_pub) = identity(InternalSigner::generate()).await;

        let events = vec![
            dm_event("e1", &buyer, &seller.pubkey, payload("interested", None), 100).await,
            dm_event("e2", &buyer, &seller.pubkey, payload("thanks!", None), 300).await,
        ];
        let confirmations = vec![BidConfirmation {
            event_id: "c1".to_string(),
            author: seller.pubkey.clone(),
            created_at: 200,
            bid_refs: vec!["b1".to_string()],
            bidder: Some(buyer_pub.clone()),
            status: crate::auction::BidStatus::Accepted,
            message: None,
            duration_extended: None,
            total_cost: None,
        }];

        let threads = build_threads(&seller, &events, &confirmations, None, &HashMap::new()).await;
        assert_eq!(threads.len(), 1);
        let messages = &threads[0].messages;
        assert_eq!(messages.len(), 3);
        // created_at順に混ざる
        assert!(matches!(messages[0].content, ThreadContent::Chat(_)));
        assert!(matches!(messages[1].content, ThreadContent::Confirmation(_)));
        assert!(matches!(messages[2].content, ThreadContent::Chat(_)));
        assert!(messages[1].from_me);
    }

    #[tokio::test]
    async fn test_unread_counts_incoming_after_last_seen() {
        let (alice, _) = identity(InternalSigner::generate()).await;
        let (bob, bob_pub) = identity(InternalSigner::generate()).await;

        let events = vec![
            dm_event("e1", &bob, &alice.pubkey, payload("old", None), 100).await,
            dm_event("e2", &bob, &alice.pubkey, payload("new", None), 200).await,
            dm_event("e3", &alice, &bob_pub, payload("mine", None), 300).await,
        ];

        let mut last_seen = HashMap::new();
        last_seen.insert(bob.pubkey.clone(), 150i64);

        let threads = build_threads(&alice, &events, &[], None, &last_seen).await;
        assert_eq!(threads[0].unread_count, 1);

        let fresh = build_threads(&alice, &events, &[], None, &HashMap::new()).await;
        assert_eq!(fresh[0].unread_count, 2);
    }

    #[test]
    fn test_message_type_codes() {
        assert_eq!(MessageType::PaymentRequest.code(), 1);
        assert_eq!(MessageType::from_code(5), Some(MessageType::General));
        assert_eq!(MessageType::from_code(9), None);
    }
}
