use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::types::{NostrEvent, KIND_BID, KIND_BID_CONFIRMATION};

/// 配送方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShippingOption {
    Local,
    International,
}

/// 入札の有効ステータス（売り手の確認で決まる）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
    Winner,
}

/// 入札の送信内容（kind 1021 のcontent）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BidSubmission {
    pub amount: u64,
    pub shipping_option: ShippingOption,
    pub buyer_country: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// 受信側は緩くデコードする。有効性はamountだけで決まる
#[derive(Debug, Clone, Deserialize)]
struct BidContent {
    #[serde(default)]
    amount: f64,
    #[serde(default)]
    shipping_option: Option<ShippingOption>,
    #[serde(default)]
    buyer_country: String,
    #[serde(default)]
    message: Option<String>,
}

/// 検証済み入札
///
/// 一度発行された入札は不変の履歴。置き換えは存在しない
#[derive(Debug, Clone, PartialEq)]
pub struct Bid {
    pub event_id: String,
    pub bidder: String,
    pub created_at: i64,
    pub listing_event_id: String,
    pub amount: u64,
    pub shipping_option: Option<ShippingOption>,
    pub buyer_country: String,
    pub message: Option<String>,
}

/// 入札イベントのデコード
///
/// amountが正の整数でなければ無効として破棄される
pub fn decode_bid(event: &NostrEvent) -> Result<Bid> {
    if event.kind != KIND_BID {
        return Err(CoreError::ParseError(format!("kind {} is not a bid", event.kind)));
    }
    let listing_event_id = event
        .tag_value("e")
        .ok_or_else(|| CoreError::ParseError("bid has no listing reference".to_string()))?
        .to_string();

    let content: BidContent = serde_json::from_str(&event.content)?;
    if !content.amount.is_finite() || content.amount <= 0.0 {
        return Err(CoreError::ParseError("bid amount must be positive".to_string()));
    }
    if content.amount.fract() != 0.0 || content.amount > u64::MAX as f64 {
        return Err(CoreError::ParseError("bid amount must be a whole number".to_string()));
    }

    Ok(Bid {
        event_id: event.id.clone(),
        bidder: event.pubkey.clone(),
        created_at: event.created_at,
        listing_event_id,
        amount: content.amount as u64,
        shipping_option: content.shipping_option,
        buyer_country: content.buyer_country,
        message: content.message,
    })
}

/// 出品を参照する有効な入札を順位付けして返す
///
/// 金額降順、同額は先着順。順位は表示上の優先で、権利は生まない
pub fn rank_bids(listing_event_ids: &HashSet<String>, events: &[NostrEvent]) -> Vec<Bid> {
    let mut bids: Vec<Bid> = events
        .iter()
        .filter_map(|event| match decode_bid(event) {
            Ok(bid) if listing_event_ids.contains(&bid.listing_event_id) => Some(bid),
            Ok(_) => None,
            Err(e) => {
                log::debug!("Dropping invalid bid {}: {}", event.id, e);
                None
            }
        })
        .collect();

    bids.sort_by(|a, b| {
        b.amount
            .cmp(&a.amount)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
    bids
}

/// 入札への確認（kind 1022）
#[derive(Debug, Clone, PartialEq)]
pub struct BidConfirmation {
    pub event_id: String,
    pub author: String,
    pub created_at: i64,
    pub bid_refs: Vec<String>,
    pub bidder: Option<String>,
    pub status: BidStatus,
    pub message: Option<String>,
    pub duration_extended: Option<i64>,
    pub total_cost: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConfirmationContent {
    status: BidStatus,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    duration_extended: Option<i64>,
    #[serde(default)]
    total_cost: Option<u64>,
}

pub fn decode_confirmation(event: &NostrEvent) -> Result<BidConfirmation> {
    if event.kind != KIND_BID_CONFIRMATION {
        return Err(CoreError::ParseError(format!(
            "kind {} is not a bid confirmation",
            event.kind
        )));
    }
    let content: ConfirmationContent = serde_json::from_str(&event.content)?;
    Ok(BidConfirmation {
        event_id: event.id.clone(),
        author: event.pubkey.clone(),
        created_at: event.created_at,
        bid_refs: event.tag_values("e").into_iter().map(|s| s.to_string()).collect(),
        bidder: event.tag_value("p").map(|s| s.to_string()),
        status: content.status,
        message: content.message,
        duration_extended: content.duration_extended,
        total_cost: content.total_cost,
    })
}

pub fn encode_confirmation(
    status: BidStatus,
    message: Option<&str>,
    duration_extended: Option<i64>,
    total_cost: Option<u64>,
) -> Result<String> {
    Ok(serde_json::to_string(&ConfirmationContent {
        status,
        message: message.map(|m| m.to_string()),
        duration_extended,
        total_cost,
    })?)
}

/// 入札の有効ステータスを導出
///
/// 売り手発でその入札を参照する確認のうち最新が勝つ。
/// 同時刻はイベントIDが小さい方。確認が無ければpending
pub fn effective_status<'a>(
    bid: &Bid,
    confirmations: &'a [BidConfirmation],
    seller: &str,
) -> (BidStatus, Option<&'a BidConfirmation>) {
    let latest = confirmations
        .iter()
        .filter(|c| c.author == seller && c.bid_refs.iter().any(|r| r == &bid.event_id))
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| b.event_id.cmp(&a.event_id))
        });

    match latest {
        Some(confirmation) => (confirmation.status, Some(confirmation)),
        None => (BidStatus::Pending, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bid_event(id: &str, bidder: &str, listing_id: &str, content: String, created_at: i64) -> NostrEvent {
        NostrEvent {
            id: id.to_string(),
            pubkey: bidder.to_string(),
            kind: KIND_BID,
            content,
            tags: vec![vec!["e".to_string(), listing_id.to_string()]],
            created_at,
            sig: String::new(),
        }
    }

    fn amount_content(amount: serde_json::Value) -> String {
        json!({
            "amount": amount,
            "shipping_option": "local",
            "buyer_country": "JP"
        })
        .to_string()
    }

    #[test]
    fn test_decode_bid() {
        let event = bid_event("b1", "alice", "ev1", amount_content(json!(1500)), 100);
        let bid = decode_bid(&event).unwrap();

        assert_eq!(bid.amount, 1500);
        assert_eq!(bid.listing_event_id, "ev1");
        assert_eq!(bid.shipping_option, Some(ShippingOption::Local));
        assert_eq!(bid.buyer_country, "JP");
    }

    #[test]
    fn test_decode_bid_rejects_invalid_amounts() {
        for bad in [json!(0), json!(-5), json!(10.5), json!("lots"), json!(null)] {
            let event = bid_event("b1", "alice", "ev1", amount_content(bad), 100);
            assert!(decode_bid(&event).is_err());
        }
    }

    #[test]
    fn test_decode_bid_requires_listing_reference() {
        let mut event = bid_event("b1", "alice", "ev1", amount_content(json!(100)), 100);
        event.tags.clear();
        assert!(decode_bid(&event).is_err());
    }

    #[test]
    fn test_rank_bids_by_amount_then_time() {
        let ids: HashSet<String> = ["ev1".to_string()].into_iter().collect();
        let events = vec![
            bid_event("b1", "alice", "ev1", amount_content(json!(100)), 10),
            bid_event("b2", "bob", "ev1", amount_content(json!(500)), 20),
            bid_event("b3", "carol", "ev1", amount_content(json!(300)), 30),
        ];

        let bids = rank_bids(&ids, &events);
        let amounts: Vec<u64> = bids.iter().map(|b| b.amount).collect();
        assert_eq!(amounts, vec![500, 300, 100]);
    }

    #[test]
    fn test_rank_bids_tie_goes_to_earlier_bidder() {
        let ids: HashSet<String> = ["ev1".to_string()].into_iter().collect();
        let events = vec![
            bid_event("b2", "bob", "ev1", amount_content(json!(500)), 20),
            bid_event("b1", "alice", "ev1", amount_content(json!(500)), 10),
        ];

        let bids = rank_bids(&ids, &events);
        assert_eq!(bids[0].bidder, "alice");
        assert_eq!(bids[1].bidder, "bob");
    }

    #[test]
    fn test_rank_bids_skips_foreign_and_invalid() {
        let ids: HashSet<String> = ["ev1".to_string()].into_iter().collect();
        let events = vec![
            bid_event("b1", "alice", "ev1", amount_content(json!(100)), 10),
            bid_event("b2", "bob", "other", amount_content(json!(500)), 20),
            bid_event("b3", "carol", "ev1", "junk".to_string(), 30),
        ];

        let bids = rank_bids(&ids, &events);
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].event_id, "b1");
    }

    fn confirmation_event(id: &str, author: &str, bid_id: &str, status: &str, created_at: i64) -> NostrEvent {
        NostrEvent {
            id: id.to_string(),
            pubkey: author.to_string(),
            kind: KIND_BID_CONFIRMATION,
            content: json!({ "status": status }).to_string(),
            tags: vec![
                vec!["e".to_string(), bid_id.to_string()],
                vec!["e".to_string(), "ev1".to_string()],
                vec!["p".to_string(), "alice".to_string()],
            ],
            created_at,
            sig: String::new(),
        }
    }

    #[test]
    fn test_effective_status_latest_wins() {
        let bid = decode_bid(&bid_event("b1", "alice", "ev1", amount_content(json!(100)), 10)).unwrap();
        let confirmations = vec![
            decode_confirmation(&confirmation_event("c1", "seller", "b1", "pending", 100)).unwrap(),
            decode_confirmation(&confirmation_event("c2", "seller", "b1", "accepted", 200)).unwrap(),
        ];

        let (status, confirmation) = effective_status(&bid, &confirmations, "seller");
        assert_eq!(status, BidStatus::Accepted);
        assert_eq!(confirmation.unwrap().event_id, "c2");
    }

    #[test]
    fn test_effective_status_ignores_non_seller() {
        let bid = decode_bid(&bid_event("b1", "alice", "ev1", amount_content(json!(100)), 10)).unwrap();
        let confirmations =
            vec![decode_confirmation(&confirmation_event("c1", "mallory", "b1", "winner", 100)).unwrap()];

        let (status, confirmation) = effective_status(&bid, &confirmations, "seller");
        assert_eq!(status, BidStatus::Pending);
        assert!(confirmation.is_none());
    }

    #[test]
    fn test_effective_status_defaults_to_pending() {
        let bid = decode_bid(&bid_event("b1", "alice", "ev1", amount_content(json!(100)), 10)).unwrap();
        let (status, _) = effective_status(&bid, &[], "seller");
        assert_eq!(status, BidStatus::Pending);
    }
}
