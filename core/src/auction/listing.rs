use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::types::{NostrEvent, KIND_AUCTION, KIND_AUCTION_STATUS};

/// 地域配送（送料 + 対応国コード）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShippingZone {
    pub cost: u64,
    #[serde(default)]
    pub countries: Vec<String>,
}

/// 配送ルール
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShippingRules {
    pub local: ShippingZone,
    pub international: ShippingZone,
}

/// 作家情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtistProfile {
    pub name: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub website: Option<String>,
}

/// 出品コンテンツ（kind 30020 のcontent）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ListingContent {
    #[serde(default)]
    id: String,
    #[serde(default)]
    stall_id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    starting_bid: u64,
    #[serde(default)]
    reserve_price: Option<u64>,
    #[serde(default)]
    start_date: i64,
    #[serde(default)]
    duration: i64,
    #[serde(default)]
    auto_extend: bool,
    #[serde(default)]
    extension_time: i64,
    shipping: ShippingRules,
    #[serde(default)]
    artist: Option<ArtistProfile>,
}

/// 検証済みの出品
///
/// auction_idはイベントIDとは別の安定ID。
/// 同じ(auction_id, seller)での再発行が既存を置き換える
#[derive(Debug, Clone, PartialEq)]
pub struct AuctionListing {
    pub auction_id: String,
    pub event_id: String,
    pub seller: String,
    pub created_at: i64,
    pub stall_id: String,
    pub title: String,
    pub description: String,
    pub images: Vec<String>,
    pub starting_bid: u64,
    pub reserve_price: Option<u64>,
    pub start_date: i64,
    pub duration: i64,
    pub auto_extend: bool,
    pub extension_time: i64,
    pub shipping: ShippingRules,
    pub artist: Option<ArtistProfile>,
}

/// 出品イベントのデコード
///
/// 失敗は呼び出し側で該当イベントの破棄として扱う
pub fn decode_listing(event: &NostrEvent) -> Result<AuctionListing> {
    if event.kind != KIND_AUCTION {
        return Err(CoreError::ParseError(format!(
            "kind {} is not an auction listing",
            event.kind
        )));
    }

    let content: ListingContent = serde_json::from_str(&event.content)?;

    let auction_id = if !content.id.is_empty() {
        content.id.clone()
    } else {
        event.tag_value("d").unwrap_or("").to_string()
    };
    if auction_id.is_empty() {
        return Err(CoreError::ParseError("listing has no stable id".to_string()));
    }
    if content.title.trim().is_empty() {
        return Err(CoreError::ParseError("listing has no title".to_string()));
    }
    if content.images.is_empty() {
        return Err(CoreError::ParseError("listing has no images".to_string()));
    }
    if content.starting_bid == 0 {
        return Err(CoreError::ParseError("starting bid must be positive".to_string()));
    }
    if content.start_date <= 0 {
        return Err(CoreError::ParseError("listing has no start date".to_string()));
    }
    if content.duration <= 0 {
        return Err(CoreError::ParseError("listing has no duration".to_string()));
    }

    Ok(AuctionListing {
        auction_id,
        event_id: event.id.clone(),
        seller: event.pubkey.clone(),
        created_at: event.created_at,
        stall_id: content.stall_id,
        title: content.title,
        description: content.description,
        images: content.images,
        starting_bid: content.starting_bid,
        reserve_price: content.reserve_price,
        start_date: content.start_date,
        duration: content.duration,
        auto_extend: content.auto_extend,
        extension_time: content.extension_time,
        shipping: content.shipping,
        artist: content.artist,
    })
}

/// (auction_id, seller) 毎に最新の出品だけを残す
///
/// 不正なイベントは破棄するだけでバッチ全体は失敗させない
pub fn select_authoritative(events: &[NostrEvent]) -> Vec<AuctionListing> {
    let mut best: HashMap<(String, String), AuctionListing> = HashMap::new();

    for event in events {
        let listing = match decode_listing(event) {
            Ok(listing) => listing,
            Err(e) => {
                log::debug!("Dropping malformed listing {}: {}", event.id, e);
                continue;
            }
        };
        let key = (listing.auction_id.clone(), listing.seller.clone());
        match best.get(&key) {
            Some(current) if !supersedes(&listing, current) => {}
            _ => {
                best.insert(key, listing);
            }
        }
    }

    let mut listings: Vec<AuctionListing> = best.into_values().collect();
    listings.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.auction_id.cmp(&b.auction_id))
    });
    listings
}

/// 後発（同時刻ならイベントIDが小さい方）が優先
fn supersedes(candidate: &AuctionListing, current: &AuctionListing) -> bool {
    candidate.created_at > current.created_at
        || (candidate.created_at == current.created_at && candidate.event_id < current.event_id)
}

/// 同一オークションの全出品イベントID（置き換え前の版も含む）
///
/// 入札やステータス更新は発行時点のイベントIDを参照するため、
/// 置き換え後も旧IDへの参照を拾う必要がある
pub fn auction_event_ids(events: &[NostrEvent], auction_id: &str, seller: &str) -> HashSet<String> {
    events
        .iter()
        .filter(|e| e.kind == KIND_AUCTION && e.pubkey == seller)
        .filter(|e| stable_id_of(e).as_deref() == Some(auction_id))
        .map(|e| e.id.clone())
        .collect()
}

fn stable_id_of(event: &NostrEvent) -> Option<String> {
    let from_content = serde_json::from_str::<serde_json::Value>(&event.content)
        .ok()
        .and_then(|v| v.get("id").and_then(|i| i.as_str()).map(|s| s.to_string()))
        .filter(|s| !s.is_empty());
    from_content.or_else(|| {
        event
            .tag_value("d")
            .filter(|d| !d.is_empty())
            .map(|d| d.to_string())
    })
}

/// 売り手による明示的な終了ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Completed,
    Cancelled,
}

/// ステータス更新（kind 1023）
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub event_id: String,
    pub author: String,
    pub created_at: i64,
    pub status: ListingStatus,
    pub message: Option<String>,
    pub listing_refs: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusContent {
    status: ListingStatus,
    #[serde(default)]
    message: Option<String>,
}

pub fn decode_status_update(event: &NostrEvent) -> Result<StatusUpdate> {
    if event.kind != KIND_AUCTION_STATUS {
        return Err(CoreError::ParseError(format!(
            "kind {} is not a status update",
            event.kind
        )));
    }
    let content: StatusContent = serde_json::from_str(&event.content)?;
    Ok(StatusUpdate {
        event_id: event.id.clone(),
        author: event.pubkey.clone(),
        created_at: event.created_at,
        status: content.status,
        message: content.message,
        listing_refs: event.tag_values("e").into_iter().map(|s| s.to_string()).collect(),
    })
}

pub fn encode_status(status: ListingStatus, message: Option<&str>) -> Result<String> {
    Ok(serde_json::to_string(&StatusContent {
        status,
        message: message.map(|m| m.to_string()),
    })?)
}

/// 出品の下書き（発行前の入力）
#[derive(Debug, Clone, Default)]
pub struct ListingDraft {
    pub auction_id: Option<String>,
    pub stall_id: String,
    pub title: String,
    pub description: String,
    pub images: Vec<String>,
    pub starting_bid: u64,
    pub reserve_price: Option<u64>,
    pub start_date: i64,
    pub duration: i64,
    pub auto_extend: bool,
    pub extension_time: i64,
    pub shipping: ShippingRules,
    pub artist: Option<ArtistProfile>,
}

impl ListingDraft {
    /// 発行前の検証。理由は利用者向けメッセージ
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(CoreError::Validation("title is required".to_string()));
        }
        if self.images.is_empty() {
            return Err(CoreError::Validation("at least one image is required".to_string()));
        }
        if self.starting_bid == 0 {
            return Err(CoreError::Validation("starting bid must be positive".to_string()));
        }
        if self.start_date <= 0 {
            return Err(CoreError::Validation("start date is required".to_string()));
        }
        if self.duration <= 0 {
            return Err(CoreError::Validation("duration must be positive".to_string()));
        }
        Ok(())
    }

    pub fn content_json(&self, auction_id: &str) -> Result<String> {
        Ok(serde_json::to_string(&ListingContent {
            id: auction_id.to_string(),
            stall_id: self.stall_id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            images: self.images.clone(),
            starting_bid: self.starting_bid,
            reserve_price: self.reserve_price,
            start_date: self.start_date,
            duration: self.duration,
            auto_extend: self.auto_extend,
            extension_time: self.extension_time,
            shipping: self.shipping.clone(),
            artist: self.artist.clone(),
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_content(auction_id: &str, title: &str) -> String {
        json!({
            "id": auction_id,
            "stall_id": "stall1",
            "title": title,
            "description": "oil on canvas",
            "images": ["https://example.com/a.png"],
            "starting_bid": 1000,
            "start_date": 1000,
            "duration": 3600,
            "auto_extend": false,
            "extension_time": 0,
            "shipping": {
                "local": { "cost": 500, "countries": ["JP"] },
                "international": { "cost": 2500 }
            },
            "artist": { "name": "A. Painter", "bio": "painter" }
        })
        .to_string()
    }

    fn listing_event(id: &str, seller: &str, created_at: i64, content: String) -> NostrEvent {
        NostrEvent {
            id: id.to_string(),
            pubkey: seller.to_string(),
            kind: KIND_AUCTION,
            content,
            tags: vec![],
            created_at,
            sig: String::new(),
        }
    }

    #[test]
    fn test_decode_listing() {
        let event = listing_event("ev1", "seller", 100, valid_content("a1", "Sunset"));
        let listing = decode_listing(&event).unwrap();

        assert_eq!(listing.auction_id, "a1");
        assert_eq!(listing.event_id, "ev1");
        assert_eq!(listing.title, "Sunset");
        assert_eq!(listing.starting_bid, 1000);
        assert_eq!(listing.shipping.local.cost, 500);
        assert_eq!(listing.shipping.local.countries, vec!["JP"]);
        assert_eq!(listing.artist.as_ref().unwrap().name, "A. Painter");
    }

    #[test]
    fn test_decode_listing_falls_back_to_d_tag() {
        let content = json!({
            "title": "Sunset",
            "images": ["https://example.com/a.png"],
            "starting_bid": 1000,
            "start_date": 1000,
            "duration": 3600,
            "shipping": { "local": { "cost": 0 }, "international": { "cost": 0 } }
        })
        .to_string();
        let mut event = listing_event("ev1", "seller", 100, content);
        event.tags = vec![vec!["d".to_string(), "from-tag".to_string()]];

        let listing = decode_listing(&event).unwrap();
        assert_eq!(listing.auction_id, "from-tag");
    }

    #[test]
    fn test_decode_listing_rejects_invalid() {
        let garbage = listing_event("ev1", "seller", 100, "not json".to_string());
        assert!(decode_listing(&garbage).is_err());

        let mut no_title = serde_json::from_str::<serde_json::Value>(&valid_content("a1", "t")).unwrap();
        no_title["title"] = json!("");
        assert!(decode_listing(&listing_event("ev2", "seller", 100, no_title.to_string())).is_err());

        let mut no_images = serde_json::from_str::<serde_json::Value>(&valid_content("a1", "t")).unwrap();
        no_images["images"] = json!([]);
        assert!(decode_listing(&listing_event("ev3", "seller", 100, no_images.to_string())).is_err());

        let mut zero_bid = serde_json::from_str::<serde_json::Value>(&valid_content("a1", "t")).unwrap();
        zero_bid["starting_bid"] = json!(0);
        assert!(decode_listing(&listing_event("ev4", "seller", 100, zero_bid.to_string())).is_err());

        let mut no_shipping = serde_json::from_str::<serde_json::Value>(&valid_content("a1", "t")).unwrap();
        no_shipping.as_object_mut().unwrap().remove("shipping");
        assert!(decode_listing(&listing_event("ev5", "seller", 100, no_shipping.to_string())).is_err());
    }

    #[test]
    fn test_select_authoritative_last_write_wins() {
        let events = vec![
            listing_event("ev1", "seller", 100, valid_content("a1", "First")),
            listing_event("ev2", "seller", 200, valid_content("a1", "Second")),
            listing_event("ev3", "seller", 150, valid_content("a1", "Middle")),
        ];

        let listings = select_authoritative(&events);
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].title, "Second");
        assert_eq!(listings[0].event_id, "ev2");
    }

    #[test]
    fn test_select_authoritative_distinct_sellers() {
        let events = vec![
            listing_event("ev1", "alice", 100, valid_content("a1", "Alice's")),
            listing_event("ev2", "bob", 200, valid_content("a1", "Bob's")),
        ];

        let listings = select_authoritative(&events);
        assert_eq!(listings.len(), 2);
    }

    #[test]
    fn test_select_authoritative_drops_malformed() {
        let events = vec![
            listing_event("ev1", "seller", 100, valid_content("a1", "Good")),
            listing_event("ev2", "seller", 200, "{broken".to_string()),
        ];

        let listings = select_authoritative(&events);
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].title, "Good");
    }

    #[test]
    fn test_auction_event_ids_covers_superseded_versions() {
        let events = vec![
            listing_event("ev1", "seller", 100, valid_content("a1", "First")),
            listing_event("ev2", "seller", 200, valid_content("a1", "Second")),
            listing_event("ev3", "seller", 200, valid_content("other", "Other")),
            listing_event("ev4", "mallory", 200, valid_content("a1", "Fake")),
        ];

        let ids = auction_event_ids(&events, "a1", "seller");
        assert!(ids.contains("ev1"));
        assert!(ids.contains("ev2"));
        assert!(!ids.contains("ev3"));
        assert!(!ids.contains("ev4"));
    }

    #[test]
    fn test_draft_validation() {
        let mut draft = ListingDraft {
            title: "Sunset".to_string(),
            images: vec!["https://example.com/a.png".to_string()],
            starting_bid: 1000,
            start_date: 1000,
            duration: 3600,
            ..Default::default()
        };
        assert!(draft.validate().is_ok());

        draft.title = " ".to_string();
        assert!(matches!(draft.validate(), Err(CoreError::Validation(_))));

        draft.title = "Sunset".to_string();
        draft.starting_bid = 0;
        assert!(matches!(draft.validate(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_status_update_roundtrip() {
        let content = encode_status(ListingStatus::Completed, Some("sold")).unwrap();
        let event = NostrEvent {
            id: "st1".to_string(),
            pubkey: "seller".to_string(),
            kind: KIND_AUCTION_STATUS,
            content,
            tags: vec![vec!["e".to_string(), "ev1".to_string()]],
            created_at: 300,
            sig: String::new(),
        };

        let update = decode_status_update(&event).unwrap();
        assert_eq!(update.status, ListingStatus::Completed);
        assert_eq!(update.message.as_deref(), Some("sold"));
        assert_eq!(update.listing_refs, vec!["ev1"]);
    }
}
