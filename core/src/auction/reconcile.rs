use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::auction::bid::{
    decode_confirmation, effective_status, rank_bids, Bid, BidConfirmation, BidStatus,
};
use crate::auction::listing::{
    auction_event_ids, decode_status_update, select_authoritative, AuctionListing, ListingStatus,
};
use crate::types::NostrEvent;

/// 終了間際の入札で延長する秒数の既定値
pub const DEFAULT_EXTENSION_SECS: i64 = 300;

/// オークションの導出ライフサイクル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Scheduled,
    Active,
    Extended,
    Ended,
    Completed,
    Cancelled,
}

/// 有効ステータス付きの入札（順位は配列上の位置）
#[derive(Debug, Clone, PartialEq)]
pub struct RankedBid {
    pub bid: Bid,
    pub status: BidStatus,
    pub total_cost: Option<u64>,
}

/// 1出品の整合ビュー
///
/// イベント集合と時刻の純関数として導出され、どこにも保存されない
#[derive(Debug, Clone, PartialEq)]
pub struct AuctionView {
    pub listing: AuctionListing,
    pub current_price: u64,
    pub bid_count: usize,
    pub ranked_bids: Vec<RankedBid>,
    pub lifecycle: LifecycleState,
    pub effective_end: i64,
    pub time_remaining: i64,
    pub reserve_met: bool,
}

/// 自動延長を織り込んだ実効終了時刻
///
/// 最高額を更新した入札が終了前extension_time秒以内に入るたびに
/// end = max(end, bid_time + extension_time) へ伸びる。
/// 出品イベント自体は書き換えない導出値
pub fn effective_end(listing: &AuctionListing, bids: &[Bid]) -> i64 {
    let natural_end = listing.start_date + listing.duration;
    if !listing.auto_extend {
        return natural_end;
    }
    let extension = if listing.extension_time > 0 {
        listing.extension_time
    } else {
        DEFAULT_EXTENSION_SECS
    };

    let mut ordered: Vec<&Bid> = bids.iter().collect();
    ordered.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });

    let mut end = natural_end;
    let mut top = 0u64;
    for bid in ordered {
        if bid.amount > top {
            top = bid.amount;
            if bid.created_at >= end - extension && bid.created_at < end {
                end = end.max(bid.created_at + extension);
            }
        }
    }
    end
}

/// 出品イベント群と関連イベント群から全オークションのビューを導出
pub fn reconcile(
    listing_events: &[NostrEvent],
    bid_events: &[NostrEvent],
    confirmation_events: &[NostrEvent],
    status_events: &[NostrEvent],
    now: i64,
) -> Vec<AuctionView> {
    select_authoritative(listing_events)
        .into_iter()
        .map(|listing| {
            let ids = auction_event_ids(listing_events, &listing.auction_id, &listing.seller);
            reconcile_auction(listing, &ids, bid_events, confirmation_events, status_events, now)
        })
        .collect()
}

/// 1オークション分のビューを導出
pub fn reconcile_auction(
    listing: AuctionListing,
    listing_event_ids: &HashSet<String>,
    bid_events: &[NostrEvent],
    confirmation_events: &[NostrEvent],
    status_events: &[NostrEvent],
    now: i64,
) -> AuctionView {
    let bids = rank_bids(listing_event_ids, bid_events);
    let confirmations: Vec<BidConfirmation> = confirmation_events
        .iter()
        .filter_map(|event| match decode_confirmation(event) {
            Ok(confirmation) => Some(confirmation),
            Err(e) => {
                log::debug!("Dropping malformed confirmation {}: {}", event.id, e);
                None
            }
        })
        .collect();

    let current_price = bids
        .iter()
        .map(|b| b.amount)
        .max()
        .map_or(listing.starting_bid, |top| top.max(listing.starting_bid));
    let end = effective_end(&listing, &bids);
    let lifecycle = lifecycle_state(&listing, listing_event_ids, status_events, end, now);
    let reserve_met = listing.reserve_price.map_or(false, |r| current_price >= r);

    let ranked_bids: Vec<RankedBid> = bids
        .into_iter()
        .map(|bid| {
            let (status, confirmation) = effective_status(&bid, &confirmations, &listing.seller);
            RankedBid {
                status,
                total_cost: confirmation.and_then(|c| c.total_cost),
                bid,
            }
        })
        .collect();

    AuctionView {
        current_price,
        bid_count: ranked_bids.len(),
        lifecycle,
        effective_end: end,
        time_remaining: (end - now).max(0),
        reserve_met,
        ranked_bids,
        listing,
    }
}

/// 売り手の明示的なステータス更新が時刻導出より優先
fn lifecycle_state(
    listing: &AuctionListing,
    listing_event_ids: &HashSet<String>,
    status_events: &[NostrEvent],
    effective_end: i64,
    now: i64,
) -> LifecycleState {
    let latest_update = status_events
        .iter()
        .filter_map(|event| match decode_status_update(event) {
            Ok(update) => Some(update),
            Err(e) => {
                log::debug!("Dropping malformed status update {}: {}", event.id, e);
                None
            }
        })
        .filter(|u| {
            u.author == listing.seller && u.listing_refs.iter().any(|r| listing_event_ids.contains(r))
        })
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| b.event_id.cmp(&a.event_id))
        });

    if let Some(update) = latest_update {
        return match update.status {
            ListingStatus::Completed => LifecycleState::Completed,
            ListingStatus::Cancelled => LifecycleState::Cancelled,
        };
    }

    let natural_end = listing.start_date + listing.duration;
    if now < listing.start_date {
        LifecycleState::Scheduled
    } else if now >= effective_end {
        // 終了境界は終了側に含める
        LifecycleState::Ended
    } else if effective_end > natural_end {
        LifecycleState::Extended
    } else {
        LifecycleState::Active
    }
}
