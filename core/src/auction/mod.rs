pub mod listing;
pub mod bid;
pub mod reconcile;

pub use bid::{
    decode_bid, decode_confirmation, effective_status, encode_confirmation, rank_bids, Bid,
    BidConfirmation, BidStatus, BidSubmission, ShippingOption,
};
pub use listing::{
    auction_event_ids, decode_listing, decode_status_update, encode_status, select_authoritative,
    ArtistProfile, AuctionListing, ListingDraft, ListingStatus, ShippingRules, ShippingZone,
    StatusUpdate,
};
pub use reconcile::{
    effective_end, reconcile, reconcile_auction, AuctionView, LifecycleState, RankedBid,
    DEFAULT_EXTENSION_SECS,
};
