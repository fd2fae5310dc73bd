#![forbid(unsafe_code)]

mod classify;
mod client;
mod decode;
mod resolver;
mod ws;

pub use classify::{PLATFORM_EARN_RATE, UNKNOWN_GIFT_NAME, classify};
pub use client::{DEFAULT_GIFT_REFRESH_INTERVAL, RoomClient, RoomClientSettings};
pub use decode::split_payload;
pub use resolver::{
	DEFAULT_GIFT_CATALOG_URL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_ROOM_PAGE_BASE_URL, DEFAULT_WS_URL, LongzhuEndpoints,
	LongzhuResolver, MetadataResolver, catalog_from_items, parse_room_id,
};
pub use ws::{RoomWs, channel_url};
