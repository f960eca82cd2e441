//! Per-medium discovery helpers (§4.7): Bloom filters for compact
//! advertised-service sets, BLE read backoff, and round-based lost-entity
//! tracking, plus the [`platform`] trait boundary that carries actual
//! bytes across whichever radio is in use.

pub use advertisement_read_result::{AdvertisementReadResult, BackoffParams, ReadAction};
pub use bloom_filter::BloomFilter;
pub use lost_entity_tracker::LostEntityTracker;
pub use platform::{BoxedStream, InMemoryMediums, PlatformMediums, RawByteStream};

mod advertisement_read_result;
mod bloom_filter;
mod lost_entity_tracker;
mod platform;
