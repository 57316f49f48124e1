//! Read path: get-or-compute with singleflight and fail-open.

mod freshness;
mod reader;
mod singleflight;

pub use freshness::{CacheRead, ReadSource};
pub use reader::{CacheReader, ReaderConfig};
pub use singleflight::{Follower, FlightResult, LeaderGuard, Published, Role, SingleFlight};
