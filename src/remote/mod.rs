pub mod http;
pub mod memory;
pub mod overpass;
pub mod replay;
pub mod traits;
pub mod types;

pub use http::HttpReportService;
pub use memory::MemoryReportService;
pub use overpass::OverpassRoadVerifier;
pub use replay::ReplayPositionSource;
pub use traits::{FeedEvent, PositionSource, ReportApi, ReportFeed, RoadVerifier, Subscription};
pub use types::{FeedQuery, FeedScope, PositionOptions};
