pub mod config;
pub mod error;
pub mod gateway;
pub mod limiter;
pub mod path;
pub mod resource;
pub mod store;

pub use config::{OriginConfig, TlsConfig, parse_origin_toml};
pub use error::{Error, Result};
pub use limiter::TokenBucket;
pub use path::ResourcePath;
pub use resource::{LiveResource, ReaderCursor};
pub use store::{Deleted, LiveStreamStore, PathState, Upload};
