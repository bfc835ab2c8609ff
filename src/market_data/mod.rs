pub mod balance_cache;
pub mod candle_buffer;
pub mod depth_cache;
pub mod historical;
pub mod stream_plane;
pub mod ticker_cache;

pub use balance_cache::BalanceCache;
pub use candle_buffer::{Candle, CandleBuffer, CandleKey};
pub use depth_cache::{DepthCache, DepthCacheManager};
pub use historical::HistoricalPriceProvider;
pub use stream_plane::StreamPlane;
pub use ticker_cache::{TickerCache, TickerFetcher};
