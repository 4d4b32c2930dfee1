pub mod candle_aggregator;
pub mod consumer;
pub mod price_key;
pub mod tick_buffer;
pub mod trade_stream;

pub use candle_aggregator::{
    Applied, Candle, CandleAggregator, CandleUpdate, FootprintEntry, SharedAggregator,
};
pub use consumer::{StartOutcome, StopOutcome, StreamConsumer};
pub use price_key::price_key;
pub use tick_buffer::TickBuffer;
pub use trade_stream::{parse_agg_trade, BinanceTradeFeed};
