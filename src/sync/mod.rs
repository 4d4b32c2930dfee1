pub mod candle_sync;
pub mod gap_scanner;
pub mod synchronizer;

pub use candle_sync::{CandleSyncReport, CandleSynchronizer};
pub use gap_scanner::{find_gaps_in, GapFillReport, GapScanner};
pub use synchronizer::{system_clock, Clock, HistoricalSynchronizer, SyncReport};
