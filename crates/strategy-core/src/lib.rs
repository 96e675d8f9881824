pub mod error;
pub mod market_data;
pub mod progress;
pub mod stats;
pub mod strategies;
pub mod traits;
pub mod types;

pub use error::*;
pub use market_data::InMemoryMarketData;
pub use progress::{ProgressHandle, ProgressSnapshot, RunGuard, RunStatus, RunTracker};
pub use strategies::SmaCrossover;
pub use traits::*;
pub use types::*;
