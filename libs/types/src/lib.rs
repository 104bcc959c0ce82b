//! Types library for the market-data synchronization core
//!
//! Provides the small set of value types shared by the order book mirror,
//! the candle aggregator and the feed adapters.
//!
//! # Modules
//! - `ids`: Market identifiers (MarketId)
//! - `numeric`: Fixed-point decimal types (Price, Quantity)
//! - `side`: Book side (bid or ask)
//! - `errors`: Numeric parse/validation errors

pub mod ids;
pub mod numeric;
pub mod side;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::numeric::*;
    pub use crate::side::*;
    pub use crate::errors::*;
}
