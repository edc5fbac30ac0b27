//! Core data types: identifiers, enums, market data and trading structs.

pub mod enums;
pub mod market_data;
pub mod owner;
pub mod trading;

pub use enums::*;
pub use market_data::*;
pub use owner::*;
pub use trading::*;
