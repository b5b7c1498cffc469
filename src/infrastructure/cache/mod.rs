pub mod invalid_symbols;

pub use invalid_symbols::{InvalidSymbolCache, InvalidSymbolCacheConfig};
