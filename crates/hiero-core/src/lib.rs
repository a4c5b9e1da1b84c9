#[cfg(not(target_endian = "little"))]
compile_error!("hiero-core requires a little-endian platform");

pub mod config;
pub mod decoder;
pub mod lm;
#[cfg(feature = "neural")]
pub mod neural;
pub mod nnjm;
pub mod rules;
pub mod sentence;
pub mod vocab;

pub use vocab::SymbolId;
