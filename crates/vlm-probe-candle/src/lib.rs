#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

mod hub;
mod paligemma;

pub use hub::{hub_load_safetensors, weight_files};
pub use paligemma::{CandleVlmError, PaligemmaBackend, PALIGEMMA_TEMPLATE};
