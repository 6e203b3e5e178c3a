//! J1939 DTC decoding: the lookup store (§4.2) and the pure decoder (§4.1).

pub mod decoder;
pub mod store;

pub use decoder::{decode, DecodedDtc};
pub use store::J1939Store;
