//! Topic naming and payload shapes used on the wire
//!
//! Every message body produced by this crate is UTF-8 JSON text.

pub mod json;
pub mod payloads;
pub mod topics;

pub use json::to_json_string;
pub use payloads::*;
pub use topics::*;
