//! Email parsing: header decoding, MIME extraction, and mbox splitting.

pub mod header;
pub mod mbox;
pub mod message;
pub mod mime;

pub use message::{parse, parse_bytes};
