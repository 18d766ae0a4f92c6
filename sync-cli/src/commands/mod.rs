//! CLI command implementations.

pub mod decode_status;
pub mod simulate;
pub mod watermarks;
