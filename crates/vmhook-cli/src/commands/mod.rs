//! CLI command implementations.

pub mod events;
pub mod hex_utils;
pub mod layout;
pub mod offset;
pub mod table;
