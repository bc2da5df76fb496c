//! Wire and domain types shared between the client core and its tools.

pub mod domain;
pub mod error;
pub mod protocol;
