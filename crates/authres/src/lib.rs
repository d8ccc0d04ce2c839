//! Parsing and synthesis of Authentication-Results (RFC8601) header
//! fields, including the `dns` ptype registered by RFC8904.

use thiserror::Error;

mod collector;
mod nom_utils;
mod parser;

pub use collector::{StatementCollector, MAX_STATEMENTS};
pub use parser::{AuthenticationResult, AuthenticationResults};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthResError {
    #[error("invalid header: {0}")]
    HeaderParse(String),
}
