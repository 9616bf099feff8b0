//! Identifier validation errors

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidId {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{kind} contains a reserved character: {value}")]
    ReservedCharacter { kind: &'static str, value: String },
}
