//! Lossless Python syntax: tokenizer, concrete syntax tree, parser and
//! serializer.
//!
//! Every byte of the input ends up in a token leaf, so serializing an
//! unmodified tree reproduces the source exactly. Mutation only ever touches
//! operator leaves.

mod lexer;
mod parser;
mod serialize;
mod tree;

use thiserror::Error;

use crate::span::Position;

pub use lexer::TokenKind;
pub use parser::parse;
pub use serialize::serialize;
pub use tree::SyntaxTree;

/// Source text that is not valid (or not supported) Python.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{position}: {message}")]
pub struct ParseError {
    pub position: Position,
    pub message: String,
}

impl ParseError {
    pub fn new(position: Position, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}
