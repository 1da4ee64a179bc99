//! Lexer, parser, renderer and tree walkers for map scripts.

use thiserror::Error;

mod lexer;
mod parser;
pub mod render;
mod syntax;
pub mod walk;

pub use parser::{parse, parse_expr};
pub use syntax::*;

/// Errors raised while reading a map script.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected character '{ch}' on line {line}")]
    UnexpectedChar { line: usize, ch: char },

    #[error("unterminated {what} starting on line {line}")]
    Unterminated { line: usize, what: &'static str },

    #[error("expected {expected} on line {line}, found '{found}'")]
    Expected {
        line: usize,
        expected: String,
        found: String,
    },
}

impl Unit {
    pub fn render(&self) -> String {
        render::unit(self)
    }
}
