//! Cross-cutting utilities: the error taxonomy (C9).

pub mod error;
