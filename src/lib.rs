//! A multi-provider chat-completion gateway: normalizes OpenAI-style,
//! Anthropic-style, Google-style and aggregator chat APIs behind one
//! streaming interface.

pub mod config;
pub mod core;
pub mod server;
pub mod utils;
