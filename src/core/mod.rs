//! Core synthesis logic: config types, parsing, the stack graph, tokens and
//! template rendering.

pub mod cidr;
pub mod error;
pub mod naming;
pub mod parser;
pub mod resolver;
pub mod stack;
pub mod synth;
pub mod template;
pub mod token;
pub mod types;
