//! Parsers for the Linux `/proc` filesystem.
//!
//! The adapters read raw text through [`FileSystem`](crate::collector::FileSystem)
//! and hand it to these pure parsers.

pub mod parser;

pub use parser::ParseError;
