#![forbid(unsafe_code)]
//! # Supervisor CLI
//!
//! The `supervise` binary: runs one grain (a persistent instance of an
//! application) inside the sandbox built by `supervisor-core`.
//!
//! ## Architecture
//!
//! - **CLI logic**: this crate parses and validates command-line arguments.
//! - **Sandboxing**: all heavy lifting is delegated to `supervisor-core`.

pub mod adapter;
pub mod parser;
pub mod runner;

pub use adapter::adapt_and_validate;
pub use parser::Cli;
