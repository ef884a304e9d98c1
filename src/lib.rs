//! A small fork/exec pipeline engine for shell-like command lines.
//!
//! This crate takes a command line that has already been split into tokens and turns it
//! into a chain of processes: every stage gets its executable resolved against the search
//! path, its `<` and `>` redirections opened, and an OS pipe wired between it and its
//! neighbour for every `|`. The chain is then forked stage by stage and every child is
//! waited on, giving back one exit status per stage.
//!
//! The main entry point is [`Interpreter`]. The lower-level pieces are public too:
//! [`pipeline::build_pipeline`] builds a [`pipeline::Pipeline`] without launching anything,
//! and [`launcher::launch`] runs one.
//!
//! Every descriptor the engine opens is an [`std::os::fd::OwnedFd`] owned by exactly one
//! stage or pipe, so it is closed exactly once on every path, including construction
//! failures.

pub mod command;
pub mod env;
pub mod error;
mod interpreter;
pub mod launcher;
pub mod parser;
pub mod pipeline;
pub mod resolve;
pub mod stage;

#[cfg(test)]
mod testutil;

/// Just a convenient re-export of the pipeline runner.
///
/// See [`Interpreter`] for the high-level API and examples.
pub use interpreter::Interpreter;

pub use error::PipelineError;
