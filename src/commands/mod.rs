//! # CLI Command Implementations
//!
//! Each subcommand of `vmr-codeflow` is implemented in its own file, with an
//! `Args` struct derived using `clap` and an `execute` function calling into
//! the `vmr_codeflow` library.
//!
//! Forward flow and backflow take the same arguments and share one
//! implementation (`flow`), parameterized by the flow direction.

pub mod flow;
