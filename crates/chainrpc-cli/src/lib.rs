//! chainrpc command-line client

pub mod cli;
pub mod commands;
