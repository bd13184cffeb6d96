// src/lib.rs - Library root for roadopt

pub mod cli;
pub mod evaluator;
pub mod infra;
pub mod oracle;
pub mod search;
