pub mod ast;
pub mod config;
pub mod connection;
pub mod error;
pub mod interpreter;
pub mod runtime;
pub mod scheduler;
pub mod span;
