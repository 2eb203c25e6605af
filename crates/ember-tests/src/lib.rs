//! Test harness for exercising discovery between real local nodes.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod node;

pub use node::{wait_until, TestNode};
