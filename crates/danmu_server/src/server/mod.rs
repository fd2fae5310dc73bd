#![forbid(unsafe_code)]

pub mod flush;
pub mod health;
pub mod sink;
pub mod supervisor;

#[cfg(test)]
mod supervisor_tests;
