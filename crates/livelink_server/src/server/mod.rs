#![forbid(unsafe_code)]

pub mod hub;
pub mod workers;

#[cfg(test)]
mod hub_tests;
