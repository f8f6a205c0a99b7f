//! Test-only support code. Not part of the public API; gated behind
//! `#[cfg(test)]` by every module that imports it.

pub mod sim;
