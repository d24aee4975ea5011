//! Blobhouse test and validation infrastructure
//!
//! Shared harness and fault-injecting plugins, plus the cross-crate integration suites:
//! end-to-end scenarios, concurrent dedup, restart durability, access control, fault
//! injection and property tests.

pub mod chaos;
pub mod harness;

pub use chaos::{FaultyStorage, ReversingTransform, REVERSING_TRANSFORM_ID};
pub use harness::{admin, user, TestEnv};

#[cfg(test)]
mod fault_injection_tests;
#[cfg(test)]
mod proptest_warehouse;
#[cfg(test)]
mod security_integration;
