//! Concrete [`crate::driver::Driver`] implementations.

pub mod raw;
