//! Kernel integration tests.

mod backward;
mod forward;
mod harness;
