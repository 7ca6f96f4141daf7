// A set of helper structs for common operations
//
// These are shared between the composition core and anything
// embedding it: fd polling for the event threads, the clock used
// for vsync timestamps, rectangle math and the logging facade.
pub mod fdwatch;
pub mod log;
pub mod region;
pub mod timing;

extern crate anyhow;
pub use anyhow::{anyhow, Context, Error, Result};

#[cfg(test)]
mod tests;
