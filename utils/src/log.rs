// This makes it easy to import the logging stuff
//
// Call sites do `use utils::log;` followed by `log::debug!(...)`, the
// actual backend is whatever `log` implementation the binary installs.
#![allow(unused_imports)]
pub use ::log::{debug, error, info, trace, warn};
