//! Hash collections used across termhost.
//!
//! Session ids are short strings, so the session table and the subscriber
//! registry use FxHash instead of SipHash.

pub use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};
pub use std::collections::*;

