//! Utilities for testing code that drives a [crate::session::Session]. They are part of the
//!  regular API so that applications can use them in their own tests.

pub mod listener;
