//! Diagnostic dumps of the live flow table.

pub mod writer;

pub use writer::{DumpStats, DumpWriter};
