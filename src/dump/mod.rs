//! Per-dump embedded databases

mod store;

pub use store::{DumpMeta, DumpStore, DumpWriter};
