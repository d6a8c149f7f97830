//! Graph subsystem: materialization (C9), layout (C10), community
//! detection (C11), edge bundling (C12), and the query layer (C13).

pub mod bundles;
pub mod community;
pub mod layout;
pub mod materializer;
pub mod query;
pub mod types;
