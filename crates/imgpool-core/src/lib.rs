#![forbid(unsafe_code)]
//! imgpool-core: interfaces shared by the pools and their hosts.
//!
//! Nothing here allocates pooled memory. The crate defines pool parameters and
//! configuration, the memory-pressure interfaces a host drives, and the
//! reference-counted handle through which pooled values are shared.

pub mod config;
pub mod error;
pub mod id;
pub mod memory;
pub mod prelude;
pub mod reference;
pub mod units;
