//! # Common building blocks
//!
//! Database-agnostic pieces shared by the replication client and the canal:
//!
//! - [`CanalError`] - error taxonomy with recovery categories
//! - [`TableFilter`] - include/exclude rules over `schema.table`
//! - [`ExponentialBackoff`], [`ReadTimeoutBackoff`], [`ReconnectPolicy`] - retry primitives
//! - [`save_json`] / [`load_json`] - atomic state files
//! - [`CdcSource`] - lifecycle trait implemented by the canal

mod checkpoint;
mod error;
mod filter;
mod resilience;
mod traits;

pub use checkpoint::{load_json, save_json};
pub use error::{CanalError, ErrorCategory, Result};
pub use filter::{TableFilter, TableFilterConfig};
pub use resilience::{ExponentialBackoff, ReadTimeoutBackoff, ReconnectPolicy};
pub use traits::CdcSource;
