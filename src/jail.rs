//! Live jail state
//!
//! This module provides:
//! - The status line format (shell-style tokens, `key=value` or bare flags)
//! - `StateProbe`, which runs the status tool and caches what it reports

pub mod state;
pub mod status;

pub use state::{JailState, JailStateTable, Jls, StateProbe, StatusTool};
