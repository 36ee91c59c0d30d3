//! Database Module
//!
//! # Module Structure
//! - `core`: Engine struct, open with WAL recovery, flush, close, stats
//! - `crud`: Put / Get / Delete / Edit

pub mod core;
pub mod crud;

pub use core::{Engine, EngineStats};
