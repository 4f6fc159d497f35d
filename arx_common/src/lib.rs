//! ARX Common Library
//!
//! Shared building blocks for the ARX six-axis arm firmware workspace:
//!
//! - [`consts`] — compile-time sizing constants (joint count, batch capacity,
//!   storage layout)
//! - [`joint`] — per-joint mechanical constants, tunable parameters, and the
//!   factory default table
//! - [`config`] — firmware configuration loading (TOML)
//! - [`protocol`] — the line-delimited JSON host protocol: request envelope,
//!   command set, reply builders, and error tags

pub mod config;
pub mod consts;
pub mod joint;
pub mod protocol;
