//! API routes.
//!
//! - `scenarios` - scenario listing, actions and dashboard state

pub mod scenarios;
