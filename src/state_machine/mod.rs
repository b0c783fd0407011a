//! statig-based state machines.
//!
//! Each machine only tracks which transitions are legal; the async drivers
//! in `vm` do the work and publish the mapped public state.

pub mod install_sm;
pub mod lifecycle_sm;
