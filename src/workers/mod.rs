//! Queue job handlers (§4.7–§4.8, §4.13–§4.14).
//!
//! Each submodule implements the procedure bound to one stable queue name
//! from [`crate::broker::queue_names`]. Wiring a submodule's entry point to
//! its queue is done where the [`crate::broker::Broker`] is started, not
//! here.

pub mod batch_creation;
pub mod export;
pub mod hybrid_synthetic_phase;
pub mod synthetic_execution;
