//! Session orchestrators (§4.9, §4.10, §4.12).
//!
//! [`collaborative`] drives the synchronous paired AUTHOR/PLAY/REVIEW
//! session and owns the persist-a-story transaction both orchestrators rely
//! on; [`hybrid`] wraps it in an asynchronous, event-emitting state machine
//! for the human+synthetic case.

pub mod collaborative;
pub mod hybrid;
