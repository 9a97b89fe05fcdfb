//! Per-stream sequencing and reliability.
//!
//! Every stream type has its own independent counters. The receive side ([inbound]) is shared by
//!  both endpoint shapes. The send side is the [reliable_queue] state machine, which is driven by
//!  check-id tagged timers ([delivery]): tokio tasks on the ground ([actor]), tick counting on
//!  the embedded endpoint.

pub mod actor;
pub mod counters;
pub mod delivery;
pub mod handler;
pub mod inbound;
pub mod reliable_queue;
