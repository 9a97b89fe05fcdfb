//! The two endpoint shapes. Both feed received bytes through a [scanner::FrameScanner], check
//!  decoded headers with [scanner::check_header], and dispatch packets to per-stream state.

pub mod ground;
pub mod onboard;
pub mod scanner;
