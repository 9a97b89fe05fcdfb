//! Chunked, digest verified download of a blob (typically a firmware image) over the Firmware
//!  stream.
//!
//! The sub-protocol does not use the reliability engine. All requests are idempotent and are
//!  simply repeated until the matching response arrives, so they travel as Unreliable packets:
//!
//! ```ascii
//! requester (ground)                       responder (onboard)
//!    RequestHash  ---------------------->   (repeated every hash_poll_interval)
//!                 <----------------------   Hash {size, device name, sha512}
//!    Start{nonce} ---------------------->   (repeated every start_poll_interval)
//!                 <----------------------   StartAck{nonce}, Chunk, Chunk, ...
//!    RequestChunk{gap} ----------------->   (after each chunk, or every check_interval)
//!                 <----------------------   Chunk, Chunk, ...
//! ```

pub mod messages;
pub mod requester;
pub mod responder;
