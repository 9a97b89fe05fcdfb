//! The contract between the reliability engine and the application logic behind a stream.
//!
//! Handlers are registered per stream type. The ground endpoint keeps them in a map that is
//!  distributed to the stream actors at startup, the embedded endpoint in an array indexed by
//!  stream type so that dispatch needs no allocation.

use bytes::BufMut;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;

use crate::error::HandlerError;
use crate::packet::header::{PacketHeader, StreamType};

#[cfg_attr(test, automock)]
pub trait StreamHandler {
    /// Processes an incoming payload. For reliable packets, whatever is written to `response`
    ///  is sent back in the receipt, and `response.remaining_mut()` is the room available for it.
    ///  Unreliable packets have no response, `response` has no room then.
    fn handle(&mut self, header: &PacketHeader, payload: &[u8], response: &mut dyn BufMut) -> Result<(), HandlerError>;

    /// Called when the endpoint has room for an outbound unreliable packet on this stream.
    ///  Returns `true` if a payload was written to `out`, which must not exceed
    ///  `out.remaining_mut()`.
    fn produce(&mut self, _out: &mut dyn BufMut) -> bool {
        false
    }
}

pub type BoxedStreamHandler = Box<dyn StreamHandler + Send>;

/// Ground side dispatch table
#[derive(Default)]
pub struct HandlerMap {
    handlers: FxHashMap<StreamType, BoxedStreamHandler>,
}

impl HandlerMap {
    pub fn new() -> HandlerMap {
        HandlerMap::default()
    }

    /// Returns the previously registered handler for the stream, if any
    pub fn register(&mut self, stream: StreamType, handler: BoxedStreamHandler) -> Option<BoxedStreamHandler> {
        self.handlers.insert(stream, handler)
    }

    pub fn contains(&self, stream: StreamType) -> bool {
        self.handlers.contains_key(&stream)
    }

    pub fn take(&mut self, stream: StreamType) -> Option<BoxedStreamHandler> {
        self.handlers.remove(&stream)
    }
}

/// Embedded side dispatch table, borrowing handlers that live elsewhere
pub struct HandlerArray<'a> {
    handlers: [Option<&'a mut dyn StreamHandler>; StreamType::COUNT],
}

impl<'a> Default for HandlerArray<'a> {
    fn default() -> Self {
        HandlerArray {
            handlers: [None, None, None, None, None],
        }
    }
}

impl<'a> HandlerArray<'a> {
    pub fn new() -> HandlerArray<'a> {
        HandlerArray::default()
    }

    pub fn with(mut self, stream: StreamType, handler: &'a mut dyn StreamHandler) -> HandlerArray<'a> {
        self.handlers[stream.index()] = Some(handler);
        self
    }

    pub fn contains(&self, stream: StreamType) -> bool {
        self.handlers[stream.index()].is_some()
    }

    pub fn get_mut(&mut self, stream: StreamType) -> Option<&mut (dyn StreamHandler + 'a)> {
        self.handlers[stream.index()].as_deref_mut()
    }
}
