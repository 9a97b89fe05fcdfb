pub mod array_buf;
pub mod ring_buffer;
