pub mod checksum;
pub mod frame;
pub mod header;
pub mod receipt;
