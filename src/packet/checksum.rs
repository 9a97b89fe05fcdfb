use std::fmt::{Debug, Formatter};

use crc::Crc;

/// CRC-16 with polynomial 0x1021 and initial value 0xffff, no reflection and no final xor
const FRAME_CRC: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_IBM_3740);

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u16);

impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

impl Checksum {
    pub fn new(data: &[u8]) -> Checksum {
        Checksum(FRAME_CRC.checksum(data))
    }
}
