//! Checksums used on the wire and over whole images

/// Calculates the CRC-16/CCITT-FALSE checksum for the given slice of `bytes`
///
/// Polynomial 0x1021, initial value 0xFFFF, no reflection and no final xor. Every frame carries
/// this checksum over all of its preceding bytes.
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.update(bytes);
    crc.finish()
}

/// Calculates the CRC-32/MPEG-2 checksum for the given slice of `bytes`
///
/// Polynomial 0x04C11DB7, initial value 0xFFFFFFFF, no reflection and no final xor.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(bytes);
    crc.finish()
}

/// Incremental CRC-16/CCITT-FALSE
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Crc16(u16);

impl Crc16 {
    pub fn new() -> Crc16 {
        Crc16(0xFFFF)
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= (*byte as u16) << 8;

            for _ in 0..8 {
                if self.0 & 0x8000 > 0 {
                    self.0 = (self.0 << 1) ^ 0x1021;
                } else {
                    self.0 <<= 1;
                }
            }
        }
    }

    pub fn finish(&self) -> u16 {
        self.0
    }
}

impl Default for Crc16 {
    fn default() -> Crc16 {
        Crc16::new()
    }
}

/// Incremental CRC-32/MPEG-2, used as the running whole-image accumulator
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Crc32(u32);

impl Crc32 {
    pub fn new() -> Crc32 {
        Crc32(0xFFFF_FFFF)
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= (*byte as u32) << 24;

            for _ in 0..8 {
                if self.0 & 0x8000_0000 > 0 {
                    self.0 = (self.0 << 1) ^ 0x04C1_1DB7;
                } else {
                    self.0 <<= 1;
                }
            }
        }
    }

    pub fn finish(&self) -> u32 {
        self.0
    }
}

impl Default for Crc32 {
    fn default() -> Crc32 {
        Crc32::new()
    }
}
