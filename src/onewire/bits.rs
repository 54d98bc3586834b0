use static_assertions::const_assert;

pub const BUFFER_BYTES: usize = 12;
pub const BUFFER_BITS: usize = BUFFER_BYTES * 8;

// Longest transaction: MATCH ROM + address + READ SCRATCHPAD + 2 read bytes.
const_assert!(BUFFER_BITS >= 96);

/// Fixed 96-bit scratch buffer, bit 0 is the LSB of byte 0.
///
/// This is also the order bits travel on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BitBuffer {
    bytes: [u8; BUFFER_BYTES],
}

impl BitBuffer {
    pub const fn new() -> Self {
        Self {
            bytes: [0; BUFFER_BYTES],
        }
    }

    /// Buffer holding `value` in its first byte.
    pub const fn from_byte(value: u8) -> Self {
        let mut bytes = [0; BUFFER_BYTES];
        bytes[0] = value;
        Self { bytes }
    }

    pub const fn from_bytes(bytes: [u8; BUFFER_BYTES]) -> Self {
        Self { bytes }
    }

    pub fn set(&mut self, index: usize, value: bool) {
        if value {
            self.set_one(index);
        } else {
            self.set_zero(index);
        }
    }

    pub fn set_one(&mut self, index: usize) {
        assert!(index < BUFFER_BITS, "bit index {index} out of range");
        self.bytes[index / 8] |= 1 << (index % 8);
    }

    pub fn set_zero(&mut self, index: usize) {
        assert!(index < BUFFER_BITS, "bit index {index} out of range");
        self.bytes[index / 8] &= !(1 << (index % 8));
    }

    pub fn is_one(&self, index: usize) -> bool {
        assert!(index < BUFFER_BITS, "bit index {index} out of range");
        self.bytes[index / 8] & (1 << (index % 8)) != 0
    }

    pub fn is_zero(&self, index: usize) -> bool {
        !self.is_one(index)
    }

    pub fn clear(&mut self) {
        self.bytes = [0; BUFFER_BYTES];
    }

    /// Little-endian `u64` stored at `byte_offset..byte_offset + 8`.
    pub fn load_u64(&self, byte_offset: usize) -> u64 {
        assert!(byte_offset + 8 <= BUFFER_BYTES);
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.bytes[byte_offset..byte_offset + 8]);
        u64::from_le_bytes(word)
    }

    pub fn store_u64(&mut self, byte_offset: usize, value: u64) {
        assert!(byte_offset + 8 <= BUFFER_BYTES);
        self.bytes[byte_offset..byte_offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn byte(&self, index: usize) -> u8 {
        self.bytes[index]
    }

    pub fn set_byte(&mut self, index: usize, value: u8) {
        self.bytes[index] = value;
    }

    pub fn as_bytes(&self) -> &[u8; BUFFER_BYTES] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_index_is_addressable() {
        for index in 0..BUFFER_BITS {
            let mut buffer = BitBuffer::new();
            buffer.set_one(index);
            assert!(buffer.is_one(index));
            assert!(!buffer.is_zero(index));
            assert_eq!(buffer.as_bytes().iter().map(|b| b.count_ones()).sum::<u32>(), 1);

            buffer.set(index, false);
            assert!(buffer.is_zero(index));
        }
    }

    #[test]
    fn test_clear_zeroes_all_bits() {
        let mut buffer = BitBuffer::from_bytes([0xFF; BUFFER_BYTES]);
        buffer.clear();
        assert!((0..BUFFER_BITS).all(|index| buffer.is_zero(index)));
    }

    #[test]
    fn test_u64_is_little_endian_at_offset() {
        let mut buffer = BitBuffer::from_byte(0x55);
        buffer.store_u64(1, 0x2800_0000_12AB_CD3E);

        assert_eq!(buffer.byte(0), 0x55);
        assert_eq!(buffer.byte(1), 0x3E);
        assert_eq!(buffer.byte(8), 0x28);
        assert_eq!(buffer.load_u64(1), 0x2800_0000_12AB_CD3E);
        // Bit 8 is the LSB of byte 1 (0x3E).
        assert!(buffer.is_zero(8));
        assert!(buffer.is_one(9));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_index_past_capacity_panics() {
        let mut buffer = BitBuffer::new();
        buffer.set_one(BUFFER_BITS);
    }
}
