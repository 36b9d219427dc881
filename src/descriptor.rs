// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! msgDMA extended descriptor.
//!
//! The descriptor is 32 bytes, written as eight little-endian 32-bit words
//! to the channel's descriptor port. Addresses are split into low and high
//! halves; the high halves live in words 5 and 6.

use bitflags::bitflags;

/// Byte granularity the dispatcher requires for device-side addresses.
pub const DMA_ALIGN_BYTES: usize = 64;

/// Bit marking an address as a host IOVA rather than device memory.
pub const HOST_ADDR_MASK: u64 = 0x2_0000_0000_0000;

/// Number of 32-bit words in a descriptor.
pub const DESCRIPTOR_WORDS: usize = 8;

/// Largest length one descriptor can carry.
pub const MAX_DESCRIPTOR_LEN: usize = u32::MAX as usize;

bitflags! {
    /// Descriptor control word (word 7).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DescriptorControl: u32 {
        /// Transmit channel number (bits 0-7).
        const TX_CHANNEL = 0xFF;
        /// Emit start-of-packet with the first beat.
        const GENERATE_SOP = 1 << 8;
        /// Emit end-of-packet with the last beat.
        const GENERATE_EOP = 1 << 9;
        const PARK_READS = 1 << 10;
        const PARK_WRITES = 1 << 11;
        /// Finish the descriptor when the stream delivers end-of-packet.
        const END_ON_EOP = 1 << 12;
        const EOP_RCVD_IRQ_EN = 1 << 13;
        /// Raise an interrupt when the descriptor completes.
        const TRANSFER_IRQ_EN = 1 << 14;
        const EARLY_TERM_IRQ_EN = 1 << 15;
        const TRANSFER_ERROR_IRQ_EN = 0xFF << 16;
        /// Let the read master retire before the write side drains.
        const EARLY_DONE_EN = 1 << 24;
        const WAIT_FOR_WR_RSP = 1 << 25;
        /// Commit the descriptor to the dispatcher.
        const GO = 1 << 31;
    }
}

/// 32-byte msgDMA extended descriptor.
///
/// # Layout
///
/// | Word | Contents                                         |
/// |------|--------------------------------------------------|
/// | 0    | read address, low 32 bits                        |
/// | 1    | write address, low 32 bits                       |
/// | 2    | length                                           |
/// | 3    | sequence number, read burst, write burst         |
/// | 4    | read stride, write stride                        |
/// | 5    | read address, high 32 bits                       |
/// | 6    | write address, high 32 bits                      |
/// | 7    | control                                          |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Descriptor {
    pub rd_address: u32,
    pub wr_address: u32,
    pub len: u32,
    pub seq_num: u16,
    pub rd_burst: u8,
    pub wr_burst: u8,
    pub rd_stride: u16,
    pub wr_stride: u16,
    pub rd_address_ext: u32,
    pub wr_address_ext: u32,
    pub control: u32,
}

impl Descriptor {
    /// Build a descriptor moving `len` bytes from `src` to `dst`.
    ///
    /// Strides are fixed at one, bursts and sequence number at zero, and
    /// the go bit is always set.
    #[inline]
    pub const fn new(src: u64, dst: u64, len: u32, control: DescriptorControl) -> Self {
        Self {
            rd_address: src as u32,
            wr_address: dst as u32,
            len,
            seq_num: 0,
            rd_burst: 0,
            wr_burst: 0,
            rd_stride: 1,
            wr_stride: 1,
            rd_address_ext: (src >> 32) as u32,
            wr_address_ext: (dst >> 32) as u32,
            control: control.bits() | DescriptorControl::GO.bits(),
        }
    }

    /// Full 64-bit read address.
    #[inline]
    pub fn read_address(&self) -> u64 {
        ((self.rd_address_ext as u64) << 32) | self.rd_address as u64
    }

    /// Full 64-bit write address.
    #[inline]
    pub fn write_address(&self) -> u64 {
        ((self.wr_address_ext as u64) << 32) | self.wr_address as u64
    }

    #[inline]
    pub fn control_flags(&self) -> DescriptorControl {
        DescriptorControl::from_bits_retain(self.control)
    }

    /// The eight words in port order.
    pub fn as_words(&self) -> [u32; DESCRIPTOR_WORDS] {
        [
            self.rd_address,
            self.wr_address,
            self.len,
            self.seq_num as u32 | (self.rd_burst as u32) << 16 | (self.wr_burst as u32) << 24,
            self.rd_stride as u32 | (self.wr_stride as u32) << 16,
            self.rd_address_ext,
            self.wr_address_ext,
            self.control,
        ]
    }

    /// Reassemble a descriptor from port words.
    pub fn from_words(words: [u32; DESCRIPTOR_WORDS]) -> Self {
        Self {
            rd_address: words[0],
            wr_address: words[1],
            len: words[2],
            seq_num: (words[3] & 0xFFFF) as u16,
            rd_burst: ((words[3] >> 16) & 0xFF) as u8,
            wr_burst: (words[3] >> 24) as u8,
            rd_stride: (words[4] & 0xFFFF) as u16,
            wr_stride: (words[4] >> 16) as u16,
            rd_address_ext: words[5],
            wr_address_ext: words[6],
            control: words[7],
        }
    }
}

/// Returns true if `addr` meets the dispatcher's alignment requirement.
#[inline]
pub const fn is_dma_aligned(addr: u64) -> bool {
    addr % DMA_ALIGN_BYTES as u64 == 0
}

// Compile-time size check against the extended descriptor format
const _: () = assert!(std::mem::size_of::<Descriptor>() == 32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_size() {
        assert_eq!(std::mem::size_of::<Descriptor>(), 32);
    }

    #[test]
    fn test_address_split() {
        let src = 0x0002_0001_2345_6780u64;
        let dst = 0x0000_0000_8000_0040u64;
        let desc = Descriptor::new(src, dst, 4096, DescriptorControl::empty());

        assert_eq!(desc.rd_address, 0x2345_6780);
        assert_eq!(desc.rd_address_ext, 0x0002_0001);
        assert_eq!(desc.wr_address, 0x8000_0040);
        assert_eq!(desc.wr_address_ext, 0);
        assert_eq!(desc.read_address(), src);
        assert_eq!(desc.write_address(), dst);
    }

    #[test]
    fn test_go_always_set() {
        let desc = Descriptor::new(0, 0, 64, DescriptorControl::TRANSFER_IRQ_EN);
        let ctrl = desc.control_flags();
        assert!(ctrl.contains(DescriptorControl::GO));
        assert!(ctrl.contains(DescriptorControl::TRANSFER_IRQ_EN));
        assert_eq!(desc.control, 0x8000_4000);
    }

    #[test]
    fn test_word_layout() {
        let desc = Descriptor::new(
            0x1_0000_0040,
            0x80,
            1024,
            DescriptorControl::GENERATE_SOP | DescriptorControl::EARLY_DONE_EN,
        );
        let words = desc.as_words();
        assert_eq!(words[0], 0x40);
        assert_eq!(words[1], 0x80);
        assert_eq!(words[2], 1024);
        assert_eq!(words[3], 0);
        // both strides are one
        assert_eq!(words[4], 0x0001_0001);
        assert_eq!(words[5], 1);
        assert_eq!(words[6], 0);
        assert_eq!(words[7], 0x8100_0100);
        assert_eq!(Descriptor::from_words(words), desc);
    }

    #[test]
    fn test_alignment() {
        assert!(is_dma_aligned(0));
        assert!(is_dma_aligned(0x40));
        assert!(!is_dma_aligned(0x41));
        assert!(is_dma_aligned(HOST_ADDR_MASK | 0x1000));
    }
}
