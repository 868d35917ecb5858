//! Packet buffer shared by the transmit and receive paths
//!
//! Holds the outbound packet while it is being written and the inbound
//! packet once the chip's FIFO has been read. The buffer mirrors the chip's
//! own FIFO layout, so a staged write also yields the FIFO offset the bytes
//! belong at.

use crate::config::lora_defaults::MAX_PAYLOAD;
use heapless::Vec;

/// Where a staged write lands in the chip's TX FIFO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Staged {
    /// FIFO offset of the first accepted byte
    pub offset: u8,
    /// Bytes accepted, possibly fewer than offered
    pub len: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PacketBuffer {
    data: Vec<u8, MAX_PAYLOAD>,
    read_pos: usize,
}

impl PacketBuffer {
    pub const fn new() -> Self {
        Self {
            data: Vec::new(),
            read_pos: 0,
        }
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }

    /// Append outbound bytes, silently truncating at the FIFO limit
    pub fn stage(&mut self, bytes: &[u8]) -> Staged {
        let offset = self.data.len();
        let len = bytes.len().min(MAX_PAYLOAD - offset);
        // len never exceeds the remaining capacity
        let _ = self.data.extend_from_slice(&bytes[..len]);
        Staged {
            offset: offset as u8,
            len,
        }
    }

    /// Replace the contents with a freshly received packet
    pub fn load(&mut self, bytes: &[u8]) {
        self.reset();
        let len = bytes.len().min(MAX_PAYLOAD);
        let _ = self.data.extend_from_slice(&bytes[..len]);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Bytes not yet consumed by `read()`
    pub fn available(&self) -> usize {
        self.data.len() - self.read_pos
    }

    pub fn read(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.read_pos += 1;
        Some(byte)
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.read_pos).copied()
    }
}
