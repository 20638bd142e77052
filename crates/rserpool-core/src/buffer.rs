//! Bounds-checked message buffers.
//!
//! [`MessageBuffer`] is the encoding side: a growable buffer with a hard
//! capacity. Every write goes through [`MessageBuffer::get_space`], which
//! refuses to grow past the capacity instead of truncating or panicking.
//!
//! [`MessageCursor`] is the decoding side: a read position over a borrowed
//! datagram whose [`MessageCursor::get_space`] never yields bytes beyond the
//! end of the datagram.

use bytes::{Bytes, BytesMut};
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{AsBytes, FromBytes};

use crate::error::RspError;
use crate::wire::{MessageHeader, MessageType, TlvHeader, HEADER_SIZE};

/// Bytes needed to bring `length` up to a multiple of `alignment`.
pub fn padding(length: usize, alignment: usize) -> usize {
    match length % alignment {
        0 => 0,
        rest => alignment - rest,
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Output buffer with a fixed upper bound.
#[derive(Debug)]
pub struct MessageBuffer {
    buffer: BytesMut,
    capacity: usize,
}

impl MessageBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Bytes written so far.
    pub fn position(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve `size` zeroed bytes at the end and return them for writing.
    pub fn get_space(&mut self, size: usize) -> Result<&mut [u8], RspError> {
        let start = self.buffer.len();
        let end = start
            .checked_add(size)
            .filter(|end| *end <= self.capacity)
            .ok_or(RspError::BufferSizeExceeded)?;
        self.buffer.resize(end, 0);
        Ok(&mut self.buffer[start..end])
    }

    /// Append a fixed-size wire struct.
    pub fn put<T: AsBytes>(&mut self, value: &T) -> Result<(), RspError> {
        let bytes = value.as_bytes();
        self.get_space(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn put_slice(&mut self, data: &[u8]) -> Result<(), RspError> {
        self.get_space(data.len())?.copy_from_slice(data);
        Ok(())
    }

    pub fn put_u16(&mut self, value: u16) -> Result<(), RspError> {
        self.put_slice(&value.to_be_bytes())
    }

    pub fn put_u32(&mut self, value: u32) -> Result<(), RspError> {
        self.put_slice(&value.to_be_bytes())
    }

    /// Discard everything written after `position`.
    pub fn truncate(&mut self, position: usize) {
        self.buffer.truncate(position);
    }

    /// Start a message. The length is a placeholder until
    /// [`finish_message`](Self::finish_message). Returns the start offset.
    pub fn begin_message(&mut self, message_type: MessageType, flags: u8) -> Result<usize, RspError> {
        let start = self.position();
        self.put(&MessageHeader {
            msg_type: message_type.type_byte(),
            flags: flags & message_type.flag_mask(),
            length: U16::new(0xffff),
        })?;
        Ok(start)
    }

    /// Set additional header flags of a message begun at `start`.
    pub fn add_message_flags(&mut self, start: usize, flags: u8) {
        if let Some(header_flags) = self.buffer.get_mut(start + 1) {
            *header_flags |= flags;
        }
    }

    /// Fill in the message length and pad the message to four bytes.
    pub fn finish_message(&mut self, start: usize) -> Result<(), RspError> {
        self.finish_unit(start)
    }

    /// Start a parameter of the given (already action-flagged) type.
    pub fn begin_tlv(&mut self, tlv_type: u16) -> Result<usize, RspError> {
        let start = self.position();
        self.put(&TlvHeader {
            tlv_type: U16::new(tlv_type),
            length: U16::new(0xffff),
        })?;
        Ok(start)
    }

    /// Fill in the parameter length and pad the parameter to four bytes.
    pub fn finish_tlv(&mut self, start: usize) -> Result<(), RspError> {
        self.finish_unit(start)
    }

    // Messages and TLVs share the layout of their length field (bytes 2..4).
    fn finish_unit(&mut self, start: usize) -> Result<(), RspError> {
        if self.buffer.len() < start + HEADER_SIZE {
            return Err(RspError::BufferSizeExceeded);
        }
        let length = self.buffer.len() - start;
        let wire_length = u16::try_from(length).map_err(|_| RspError::BufferSizeExceeded)?;
        self.buffer[start + 2..start + 4].copy_from_slice(&wire_length.to_be_bytes());
        self.get_space(padding(length, 4))?;
        Ok(())
    }

    pub fn freeze(self) -> Bytes {
        self.buffer.freeze()
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Read position over a received datagram.
#[derive(Debug, Clone)]
pub struct MessageCursor<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> MessageCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Total datagram size.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Move the cursor. Positions past the end are clamped.
    pub fn seek(&mut self, position: usize) {
        self.position = position.min(self.data.len());
    }

    /// Consume `size` bytes, or `None` without moving if fewer remain.
    pub fn get_space(&mut self, size: usize) -> Option<&'a [u8]> {
        let end = self.position.checked_add(size)?;
        let space = self.data.get(self.position..end)?;
        self.position = end;
        Some(space)
    }

    /// Consume a fixed-size wire struct.
    pub fn read<T: FromBytes>(&mut self) -> Option<T> {
        let space = self.get_space(std::mem::size_of::<T>())?;
        T::read_from(space)
    }

    /// Borrow `start..end` of the datagram, clamped to its size.
    pub fn slice(&self, start: usize, end: usize) -> &'a [u8] {
        let end = end.min(self.data.len());
        &self.data[start.min(end)..end]
    }
}
