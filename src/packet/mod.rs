// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Block request descriptors.

pub mod stream;

use std::cmp;

use vm_memory::{Bytes, GuestAddress, GuestMemoryError, GuestMemoryMmap};

const OP_READ: u32 = 0;
const OP_WRITE: u32 = 1;

/// Type of request from client to session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Read blocks into the packet payload.
    Read,
    /// Write the packet payload to blocks.
    Write,
    /// Unknown request.
    Unsupported(u32),
}

impl From<u32> for Operation {
    fn from(value: u32) -> Self {
        match value {
            OP_READ => Operation::Read,
            OP_WRITE => Operation::Write,
            t => Operation::Unsupported(t),
        }
    }
}

impl From<Operation> for u32 {
    fn from(op: Operation) -> u32 {
        match op {
            Operation::Read => OP_READ,
            Operation::Write => OP_WRITE,
            Operation::Unsupported(t) => t,
        }
    }
}

/// A block request as it travels through the submit and acknowledgement queues.
///
/// `block_number` is relative to the session window. The payload lives in the shared buffer at
/// `offset`, `size` bytes long.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketDescriptor {
    operation: Operation,
    block_number: u64,
    block_count: u64,
    offset: u64,
    size: u64,
    succeeded: bool,
}

impl PacketDescriptor {
    /// Creates a new, not yet succeeded, descriptor.
    pub fn new(
        operation: Operation,
        block_number: u64,
        block_count: u64,
        offset: u64,
        size: u64,
    ) -> Self {
        PacketDescriptor {
            operation,
            block_number,
            block_count,
            offset,
            size,
            succeeded: false,
        }
    }

    /// Returns the requested operation.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Returns the first block, relative to the session window.
    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    /// Returns the number of blocks.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Returns the payload offset within the shared buffer.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the request was carried out.
    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    /// Marks the request as carried out or failed.
    pub fn set_succeeded(&mut self, succeeded: bool) {
        self.succeeded = succeeded;
    }
}

/// View of one packet payload in a session's shared buffer.
///
/// Cloning is cheap, and the view stays valid for as long as any clone is alive, so drivers may
/// keep it around to finish a request later.
#[derive(Clone, Debug)]
pub struct PacketBuffer {
    mem: GuestMemoryMmap,
    addr: GuestAddress,
    len: usize,
}

impl PacketBuffer {
    pub(crate) fn new(mem: GuestMemoryMmap, addr: GuestAddress, len: usize) -> Self {
        PacketBuffer { mem, addr, len }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies the start of the payload into `buf`, at most `len()` bytes.
    pub fn read_into(&self, buf: &mut [u8]) -> Result<usize, GuestMemoryError> {
        let n = cmp::min(buf.len(), self.len);
        self.mem.read_slice(&mut buf[..n], self.addr)?;
        Ok(n)
    }

    /// Fills the start of the payload from `data`, at most `len()` bytes.
    pub fn write_from(&self, data: &[u8]) -> Result<usize, GuestMemoryError> {
        let n = cmp::min(data.len(), self.len);
        self.mem.write_slice(&data[..n], self.addr)?;
        Ok(n)
    }
}
