// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Packet stream shared between a client and its session.
//!
//! The stream is a pair of bounded queues of equal capacity, one carrying submitted requests to
//! the session and one carrying acknowledgements back, plus the bulk buffer holding request
//! payloads. Each direction signals the other side through an eventfd.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io;
use std::result;
use std::sync::{Mutex, MutexGuard, PoisonError};

use vm_memory::{GuestAddress, GuestMemoryError};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use super::{PacketBuffer, PacketDescriptor};
use crate::driver::DmaBuffer;

/// Default capacity of both queues.
pub const DEFAULT_QUEUE_SIZE: usize = 256;

/// Packet stream related errors.
#[derive(Debug)]
pub enum Error {
    /// The submit queue has no free slot.
    SubmitQueueFull,
    /// The acknowledgement queue has no free slot.
    AckQueueFull,
    /// No free range of the requested size is left in the bulk buffer.
    BufferExhausted,
    /// The packet payload does not lie within the bulk buffer.
    OutOfBounds,
    /// Accessing the bulk buffer failed.
    GuestMemory(GuestMemoryError),
    /// Creating a notification eventfd failed.
    EventFd(io::Error),
    /// The queues must hold at least one packet.
    InvalidQueueSize,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            SubmitQueueFull => write!(f, "submit queue is full"),
            AckQueueFull => write!(f, "acknowledgement queue is full"),
            BufferExhausted => write!(f, "packet buffer exhausted"),
            OutOfBounds => write!(f, "packet payload outside of the packet buffer"),
            GuestMemory(e) => write!(f, "packet buffer access failed: {}", e),
            EventFd(e) => write!(f, "failed to create eventfd: {}", e),
            InvalidQueueSize => write!(f, "queue size must not be zero"),
        }
    }
}

impl std::error::Error for Error {}

/// Packet stream result type.
pub type Result<T> = result::Result<T, Error>;

struct Rings {
    submit: VecDeque<PacketDescriptor>,
    ack: VecDeque<PacketDescriptor>,
    // Payload allocations of the client, offset -> size.
    allocations: BTreeMap<u64, u64>,
}

/// The shared request/acknowledgement ring pair of one session.
pub struct PacketStream {
    queue_size: usize,
    buffer: DmaBuffer,
    rings: Mutex<Rings>,
    submit_evt: EventFd,
    ack_freed_evt: EventFd,
    ack_avail_evt: EventFd,
}

impl PacketStream {
    /// Creates a stream over `buffer` with `queue_size` slots per direction.
    pub fn new(buffer: DmaBuffer, queue_size: usize) -> Result<Self> {
        if queue_size == 0 {
            return Err(Error::InvalidQueueSize);
        }
        let evt = || EventFd::new(EFD_NONBLOCK).map_err(Error::EventFd);

        Ok(PacketStream {
            queue_size,
            buffer,
            rings: Mutex::new(Rings {
                submit: VecDeque::with_capacity(queue_size),
                ack: VecDeque::with_capacity(queue_size),
                allocations: BTreeMap::new(),
            }),
            submit_evt: evt()?,
            ack_freed_evt: evt()?,
            ack_avail_evt: evt()?,
        })
    }

    fn rings(&self) -> MutexGuard<Rings> {
        self.rings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal(evt: &EventFd, what: &str) {
        if let Err(e) = evt.write(1) {
            error!("Failed to signal {}: {:?}", what, e);
        }
    }

    /// Capacity of each queue.
    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Size of the bulk buffer in bytes.
    pub fn buffer_size(&self) -> u64 {
        self.buffer.size() as u64
    }

    pub(crate) fn buffer(&self) -> &DmaBuffer {
        &self.buffer
    }

    /// Signalled when a packet was submitted.
    pub fn submit_event(&self) -> &EventFd {
        &self.submit_evt
    }

    /// Signalled when the client consumed an acknowledgement.
    pub fn ack_freed_event(&self) -> &EventFd {
        &self.ack_freed_evt
    }

    /// Signalled when an acknowledgement is available to the client.
    pub fn ack_avail_event(&self) -> &EventFd {
        &self.ack_avail_evt
    }

    // Client side.

    /// Reserves `size` bytes of the bulk buffer and returns their offset.
    pub fn alloc_packet(&self, size: u64) -> Result<u64> {
        if size == 0 || size > self.buffer_size() {
            return Err(Error::BufferExhausted);
        }

        let mut rings = self.rings();
        let mut candidate = 0u64;
        for (offset, len) in rings.allocations.iter() {
            if candidate + size <= *offset {
                break;
            }
            candidate = offset + len;
        }
        if candidate + size > self.buffer_size() {
            return Err(Error::BufferExhausted);
        }

        rings.allocations.insert(candidate, size);
        Ok(candidate)
    }

    /// Returns the payload range of `packet` to the allocator.
    pub fn release_packet(&self, packet: &PacketDescriptor) {
        self.rings().allocations.remove(&packet.offset());
    }

    /// Puts `packet` into the submit queue.
    pub fn submit_packet(&self, packet: PacketDescriptor) -> Result<()> {
        {
            let mut rings = self.rings();
            if rings.submit.len() >= self.queue_size {
                return Err(Error::SubmitQueueFull);
            }
            rings.submit.push_back(packet);
        }
        Self::signal(&self.submit_evt, "submitted packet");
        Ok(())
    }

    /// Whether an acknowledgement is waiting for the client.
    pub fn ack_avail(&self) -> bool {
        !self.rings().ack.is_empty()
    }

    /// Takes the oldest acknowledgement, freeing its slot.
    pub fn get_acked_packet(&self) -> Option<PacketDescriptor> {
        let packet = self.rings().ack.pop_front();
        if packet.is_some() {
            Self::signal(&self.ack_freed_evt, "freed ack slot");
        }
        packet
    }

    /// Returns a view of the payload of `packet`.
    pub fn packet_buffer(&self, packet: &PacketDescriptor) -> Result<PacketBuffer> {
        let end = packet
            .offset()
            .checked_add(packet.size())
            .ok_or(Error::OutOfBounds)?;
        if end > self.buffer_size() {
            return Err(Error::OutOfBounds);
        }

        Ok(PacketBuffer::new(
            self.buffer.mem().clone(),
            self.packet_phys(packet),
            packet.size() as usize,
        ))
    }

    /// Copies `data` into the payload of `packet`.
    pub fn write_content(&self, packet: &PacketDescriptor, data: &[u8]) -> Result<usize> {
        self.packet_buffer(packet)?
            .write_from(data)
            .map_err(Error::GuestMemory)
    }

    /// Copies the payload of `packet` into `buf`.
    pub fn read_content(&self, packet: &PacketDescriptor, buf: &mut [u8]) -> Result<usize> {
        self.packet_buffer(packet)?
            .read_into(buf)
            .map_err(Error::GuestMemory)
    }

    // Session side.

    /// Whether a submitted packet is waiting.
    pub fn packet_avail(&self) -> bool {
        !self.rings().submit.is_empty()
    }

    /// Takes the oldest submitted packet.
    pub fn get_packet(&self) -> Option<PacketDescriptor> {
        self.rings().submit.pop_front()
    }

    /// Number of free acknowledgement slots.
    pub fn ack_slots_free(&self) -> usize {
        self.queue_size.saturating_sub(self.rings().ack.len())
    }

    /// Whether at least one acknowledgement slot is free.
    pub fn ready_to_ack(&self) -> bool {
        self.ack_slots_free() > 0
    }

    /// Puts `packet` into the acknowledgement queue.
    pub fn acknowledge_packet(&self, packet: PacketDescriptor) -> Result<()> {
        {
            let mut rings = self.rings();
            if rings.ack.len() >= self.queue_size {
                return Err(Error::AckQueueFull);
            }
            rings.ack.push_back(packet);
        }
        Self::signal(&self.ack_avail_evt, "acknowledged packet");
        Ok(())
    }

    /// Guest-physical address of the payload of `packet`, as handed to DMA engines.
    pub fn packet_phys(&self, packet: &PacketDescriptor) -> GuestAddress {
        GuestAddress(self.buffer.base().0 + packet.offset())
    }
}
