// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The contract between sessions and the storage driver backing them.
//!
//! A driver is asked to carry out one request at a time through [`Driver::read`],
//! [`Driver::write`], or their DMA counterparts. It either accepts the request and completes it
//! later (or right away) through [`Request::complete`], or hands the request back, telling the
//! session that its queue is full or that the request cannot be carried out.

mod ram;
mod stream;

pub use ram::RamDriver;
pub use stream::StreamDriver;

use std::fmt;
use std::result;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vm_memory::{mmap, GuestAddress, GuestMemoryMmap};
use vmm_sys_util::eventfd::EventFd;

use crate::packet::{Operation, PacketBuffer, PacketDescriptor};

/// Driver related errors.
#[derive(Debug)]
pub enum Error {
    /// Mapping memory for a DMA buffer failed.
    Mmap(mmap::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Mmap(e) => write!(f, "failed to map DMA buffer: {}", e),
        }
    }
}

impl std::error::Error for Error {}

/// Driver result type.
pub type Result<T> = result::Result<T, Error>;

/// Operations a driver (or a session) supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Operations {
    /// Blocks can be read.
    pub read: bool,
    /// Blocks can be written.
    pub write: bool,
}

impl Operations {
    /// Reading and writing.
    pub const READ_WRITE: Operations = Operations {
        read: true,
        write: true,
    };

    /// Checks whether `op` is among the supported operations.
    pub fn supports(&self, op: Operation) -> bool {
        match op {
            Operation::Read => self.read,
            Operation::Write => self.write,
            Operation::Unsupported(_) => false,
        }
    }
}

/// Outcome of handing a request to a driver.
///
/// A refused request is handed back, so a driver can never both refuse and complete it.
#[must_use]
#[derive(Debug)]
pub enum Dispatch {
    /// The driver accepted the request and will complete it.
    Dispatched,
    /// The driver's queue is full. Retry the request once the driver made progress.
    RequestCongestion(Request),
    /// The driver cannot carry out the request.
    IoError(Request),
}

/// A finished request, as delivered to the session that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    /// The original request.
    pub packet: PacketDescriptor,
    /// Whether the driver carried it out.
    pub success: bool,
}

/// Per-session completion handle.
///
/// Completions are queued and the session is woken through its eventfd; nothing is called back
/// directly. Completions for a session that is already gone are dropped.
#[derive(Clone, Debug)]
pub struct Completer {
    sender: Sender<Completion>,
    evt: Arc<EventFd>,
}

impl Completer {
    /// Creates a handle signalling `evt`, and the receiving end its session drains.
    pub fn new(evt: Arc<EventFd>) -> (Completer, Receiver<Completion>) {
        let (sender, receiver) = mpsc::channel();
        (Completer { sender, evt }, receiver)
    }

    fn wake(&self) {
        if let Err(e) = self.evt.write(1) {
            error!("Failed to signal completion: {:?}", e);
        }
    }

    /// Reports `packet` as finished.
    pub fn complete(&self, packet: PacketDescriptor, success: bool) {
        if self.sender.send(Completion { packet, success }).is_err() {
            debug!("dropping completion for closed session");
            return;
        }
        self.wake();
    }

    /// Tells the session that the driver has room again, without completing anything.
    pub fn notify_ready(&self) {
        self.wake();
    }
}

/// A request handed to a driver. It completes exactly once, by being consumed.
#[derive(Debug)]
pub struct Request {
    packet: PacketDescriptor,
    completer: Completer,
}

impl Request {
    /// Wraps `packet`, to be reported to `completer`.
    pub fn new(packet: PacketDescriptor, completer: Completer) -> Self {
        Request { packet, completer }
    }

    /// Returns the original packet.
    pub fn packet(&self) -> &PacketDescriptor {
        &self.packet
    }

    /// Returns the completion handle of the issuing session.
    pub fn completer(&self) -> &Completer {
        &self.completer
    }

    /// Reports the request as finished.
    pub fn complete(self, success: bool) {
        self.completer.complete(self.packet, success);
    }

    /// Gives up the request without reporting it, returning the packet.
    pub fn into_packet(self) -> PacketDescriptor {
        self.packet
    }
}

/// Memory shared between a session, its client, and the driver.
///
/// The buffer spans `size` bytes starting at guest-physical address `base`. Drivers with a DMA
/// engine hand out distinct bases so a physical address identifies the buffer.
#[derive(Clone, Debug)]
pub struct DmaBuffer {
    mem: GuestMemoryMmap,
    base: GuestAddress,
    size: usize,
}

impl DmaBuffer {
    /// Maps `size` bytes of anonymous memory at `base`.
    pub fn anonymous(base: GuestAddress, size: usize) -> Result<Self> {
        let mem = GuestMemoryMmap::from_ranges(&[(base, size)]).map_err(Error::Mmap)?;
        Ok(DmaBuffer { mem, base, size })
    }

    /// Returns the backing memory.
    pub fn mem(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    /// Returns the guest-physical address of the first byte.
    pub fn base(&self) -> GuestAddress {
        self.base
    }

    /// Returns the size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Checks whether `len` bytes at `addr` lie within the buffer.
    pub fn contains(&self, addr: GuestAddress, len: usize) -> bool {
        addr.0 >= self.base.0
            && addr
                .0
                .checked_add(len as u64)
                .map_or(false, |end| end <= self.base.0 + self.size as u64)
    }
}

/// The storage driver interface.
///
/// Block numbers passed to the dispatch methods are absolute device blocks. Any dispatch method
/// returning [`Dispatch::Dispatched`] takes responsibility for completing the request exactly
/// once; it may do so before returning.
pub trait Driver {
    /// Number of blocks of the device.
    fn block_count(&self) -> u64;

    /// Size of one block in bytes.
    fn block_size(&self) -> u32;

    /// Operations the device supports.
    fn operations(&self) -> Operations {
        Operations::READ_WRITE
    }

    /// Whether requests should go through [`read_dma`](Driver::read_dma) and
    /// [`write_dma`](Driver::write_dma) rather than the buffer path.
    fn dma_enabled(&self) -> bool {
        false
    }

    /// Reads `block_count` blocks starting at `block_number` into `buffer`.
    fn read(
        &mut self,
        block_number: u64,
        block_count: u64,
        buffer: PacketBuffer,
        request: Request,
    ) -> Dispatch;

    /// Writes `block_count` blocks starting at `block_number` from `buffer`.
    fn write(
        &mut self,
        block_number: u64,
        block_count: u64,
        buffer: PacketBuffer,
        request: Request,
    ) -> Dispatch;

    /// Reads blocks straight into guest-physical memory at `phys`.
    fn read_dma(
        &mut self,
        _block_number: u64,
        _block_count: u64,
        _phys: GuestAddress,
        request: Request,
    ) -> Dispatch {
        Dispatch::IoError(request)
    }

    /// Writes blocks straight from guest-physical memory at `phys`.
    fn write_dma(
        &mut self,
        _block_number: u64,
        _block_count: u64,
        _phys: GuestAddress,
        request: Request,
    ) -> Dispatch {
        Dispatch::IoError(request)
    }

    /// Flushes any write cache.
    fn sync(&mut self) {}

    /// Allocates the shared buffer for a new session.
    fn alloc_dma_buffer(&mut self, size: usize) -> Result<DmaBuffer> {
        DmaBuffer::anonymous(GuestAddress(0), size)
    }

    /// Releases a buffer handed out by [`alloc_dma_buffer`](Driver::alloc_dma_buffer).
    fn free_dma_buffer(&mut self, _buffer: &DmaBuffer) {}
}

// The backend is shared by every session; a panicking holder does not invalidate it.
pub(crate) fn lock<D>(driver: &Mutex<D>) -> MutexGuard<D> {
    driver.lock().unwrap_or_else(PoisonError::into_inner)
}
