// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::collections::VecDeque;

use vm_memory::{Bytes, GuestAddress};

use super::{Completer, DmaBuffer, Dispatch, Driver, Request, Result};
use crate::packet::{Operation, PacketBuffer};

// DMA buffers are placed above this address, each aligned to a page.
const DMA_BASE: u64 = 0x1000_0000;
const DMA_ALIGN: u64 = 0x1000;

enum Target {
    Buffer(PacketBuffer),
    Dma(GuestAddress),
}

struct Job {
    operation: Operation,
    block_number: u64,
    block_count: u64,
    target: Target,
    request: Request,
}

/// Memory backed driver.
///
/// By default requests are carried out immediately. With a queue depth set, accepted requests
/// wait in a queue of that depth until [`complete_next`](RamDriver::complete_next) or
/// [`complete_all`](RamDriver::complete_all) runs them, and a full queue answers with
/// [`Dispatch::RequestCongestion`].
pub struct RamDriver {
    data: Vec<u8>,
    block_size: u32,
    dma: bool,
    queue_depth: Option<usize>,
    queue: VecDeque<Job>,
    dma_buffers: Vec<DmaBuffer>,
    next_dma_base: u64,
    bad_blocks: Option<(u64, u64)>,
    dispatched: Vec<(Operation, u64, u64)>,
    // Sessions turned away because of a full queue.
    waiters: Vec<Completer>,
}

impl RamDriver {
    /// Creates a zeroed device of `block_count` blocks.
    pub fn new(block_count: u64, block_size: u32) -> Self {
        RamDriver {
            data: vec![0u8; (block_count * u64::from(block_size)) as usize],
            block_size,
            dma: false,
            queue_depth: None,
            queue: VecDeque::new(),
            dma_buffers: Vec::new(),
            next_dma_base: DMA_BASE,
            bad_blocks: None,
            dispatched: Vec::new(),
            waiters: Vec::new(),
        }
    }

    /// Routes requests through the DMA path.
    pub fn with_dma(mut self, dma: bool) -> Self {
        self.dma = dma;
        self
    }

    /// Defers requests into a queue holding at most `depth` of them.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    /// Fails every request touching blocks `start..end`.
    pub fn with_bad_blocks(mut self, start: u64, end: u64) -> Self {
        self.bad_blocks = Some((start, end));
        self
    }

    /// Device contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable device contents.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Accepted requests as (operation, first block, block count), in dispatch order.
    pub fn dispatched(&self) -> &[(Operation, u64, u64)] {
        &self.dispatched
    }

    /// Number of accepted requests not completed yet.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Number of DMA buffers currently handed out.
    pub fn dma_buffers(&self) -> usize {
        self.dma_buffers.len()
    }

    /// Carries out the oldest queued request, then wakes every session that was turned away
    /// while the queue was full. Returns `false` if the queue was empty.
    pub fn complete_next(&mut self) -> bool {
        match self.queue.pop_front() {
            Some(job) => {
                self.execute(job);
                for waiter in self.waiters.drain(..) {
                    waiter.notify_ready();
                }
                true
            }
            None => false,
        }
    }

    /// Carries out all queued requests, returning how many there were.
    pub fn complete_all(&mut self) -> usize {
        let mut n = 0;
        while self.complete_next() {
            n += 1;
        }
        n
    }

    fn byte_range(&self, block_number: u64, block_count: u64) -> Option<(usize, usize)> {
        let end = block_number
            .checked_add(block_count)?
            .checked_mul(u64::from(self.block_size))?;
        if end > self.data.len() as u64 {
            return None;
        }
        let bs = self.block_size as usize;
        Some((block_number as usize * bs, block_count as usize * bs))
    }

    fn is_bad(&self, block_number: u64, block_count: u64) -> bool {
        match self.bad_blocks {
            Some((start, end)) => block_number < end && start < block_number + block_count,
            None => false,
        }
    }

    fn transfer(&mut self, job: &Job) -> bool {
        let (pos, len) = match self.byte_range(job.block_number, job.block_count) {
            Some(range) => range,
            None => return false,
        };
        let write = job.operation == Operation::Write;

        match &job.target {
            Target::Buffer(buffer) if write => buffer
                .read_into(&mut self.data[pos..pos + len])
                .map(|n| n == len)
                .unwrap_or(false),
            Target::Buffer(buffer) => buffer
                .write_from(&self.data[pos..pos + len])
                .map(|n| n == len)
                .unwrap_or(false),
            Target::Dma(phys) => {
                let buffer = match self.dma_buffers.iter().find(|b| b.contains(*phys, len)) {
                    Some(buffer) => buffer,
                    None => {
                        error!("DMA address {:#x} is not in any buffer", phys.0);
                        return false;
                    }
                };
                let res = if write {
                    buffer.mem().read_slice(&mut self.data[pos..pos + len], *phys)
                } else {
                    buffer.mem().write_slice(&self.data[pos..pos + len], *phys)
                };
                res.is_ok()
            }
        }
    }

    fn execute(&mut self, job: Job) {
        let success = self.transfer(&job);
        job.request.complete(success);
    }

    fn submit(
        &mut self,
        operation: Operation,
        block_number: u64,
        block_count: u64,
        target: Target,
        request: Request,
    ) -> Dispatch {
        if self.byte_range(block_number, block_count).is_none()
            || self.is_bad(block_number, block_count)
        {
            return Dispatch::IoError(request);
        }

        let job = Job {
            operation,
            block_number,
            block_count,
            target,
            request,
        };

        match self.queue_depth {
            Some(depth) if self.queue.len() >= depth => {
                self.waiters.push(job.request.completer().clone());
                return Dispatch::RequestCongestion(job.request);
            }
            Some(_) => self.queue.push_back(job),
            None => self.execute(job),
        }

        self.dispatched.push((operation, block_number, block_count));
        Dispatch::Dispatched
    }
}

impl Driver for RamDriver {
    fn block_count(&self) -> u64 {
        self.data.len() as u64 / u64::from(self.block_size)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn dma_enabled(&self) -> bool {
        self.dma
    }

    fn read(
        &mut self,
        block_number: u64,
        block_count: u64,
        buffer: PacketBuffer,
        request: Request,
    ) -> Dispatch {
        self.submit(
            Operation::Read,
            block_number,
            block_count,
            Target::Buffer(buffer),
            request,
        )
    }

    fn write(
        &mut self,
        block_number: u64,
        block_count: u64,
        buffer: PacketBuffer,
        request: Request,
    ) -> Dispatch {
        self.submit(
            Operation::Write,
            block_number,
            block_count,
            Target::Buffer(buffer),
            request,
        )
    }

    fn read_dma(
        &mut self,
        block_number: u64,
        block_count: u64,
        phys: GuestAddress,
        request: Request,
    ) -> Dispatch {
        self.submit(
            Operation::Read,
            block_number,
            block_count,
            Target::Dma(phys),
            request,
        )
    }

    fn write_dma(
        &mut self,
        block_number: u64,
        block_count: u64,
        phys: GuestAddress,
        request: Request,
    ) -> Dispatch {
        self.submit(
            Operation::Write,
            block_number,
            block_count,
            Target::Dma(phys),
            request,
        )
    }

    fn alloc_dma_buffer(&mut self, size: usize) -> Result<DmaBuffer> {
        let buffer = DmaBuffer::anonymous(GuestAddress(self.next_dma_base), size)?;
        let aligned = (size as u64 + DMA_ALIGN - 1) & !(DMA_ALIGN - 1);
        self.next_dma_base += aligned;
        self.dma_buffers.push(buffer.clone());
        Ok(buffer)
    }

    fn free_dma_buffer(&mut self, buffer: &DmaBuffer) {
        self.dma_buffers.retain(|b| b.base() != buffer.base());
    }
}
