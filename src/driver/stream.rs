// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::io::{self, Read, Seek, SeekFrom, Write};

use super::{Dispatch, Driver, Request};
use crate::packet::PacketBuffer;

/// Synchronous driver over anything seekable, such as a disk image file.
///
/// Every request is carried out before the dispatch call returns, so this driver never reports
/// congestion.
pub struct StreamDriver<B> {
    backend: B,
    block_size: u32,
    block_count: u64,
}

impl<B: Read + Seek + Write> StreamDriver<B> {
    /// Wraps `backend`, which is split into blocks of `block_size` bytes.
    pub fn new(mut backend: B, block_size: u32) -> io::Result<Self> {
        if block_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block size must not be zero",
            ));
        }
        let len = backend.seek(SeekFrom::End(0))?;

        Ok(StreamDriver {
            backend,
            block_size,
            block_count: len / u64::from(block_size),
        })
    }

    /// Returns the wrapped backend.
    pub fn into_inner(self) -> B {
        self.backend
    }

    fn byte_range(&self, block_number: u64, block_count: u64) -> Option<(u64, usize)> {
        let end = block_number.checked_add(block_count)?;
        if end > self.block_count {
            return None;
        }
        let bs = u64::from(self.block_size);
        Some((block_number * bs, (block_count * bs) as usize))
    }

    fn transfer(
        &mut self,
        write: bool,
        block_number: u64,
        block_count: u64,
        buffer: &PacketBuffer,
    ) -> io::Result<()> {
        let (pos, len) = self
            .byte_range(block_number, block_count)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "beyond device end"))?;
        if buffer.len() < len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "payload smaller than the requested blocks",
            ));
        }

        let mut data = vec![0u8; len];
        self.backend.seek(SeekFrom::Start(pos))?;
        if write {
            buffer
                .read_into(&mut data)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            self.backend.write_all(&data)
        } else {
            self.backend.read_exact(&mut data)?;
            buffer
                .write_from(&data)
                .map(|_| ())
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        }
    }

    fn execute(
        &mut self,
        write: bool,
        block_number: u64,
        block_count: u64,
        buffer: PacketBuffer,
        request: Request,
    ) -> Dispatch {
        match self.transfer(write, block_number, block_count, &buffer) {
            Ok(()) => {
                request.complete(true);
                Dispatch::Dispatched
            }
            Err(e) => {
                error!(
                    "Failed to {} blocks {}+{}: {}",
                    if write { "write" } else { "read" },
                    block_number,
                    block_count,
                    e
                );
                Dispatch::IoError(request)
            }
        }
    }
}

impl<B: Read + Seek + Write> Driver for StreamDriver<B> {
    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read(
        &mut self,
        block_number: u64,
        block_count: u64,
        buffer: PacketBuffer,
        request: Request,
    ) -> Dispatch {
        self.execute(false, block_number, block_count, buffer, request)
    }

    fn write(
        &mut self,
        block_number: u64,
        block_count: u64,
        buffer: PacketBuffer,
        request: Request,
    ) -> Dispatch {
        self.execute(true, block_number, block_count, buffer, request)
    }

    fn sync(&mut self) {
        if let Err(e) = self.backend.flush() {
            error!("Failed to flush backend: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;
    use std::sync::Arc;

    use vm_memory::GuestAddress;
    use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

    use crate::driver::{Completer, DmaBuffer};
    use crate::packet::{Operation, PacketDescriptor};

    #[test]
    fn test_stream_driver() {
        let mut image = vec![0u8; 8 * 512];
        image[3 * 512..4 * 512].copy_from_slice(&[0x5a; 512]);
        let mut driver = StreamDriver::new(Cursor::new(image), 512).unwrap();
        assert_eq!(driver.block_count(), 8);
        assert!(!driver.dma_enabled());

        let buf = DmaBuffer::anonymous(GuestAddress(0), 0x1000).unwrap();
        let (completer, completions) = Completer::new(Arc::new(EventFd::new(EFD_NONBLOCK).unwrap()));

        let read = PacketDescriptor::new(Operation::Read, 3, 1, 0, 512);
        let view = PacketBuffer::new(buf.mem().clone(), GuestAddress(0), 512);
        match driver.read(3, 1, view.clone(), Request::new(read, completer.clone())) {
            Dispatch::Dispatched => (),
            other => panic!("unexpected dispatch {:?}", other),
        }
        assert!(completions.try_recv().unwrap().success);
        let mut out = [0u8; 512];
        view.read_into(&mut out).unwrap();
        assert!(out.iter().all(|b| *b == 0x5a));

        let write = PacketDescriptor::new(Operation::Write, 7, 1, 0, 512);
        match driver.write(7, 1, view.clone(), Request::new(write, completer.clone())) {
            Dispatch::Dispatched => (),
            other => panic!("unexpected dispatch {:?}", other),
        }
        assert!(completions.try_recv().unwrap().success);

        match driver.write(8, 1, view, Request::new(write, completer)) {
            Dispatch::IoError(request) => assert_eq!(*request.packet(), write),
            other => panic!("unexpected dispatch {:?}", other),
        }
        assert!(completions.try_recv().is_err());

        driver.sync();
        let image = driver.into_inner().into_inner();
        assert!(image[7 * 512..].iter().all(|b| *b == 0x5a));
    }
}
