// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The per-session request state machine.
//!
//! A session takes packets off the submit queue of its stream, checks them against its grant,
//! and hands them to the shared driver. Two conditions stop it from taking more packets: the
//! driver refused a request because its queue is full (the request is then kept and retried
//! before anything else), or every free acknowledgement slot is already spoken for by a packet
//! in flight.

use std::io;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use event_manager::{EventOps, EventSet, Events, MutEventSubscriber};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use super::policy::Grant;
use super::registry::Registration;
use crate::driver::{lock, Completer, Completion, Dispatch, Driver, Operations, Request};
use crate::packet::stream::PacketStream;
use crate::packet::{Operation, PacketDescriptor};

const SUBMIT_EVENT: u32 = 0;
const ACK_FREED_EVENT: u32 = 1;
const COMPLETION_EVENT: u32 = 2;

/// What a client learns about its session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Info {
    /// Number of blocks visible to the session.
    pub block_count: u64,
    /// Size of one block in bytes.
    pub block_size: u32,
    /// Operations the session may issue.
    pub operations: Operations,
}

/// One client session on the shared driver.
pub struct Session<D: Driver> {
    grant: Grant,
    driver: Arc<Mutex<D>>,
    stream: Arc<PacketStream>,
    block_size: u32,
    operations: Operations,
    dma: bool,
    completer: Completer,
    completions: Receiver<Completion>,
    completion_evt: Arc<EventFd>,
    in_flight: usize,
    driver_congested: bool,
    ack_queue_full: bool,
    pending: Option<Request>,
    _registration: Registration,
}

impl<D: Driver> Session<D> {
    pub(crate) fn new(
        grant: Grant,
        driver: Arc<Mutex<D>>,
        stream: Arc<PacketStream>,
        registration: Registration,
    ) -> io::Result<Self> {
        let completion_evt = Arc::new(EventFd::new(EFD_NONBLOCK)?);
        let (completer, completions) = Completer::new(completion_evt.clone());

        let (block_size, supported, dma) = {
            let driver = lock(&driver);
            (driver.block_size(), driver.operations(), driver.dma_enabled())
        };
        let operations = Operations {
            read: supported.read && grant.readable,
            write: supported.write && grant.writeable,
        };

        info!(
            "Opened session '{}': blocks [{}, {}), {}{}",
            grant.label,
            grant.offset,
            grant.end(),
            if operations.read { "r" } else { "-" },
            if operations.write { "w" } else { "-" },
        );

        Ok(Session {
            grant,
            driver,
            stream,
            block_size,
            operations,
            dma,
            completer,
            completions,
            completion_evt,
            in_flight: 0,
            driver_congested: false,
            ack_queue_full: false,
            pending: None,
            _registration: registration,
        })
    }

    /// Returns the grant the session was opened with.
    pub fn grant(&self) -> &Grant {
        &self.grant
    }

    /// Returns the session label.
    pub fn label(&self) -> &str {
        &self.grant.label
    }

    /// Returns the stream shared with the client.
    pub fn stream(&self) -> &Arc<PacketStream> {
        &self.stream
    }

    /// Signalled when the driver completed a request of this session, or has room again.
    pub fn completion_event(&self) -> &EventFd {
        &self.completion_evt
    }

    /// Geometry and permissions as seen by the client.
    pub fn info(&self) -> Info {
        Info {
            block_count: self.grant.span,
            block_size: self.block_size,
            operations: self.operations,
        }
    }

    /// Number of packets taken off the submit queue and not acknowledged yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Whether a request refused by the driver is waiting to be retried.
    pub fn driver_congested(&self) -> bool {
        self.driver_congested
    }

    /// Whether taking another packet could overrun the acknowledgement queue.
    pub fn ack_queue_full(&self) -> bool {
        self.ack_queue_full
    }

    /// Flushes the driver.
    pub fn sync(&self) {
        lock(&self.driver).sync();
    }

    /// Handles newly submitted packets.
    pub fn process_submitted(&mut self) {
        self.drain();
    }

    /// Handles acknowledgement slots freed by the client.
    pub fn process_ack_freed(&mut self) {
        self.resume();
    }

    /// Handles requests the driver finished, or a driver that has room again.
    pub fn process_completions(&mut self) {
        self.resume();
    }

    fn acknowledge(&mut self, mut packet: PacketDescriptor, success: bool) {
        packet.set_succeeded(success);
        if let Err(e) = self.stream.acknowledge_packet(packet) {
            error!("Session '{}': lost acknowledgement: {}", self.grant.label, e);
        }
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    fn collect_completions(&mut self) {
        while let Ok(Completion { packet, success }) = self.completions.try_recv() {
            self.acknowledge(packet, success);
        }
    }

    fn check(&self, packet: &PacketDescriptor) -> Result<(), &'static str> {
        if packet.size() == 0 {
            return Err("empty payload");
        }
        if packet.block_count() == 0 {
            return Err("no blocks");
        }

        let end = packet.block_number().checked_add(packet.block_count());
        if end.map_or(true, |end| end > self.grant.span) {
            return Err("blocks outside of the session window");
        }

        match packet.operation() {
            Operation::Unsupported(_) => return Err("unsupported operation"),
            op if !self.operations.supports(op) => return Err("operation not permitted"),
            _ => (),
        }

        let needed = packet
            .block_count()
            .checked_mul(u64::from(self.block_size));
        if needed.map_or(true, |needed| packet.size() < needed) {
            return Err("payload smaller than the blocks");
        }
        let payload_end = packet.offset().checked_add(packet.size());
        if payload_end.map_or(true, |end| end > self.stream.buffer_size()) {
            return Err("payload outside of the packet buffer");
        }

        Ok(())
    }

    fn dispatch(&mut self, request: Request) {
        let packet = *request.packet();
        let block_number = self.grant.offset + packet.block_number();
        let block_count = packet.block_count();

        let dispatch = {
            let mut driver = lock(&self.driver);
            if self.dma {
                let phys = self.stream.packet_phys(&packet);
                match packet.operation() {
                    Operation::Read => driver.read_dma(block_number, block_count, phys, request),
                    Operation::Write => driver.write_dma(block_number, block_count, phys, request),
                    Operation::Unsupported(_) => Dispatch::IoError(request),
                }
            } else {
                match self.stream.packet_buffer(&packet) {
                    Ok(buffer) => match packet.operation() {
                        Operation::Read => driver.read(block_number, block_count, buffer, request),
                        Operation::Write => {
                            driver.write(block_number, block_count, buffer, request)
                        }
                        Operation::Unsupported(_) => Dispatch::IoError(request),
                    },
                    Err(_) => Dispatch::IoError(request),
                }
            }
        };

        match dispatch {
            Dispatch::Dispatched => (),
            Dispatch::RequestCongestion(request) => {
                debug!("Session '{}': driver congested", self.grant.label);
                self.driver_congested = true;
                self.pending = Some(request);
            }
            Dispatch::IoError(request) => {
                debug!(
                    "Session '{}': driver rejected blocks {}+{}",
                    self.grant.label, block_number, block_count
                );
                self.acknowledge(request.into_packet(), false);
            }
        }
    }

    fn drain(&mut self) {
        loop {
            self.collect_completions();
            if self.driver_congested {
                break;
            }

            self.ack_queue_full = self.in_flight >= self.stream.ack_slots_free();
            if self.ack_queue_full {
                break;
            }

            let packet = match self.stream.get_packet() {
                Some(packet) => packet,
                None => break,
            };
            self.in_flight += 1;

            match self.check(&packet) {
                Ok(()) => self.dispatch(Request::new(packet, self.completer.clone())),
                Err(reason) => {
                    debug!(
                        "Session '{}': rejecting packet {:?}: {}",
                        self.grant.label, packet, reason
                    );
                    self.acknowledge(packet, false);
                }
            }
        }
    }

    fn resume(&mut self) {
        self.collect_completions();

        if let Some(request) = self.pending.take() {
            self.driver_congested = false;
            self.dispatch(request);
            if self.driver_congested {
                return;
            }
            debug!("Session '{}': driver congestion resolved", self.grant.label);
        }

        self.drain();
    }
}

fn consume(evt: &EventFd) {
    if let Err(e) = evt.read() {
        if e.kind() != io::ErrorKind::WouldBlock {
            error!("Failed to read eventfd: {:?}", e);
        }
    }
}

impl<D: Driver> MutEventSubscriber for Session<D> {
    fn process(&mut self, events: Events, _ops: &mut EventOps) {
        match events.data() {
            SUBMIT_EVENT => {
                consume(self.stream.submit_event());
                self.process_submitted();
            }
            ACK_FREED_EVENT => {
                consume(self.stream.ack_freed_event());
                self.process_ack_freed();
            }
            COMPLETION_EVENT => {
                consume(&self.completion_evt);
                self.process_completions();
            }
            data => warn!("Session '{}': unexpected event {}", self.grant.label, data),
        }
    }

    fn init(&mut self, ops: &mut EventOps) {
        let events = vec![
            Events::with_data(self.stream.submit_event(), SUBMIT_EVENT, EventSet::IN),
            Events::with_data(self.stream.ack_freed_event(), ACK_FREED_EVENT, EventSet::IN),
            Events::with_data(self.completion_evt.as_ref(), COMPLETION_EVENT, EventSet::IN),
        ];
        for events in events {
            if let Err(e) = ops.add(events) {
                error!("Session '{}': failed to register event: {:?}", self.grant.label, e);
            }
        }
    }
}

impl<D: Driver> Drop for Session<D> {
    fn drop(&mut self) {
        if self.in_flight > 0 {
            debug!(
                "Session '{}': abandoning {} requests",
                self.grant.label, self.in_flight
            );
        }
        lock(&self.driver).free_dma_buffer(self.stream.buffer());
        info!("Closed session '{}'", self.grant.label);
    }
}
