// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Partition-aware block session multiplexer.
//!
//! This crate hands out block sessions that each see a window of one shared storage device. A
//! session window is usually one partition of the device, looked up in the on-disk partition
//! table (classic boot-sector layout or GPT). The pieces, leaves first:
//!
//! * [`partition`] parses the partition table from a raw device image.
//! * [`driver`] is the contract a concrete storage driver implements so sessions can dispatch
//!   requests to it, along with two ready-made drivers.
//! * [`packet`] describes block requests and the bounded submit/acknowledgement ring pair a
//!   client shares with its session.
//! * [`session`] resolves a client's request into a [`Grant`](session::Grant), arbitrates it
//!   against the other live sessions, and runs the per-session request state machine.
//! * [`root`] ties everything together and admits or refuses new sessions.
//!
//! All sessions share one backend. Dispatching never blocks: a backend that cannot accept more
//! work answers with [`Dispatch::RequestCongestion`](driver::Dispatch::RequestCongestion), and
//! the session holds on to that one request until the backend makes progress.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

pub mod config;
pub mod driver;
pub mod packet;
pub mod partition;
pub mod root;
pub mod session;

pub use config::Config;
pub use driver::{Dispatch, Driver, Operations, Request};
pub use packet::stream::PacketStream;
pub use packet::{Operation, PacketDescriptor};
pub use partition::{Partition, PartitionTable};
pub use root::Root;
pub use session::{Grant, Session};

/// Shift of the default block size.
pub const SECTOR_SHIFT: u8 = 9;
/// Block size assumed for partition tables when the device does not say otherwise.
pub const SECTOR_SIZE: u64 = (0x01 as u64) << SECTOR_SHIFT;
