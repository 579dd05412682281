// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Session admission.
//!
//! The root owns the one driver all sessions share, and the partition table found on it.
//! Opening a session goes through the following steps, any of which may refuse it:
//!
//! 1. The donated `ram_quota` must cover the session bookkeeping plus the `tx_buf_size` bytes
//!    of the packet buffer.
//! 2. The policy matching the session label, together with the session arguments, resolves to
//!    a [`Grant`](crate::session::Grant) within the device.
//! 3. The grant must not give write access to blocks another writeable session has.
//!
//! Closing a session (dropping it) undoes the registration and returns its packet buffer.

use std::cmp;
use std::fmt;
use std::io::{self, Read, Seek, Write};
use std::mem;
use std::result;
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::driver::{self, lock, Driver, StreamDriver};
use crate::packet::stream::{self, PacketStream};
use crate::partition::{self, PartitionTable};
use crate::session::{args, resolve, Denied, Registry, Session, SessionArgs};

// Smallest amount of bookkeeping memory charged for a session.
const MIN_SESSION_COST: u64 = 4096;

/// Session admission errors.
#[derive(Debug)]
pub enum Error {
    /// The donated quota does not cover the session.
    QuotaExceeded {
        /// Donated quota.
        got: u64,
        /// Quota required for the session including its packet buffer.
        need: u64,
    },
    /// A session needs a packet buffer.
    InvalidBufferSize,
    /// The session arguments are malformed.
    Args(args::Error),
    /// The session is not allowed.
    Denied(Denied),
    /// The driver could not provide the packet buffer.
    Buffer(driver::Error),
    /// Setting up the packet stream failed.
    Stream(stream::Error),
    /// Creating an eventfd or accessing the device image failed.
    Io(io::Error),
    /// The device has no usable partition table.
    Partition(partition::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            QuotaExceeded { got, need } => {
                write!(f, "insufficient quota: got {}, need {}", got, need)
            }
            InvalidBufferSize => write!(f, "packet buffer size must not be zero"),
            Args(e) => write!(f, "{}", e),
            Denied(e) => write!(f, "session denied: {}", e),
            Buffer(e) => write!(f, "{}", e),
            Stream(e) => write!(f, "{}", e),
            Io(e) => write!(f, "{}", e),
            Partition(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<args::Error> for Error {
    fn from(e: args::Error) -> Self {
        Error::Args(e)
    }
}

impl From<Denied> for Error {
    fn from(e: Denied) -> Self {
        Error::Denied(e)
    }
}

/// Root result type.
pub type Result<T> = result::Result<T, Error>;

/// Hands out sessions on a shared driver.
pub struct Root<D: Driver> {
    driver: Arc<Mutex<D>>,
    config: Config,
    table: Option<PartitionTable>,
    registry: Arc<Registry>,
}

impl<D: Driver> Root<D> {
    /// Creates a root without partition table, so policies can only hand out windows of the
    /// whole device.
    pub fn new(driver: D, config: Config) -> Self {
        Root {
            driver: Arc::new(Mutex::new(driver)),
            config,
            table: None,
            registry: Arc::new(Registry::new()),
        }
    }

    /// Makes the partitions of `table` available to policies.
    pub fn with_partition_table(mut self, table: PartitionTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Quota charged for the bookkeeping of one session, on top of its packet buffer.
    pub fn session_cost() -> u64 {
        let size = mem::size_of::<Session<D>>() + mem::size_of::<PacketStream>();
        cmp::max(MIN_SESSION_COST, size as u64)
    }

    /// Opens a session described by an argument string such as
    /// `ram_quota=64K, tx_buf_size=32K, offset=10, label="fs"`.
    pub fn session(&self, args: &str) -> Result<Session<D>> {
        let args = SessionArgs::parse(args)?;
        self.session_with_args(&args)
    }

    /// Opens a session described by parsed arguments.
    pub fn session_with_args(&self, args: &SessionArgs) -> Result<Session<D>> {
        let label = args.label();
        let ram_quota = args.ulong("ram_quota", 0)?;
        let tx_buf_size = args.ulong("tx_buf_size", 0)?;

        if tx_buf_size == 0 {
            error!("Session '{}' denied: no packet buffer requested", label);
            return Err(Error::InvalidBufferSize);
        }
        let cost = Self::session_cost();
        if ram_quota < cost || tx_buf_size > ram_quota - cost {
            error!(
                "Session '{}' denied: insufficient quota, got {}, need {}",
                label,
                ram_quota,
                cost.saturating_add(tx_buf_size)
            );
            return Err(Error::QuotaExceeded {
                got: ram_quota,
                need: cost.saturating_add(tx_buf_size),
            });
        }

        let block_count = lock(&self.driver).block_count();
        let grant = resolve(&self.config, args, self.table.as_ref(), block_count)
            .and_then(|grant| {
                let registration = self.registry.register(&grant)?;
                Ok((grant, registration))
            })
            .map_err(|e| {
                error!("Session '{}' denied: {}", label, e);
                e
            });
        let (grant, registration) = grant?;

        let buffer = lock(&self.driver)
            .alloc_dma_buffer(tx_buf_size as usize)
            .map_err(Error::Buffer)?;
        let release = |e| {
            lock(&self.driver).free_dma_buffer(&buffer);
            e
        };

        let stream = PacketStream::new(buffer.clone(), self.config.queue_size)
            .map_err(Error::Stream)
            .map_err(release)?;
        Session::new(grant, self.driver.clone(), Arc::new(stream), registration)
            .map_err(Error::Io)
            .map_err(release)
    }

    /// Closes `session`, abandoning its outstanding requests.
    pub fn close(&self, session: Session<D>) {
        drop(session);
    }

    /// Returns the shared driver.
    pub fn driver(&self) -> &Arc<Mutex<D>> {
        &self.driver
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the partition table, if the device has one.
    pub fn table(&self) -> Option<&PartitionTable> {
        self.table.as_ref()
    }

    /// Returns the open sessions.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl<B: Read + Seek + Write> Root<StreamDriver<B>> {
    /// Creates a root on a device image, reading its partition table first.
    ///
    /// Fails if the image has no partition table at all.
    pub fn from_image(mut image: B, block_size: u32, config: Config) -> Result<Self> {
        let table = PartitionTable::parse(&mut image, u64::from(block_size), config.use_gpt)
            .map_err(Error::Partition)?;
        let driver = StreamDriver::new(image, block_size).map_err(Error::Io)?;
        Ok(Root::new(driver, config).with_partition_table(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    use crate::config::PolicyEntry;
    use crate::driver::RamDriver;
    use crate::partition::tests::{blank_disk, write_boot_record};

    fn root() -> Root<RamDriver> {
        Root::new(
            RamDriver::new(200, 512),
            Config::default().with_policy(PolicyEntry::default()),
        )
    }

    #[test]
    fn test_quota() {
        let root = root();
        let cost = Root::<RamDriver>::session_cost();
        assert!(cost >= MIN_SESSION_COST);

        let args = format!("ram_quota={}, tx_buf_size=4096", cost + 4095);
        match root.session(&args) {
            Err(Error::QuotaExceeded { got, need }) => {
                assert_eq!((got, need), (cost + 4095, cost + 4096))
            }
            other => panic!("unexpected result {:?}", other.err()),
        }
        match root.session("ram_quota=1K, tx_buf_size=4096") {
            Err(Error::QuotaExceeded { .. }) => (),
            other => panic!("unexpected result {:?}", other.err()),
        }
        match root.session("ram_quota=1M") {
            Err(Error::InvalidBufferSize) => (),
            other => panic!("unexpected result {:?}", other.err()),
        }
        match root.session("ram_quota=1M, tx_buf_size") {
            Err(Error::Args(_)) => (),
            other => panic!("unexpected result {:?}", other.err()),
        }

        let args = format!("ram_quota={}, tx_buf_size=4096", cost + 4096);
        let session = root.session(&args).unwrap();
        assert_eq!(session.stream().buffer_size(), 4096);
        assert_eq!(root.registry().len(), 1);
    }

    #[test]
    fn test_bounds() {
        let root = root();

        match root.session("ram_quota=1M, tx_buf_size=4K, offset=190, span=20") {
            Err(Error::Denied(Denied::SpanOutOfBounds { .. })) => (),
            other => panic!("unexpected result {:?}", other.err()),
        }
        let s = root
            .session("ram_quota=1M, tx_buf_size=4K, offset=190, span=10")
            .unwrap();
        assert_eq!(s.grant().end(), 200);
        root.close(s);
        assert!(root.registry().is_empty());
    }

    #[test]
    fn test_write_conflict() {
        let root = root();

        let a = root
            .session("ram_quota=1M, tx_buf_size=4K, label=a, offset=0, span=100")
            .unwrap();
        match root.session("ram_quota=1M, tx_buf_size=4K, label=b, offset=50, span=100") {
            Err(Error::Denied(Denied::WriteConflict { other })) => assert_eq!(other, "a"),
            other => panic!("unexpected result {:?}", other.err()),
        }
        let _b = root
            .session("ram_quota=1M, tx_buf_size=4K, label=b, offset=50, writeable=no")
            .unwrap();

        drop(a);
        assert_eq!(root.registry().len(), 1);
        let _c = root
            .session("ram_quota=1M, tx_buf_size=4K, label=c, offset=0, span=100")
            .unwrap();
        assert!(root
            .session("ram_quota=1M, tx_buf_size=4K, label=d, offset=0, span=50")
            .is_err());
        assert_eq!(root.registry().len(), 2);
    }

    #[test]
    fn test_from_image() {
        let mut disk = blank_disk(400);
        write_boot_record(&mut disk, 0, &[(0x83, 100, 100), (0x83, 200, 200)]);
        let config = Config::default().with_policy(PolicyEntry {
            label_prefix: Some("home".to_string()),
            partition: Some(2),
            ..Default::default()
        });

        let root = Root::from_image(Cursor::new(disk), 512, config).unwrap();
        assert_eq!(root.table().map(|t| t.len()), Some(2));

        let s = root
            .session("ram_quota=1M, tx_buf_size=4K, label=home, offset=10")
            .unwrap();
        assert_eq!((s.grant().offset, s.grant().span), (210, 190));
        assert_eq!(s.info().block_count, 190);

        match root.session("ram_quota=1M, tx_buf_size=4K, label=other") {
            Err(Error::Denied(Denied::NoPolicy)) => (),
            other => panic!("unexpected result {:?}", other.err()),
        }

        match Root::from_image(Cursor::new(blank_disk(16)), 512, Config::default()) {
            Err(Error::Partition(partition::Error::NoPartitionTable)) => (),
            other => panic!("unexpected result {:?}", other.err()),
        }
    }
}
