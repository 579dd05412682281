// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Partition table parsing.
//!
//! A device image is searched for a GUID partition table and/or a classic boot-sector table,
//! in the order chosen by the caller. The result is an immutable [`PartitionTable`] whose
//! partitions never overlap and never reach past the end of the device.

mod gpt;
mod mbr;

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::result;

use crate::SECTOR_SIZE;

pub use gpt::Guid;

/// Partition table related errors.
#[derive(Debug)]
pub enum Error {
    /// Reading from the device image failed.
    Io(io::Error),
    /// Neither of the requested formats was found on the device.
    NoPartitionTable,
    /// The classic table only holds a whole-disk GPT marker, but GPT was not requested or not
    /// valid. Treating the marker as a normal partition would hand out the whole disk.
    ProtectiveMbr,
    /// The chain of extended boot records loops or is too long.
    InvalidExtendedChain {
        /// Absolute LBA of the record where the walk was aborted.
        lba: u64,
    },
    /// Two partitions claim the same sectors.
    OverlappingPartitions {
        /// Index of the first partition.
        first: u32,
        /// Index of the second partition.
        second: u32,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            Io(e) => write!(f, "failed to read the device image: {}", e),
            NoPartitionTable => write!(f, "no partition table found"),
            ProtectiveMbr => write!(f, "found protective MBR but GPT usage was not requested"),
            InvalidExtendedChain { lba } => {
                write!(f, "malformed extended partition chain at LBA {}", lba)
            }
            OverlappingPartitions { first, second } => {
                write!(f, "partitions {} and {} overlap", first, second)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Partition table result type.
pub type Result<T> = result::Result<T, Error>;

/// On-disk format a table was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableFormat {
    /// Boot-sector table with optional extended chain.
    Classic,
    /// GUID partition table.
    Gpt,
}

/// What the table says about the contents of a partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionKind {
    /// Classic table type byte.
    Classic(u8),
    /// GPT type GUID and partition name.
    Gpt {
        /// Partition type.
        type_guid: Guid,
        /// Human readable name stored in the entry.
        name: String,
    },
}

/// One partition of the device, in absolute sectors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// Index clients use to address the partition.
    pub index: u32,
    /// First sector of the partition.
    pub start_sector: u64,
    /// Number of sectors.
    pub sector_count: u64,
    /// Type information from the table.
    pub kind: PartitionKind,
}

impl Partition {
    /// One past the last sector of the partition.
    pub fn end_sector(&self) -> u64 {
        self.start_sector.saturating_add(self.sector_count)
    }

    /// Checks whether the two partitions share at least one sector.
    pub fn overlaps(&self, other: &Partition) -> bool {
        self.start_sector < other.end_sector() && other.start_sector < self.end_sector()
    }
}

/// Parsed, validated partition table.
#[derive(Clone, Debug)]
pub struct PartitionTable {
    format: TableFormat,
    partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Parses the partition table of `disk`, which uses blocks of `block_size` bytes.
    ///
    /// With `use_gpt` set, a GPT is looked for first and the classic table is the fallback.
    /// Otherwise only the classic table is considered. A protective classic table is always
    /// reported as [`Error::ProtectiveMbr`].
    pub fn parse<D: Read + Seek>(disk: &mut D, block_size: u64, use_gpt: bool) -> Result<Self> {
        if block_size < SECTOR_SIZE {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block size smaller than a boot record",
            )));
        }
        let block_count = disk.seek(SeekFrom::End(0))? / block_size;

        if use_gpt {
            if let Some(partitions) = gpt::parse(disk, block_size)? {
                return PartitionTable::new(TableFormat::Gpt, partitions, block_count);
            }
            debug!("no valid GPT found, falling back to the classic table");
        }

        match mbr::parse(disk, block_size) {
            Ok(Some(partitions)) => PartitionTable::new(TableFormat::Classic, partitions, block_count),
            Ok(None) => {
                error!("Aborting: no partition table found.");
                Err(Error::NoPartitionTable)
            }
            Err(Error::ProtectiveMbr) => {
                if !use_gpt {
                    error!("Aborting: found protective MBR but GPT usage was not requested.");
                } else {
                    error!("Aborting: found protective MBR but the GPT is not valid.");
                }
                Err(Error::ProtectiveMbr)
            }
            Err(e) => Err(e),
        }
    }

    /// Builds a table from already parsed partitions.
    ///
    /// Partitions reaching past `block_count` are dropped, overlapping ones are an error.
    pub fn new(
        format: TableFormat,
        partitions: Vec<Partition>,
        block_count: u64,
    ) -> Result<Self> {
        let mut partitions: Vec<Partition> = partitions
            .into_iter()
            .filter(|p| {
                let fits = p.sector_count > 0 && p.end_sector() <= block_count;
                if !fits {
                    warn!(
                        "ignoring partition {} ({}..{}), device has {} blocks",
                        p.index,
                        p.start_sector,
                        p.end_sector(),
                        block_count
                    );
                }
                fits
            })
            .collect();

        partitions.sort_by_key(|p| p.start_sector);
        for pair in partitions.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(Error::OverlappingPartitions {
                    first: pair[0].index,
                    second: pair[1].index,
                });
            }
        }
        partitions.sort_by_key(|p| p.index);

        for p in partitions.iter() {
            info!(
                "Partition {}: LBA {} ({} blocks) {:?}",
                p.index, p.start_sector, p.sector_count, p.kind
            );
        }

        Ok(PartitionTable { format, partitions })
    }

    /// Returns the format the table was read from.
    pub fn format(&self) -> TableFormat {
        self.format
    }

    /// Looks up a partition by index.
    pub fn partition(&self, index: u32) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.index == index)
    }

    /// Returns all partitions, ordered by index.
    pub fn partitions(&self) -> &[Partition] {
        self.partitions.as_slice()
    }

    /// Number of partitions in the table.
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Whether the table lists no partitions at all.
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

// Reads `count` blocks starting at `lba`.
fn read_blocks<D: Read + Seek>(
    disk: &mut D,
    lba: u64,
    count: u64,
    block_size: u64,
) -> io::Result<Vec<u8>> {
    let offset = lba
        .checked_mul(block_size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "LBA out of range"))?;
    let len = count
        .checked_mul(block_size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "length out of range"))?;

    let mut buf = vec![0u8; len as usize];
    disk.seek(SeekFrom::Start(offset))?;
    disk.read_exact(&mut buf)?;
    Ok(buf)
}

// Reading past the end of the image, or an absurd LBA, just means there is no table.
fn read_or_none<D: Read + Seek>(
    disk: &mut D,
    lba: u64,
    count: u64,
    block_size: u64,
) -> Result<Option<Vec<u8>>> {
    match read_blocks(disk, lba, count, block_size) {
        Ok(buf) => Ok(Some(buf)),
        Err(ref e)
            if e.kind() == io::ErrorKind::UnexpectedEof
                || e.kind() == io::ErrorKind::InvalidInput =>
        {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}
