// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Classic boot-sector partition table.
//!
//! The boot record holds four primary entries. An entry of extended type points to a chain of
//! extended boot records, each describing one logical partition and the location of the next
//! record in the chain.

use std::collections::HashSet;
use std::io::{Read, Seek};

use byteorder::{ByteOrder, LittleEndian};

use super::{read_blocks, read_or_none, Error, Partition, PartitionKind, Result};

const ENTRY_TABLE_OFFSET: usize = 446;
const ENTRY_SIZE: usize = 16;
const PRIMARY_ENTRIES: usize = 4;
const SIGNATURE_OFFSET: usize = 510;
const SIGNATURE: [u8; 2] = [0x55, 0xaa];

const TYPE_EMPTY: u8 = 0x00;
const TYPE_EXTENDED_CHS: u8 = 0x05;
const TYPE_EXTENDED_LBA: u8 = 0x0f;
const TYPE_EXTENDED_LINUX: u8 = 0x85;
const TYPE_PROTECTIVE: u8 = 0xee;

// Logical partitions are numbered after the four primary slots.
const FIRST_LOGICAL_INDEX: u32 = 5;
const MAX_CHAIN_LINKS: usize = 256;

#[derive(Clone, Copy, Debug)]
struct Entry {
    kind: u8,
    lba: u32,
    sectors: u32,
}

impl Entry {
    fn parse(record: &[u8], slot: usize) -> Entry {
        let raw = &record[ENTRY_TABLE_OFFSET + slot * ENTRY_SIZE..][..ENTRY_SIZE];
        Entry {
            kind: raw[4],
            lba: LittleEndian::read_u32(&raw[8..12]),
            sectors: LittleEndian::read_u32(&raw[12..16]),
        }
    }

    fn is_used(&self) -> bool {
        self.kind != TYPE_EMPTY && self.sectors != 0
    }

    fn is_extended(&self) -> bool {
        match self.kind {
            TYPE_EXTENDED_CHS | TYPE_EXTENDED_LBA | TYPE_EXTENDED_LINUX => true,
            _ => false,
        }
    }

    fn is_protective(&self) -> bool {
        self.kind == TYPE_PROTECTIVE
    }
}

fn has_signature(record: &[u8]) -> bool {
    record[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 2] == SIGNATURE
}

/// Parses the classic table, returning `None` when the boot record carries no signature.
pub(super) fn parse<D: Read + Seek>(disk: &mut D, block_size: u64) -> Result<Option<Vec<Partition>>> {
    let record = match read_or_none(disk, 0, 1, block_size)? {
        Some(record) => record,
        None => return Ok(None),
    };
    if !has_signature(&record) {
        return Ok(None);
    }

    let entries: Vec<Entry> = (0..PRIMARY_ENTRIES)
        .map(|slot| Entry::parse(&record, slot))
        .collect();

    if entries.iter().any(Entry::is_protective) {
        return Err(Error::ProtectiveMbr);
    }

    let mut partitions = Vec::new();
    let mut next_logical = FIRST_LOGICAL_INDEX;

    for (slot, entry) in entries.iter().enumerate() {
        if !entry.is_used() {
            continue;
        }

        if entry.is_extended() {
            walk_extended(
                disk,
                block_size,
                u64::from(entry.lba),
                &mut next_logical,
                &mut partitions,
            )?;
            continue;
        }

        partitions.push(Partition {
            index: slot as u32 + 1,
            start_sector: u64::from(entry.lba),
            sector_count: u64::from(entry.sectors),
            kind: PartitionKind::Classic(entry.kind),
        });
    }

    Ok(Some(partitions))
}

// Follows the extended boot record chain starting at the container at `base`. Logical entries
// are relative to their own record, links are relative to `base`.
fn walk_extended<D: Read + Seek>(
    disk: &mut D,
    block_size: u64,
    base: u64,
    next_index: &mut u32,
    partitions: &mut Vec<Partition>,
) -> Result<()> {
    let mut visited = HashSet::new();
    let mut lba = base;

    for _ in 0..MAX_CHAIN_LINKS {
        if !visited.insert(lba) {
            error!("extended partition chain loops back to LBA {}", lba);
            return Err(Error::InvalidExtendedChain { lba });
        }

        let record = read_blocks(disk, lba, 1, block_size)?;
        if !has_signature(&record) {
            warn!("extended boot record at LBA {} has no signature, chain truncated", lba);
            return Ok(());
        }

        let logical = Entry::parse(&record, 0);
        let link = Entry::parse(&record, 1);

        if logical.is_used() {
            partitions.push(Partition {
                index: *next_index,
                start_sector: lba + u64::from(logical.lba),
                sector_count: u64::from(logical.sectors),
                kind: PartitionKind::Classic(logical.kind),
            });
            *next_index += 1;
        }

        if link.lba == 0 || link.kind == TYPE_EMPTY {
            return Ok(());
        }
        lba = base + u64::from(link.lba);
    }

    error!("extended partition chain exceeds {} links", MAX_CHAIN_LINKS);
    Err(Error::InvalidExtendedChain { lba })
}

#[cfg(test)]
mod tests {
    use super::super::tests::{blank_disk, write_boot_record, BS};
    use super::super::PartitionTable;
    use super::*;

    use std::io::Cursor;

    #[test]
    fn test_extended_chain() {
        let mut disk = blank_disk(2000);
        write_boot_record(&mut disk, 0, &[(0x83, 1, 99), (0x0f, 1000, 1000)]);
        // First logical at 1000 + 1, link to the record at 1000 + 200.
        write_boot_record(&mut disk, 1000, &[(0x83, 1, 100), (0x05, 200, 300)]);
        // Second logical at 1200 + 1, link to 1000 + 500.
        write_boot_record(&mut disk, 1200, &[(0x07, 1, 250), (0x05, 500, 100)]);
        // Last record, empty link.
        write_boot_record(&mut disk, 1500, &[(0x83, 2, 98)]);

        let table = PartitionTable::parse(&mut Cursor::new(disk), BS, false).unwrap();
        let indices: Vec<u32> = table.partitions().iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![1, 5, 6, 7]);

        let p5 = table.partition(5).unwrap();
        assert_eq!((p5.start_sector, p5.sector_count), (1001, 100));
        let p6 = table.partition(6).unwrap();
        assert_eq!((p6.start_sector, p6.sector_count), (1201, 250));
        assert_eq!(p6.kind, PartitionKind::Classic(0x07));
        let p7 = table.partition(7).unwrap();
        assert_eq!((p7.start_sector, p7.sector_count), (1502, 98));

        // The container itself is not a partition.
        assert!(table.partition(2).is_none());
    }

    #[test]
    fn test_circular_chain() {
        let mut disk = blank_disk(2000);
        write_boot_record(&mut disk, 0, &[(0x05, 1000, 1000)]);
        write_boot_record(&mut disk, 1000, &[(0x83, 1, 10), (0x05, 100, 100)]);
        // Links back to the record at 1000 + 100.
        write_boot_record(&mut disk, 1100, &[(0x83, 1, 10), (0x05, 100, 100)]);

        match parse(&mut Cursor::new(disk), BS) {
            Err(Error::InvalidExtendedChain { lba: 1100 }) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_chain_too_long() {
        let mut disk = blank_disk(700);
        write_boot_record(&mut disk, 0, &[(0x05, 2, 650)]);
        for i in 0..300u32 {
            let lba = 2 + u64::from(i) * 2;
            write_boot_record(&mut disk, lba, &[(0x83, 1, 1), (0x05, (i + 1) * 2, 2)]);
        }

        match parse(&mut Cursor::new(disk), BS) {
            Err(Error::InvalidExtendedChain { lba }) => {
                assert_eq!(lba, 2 + 2 * MAX_CHAIN_LINKS as u64)
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_chain_without_signature() {
        let mut disk = blank_disk(2000);
        write_boot_record(&mut disk, 0, &[(0x05, 1000, 1000)]);
        write_boot_record(&mut disk, 1000, &[(0x83, 1, 10), (0x05, 100, 100)]);

        let partitions = parse(&mut Cursor::new(disk), BS).unwrap().unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].index, 5);
    }

    #[test]
    fn test_protective_entry() {
        let mut disk = blank_disk(16);
        write_boot_record(&mut disk, 0, &[(0xee, 1, 15)]);
        match parse(&mut Cursor::new(disk), BS) {
            Err(Error::ProtectiveMbr) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
