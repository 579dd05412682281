// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! GUID partition table.
//!
//! Only the primary header at LBA 1 is consulted. A header that fails any sanity check means
//! "no GPT here" rather than a hard error, so callers can fall back to the classic table.

use std::fmt;
use std::io::{Read, Seek};

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISO_HDLC};

use super::{read_or_none, Partition, PartitionKind, Result};

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const HEADER_LBA: u64 = 1;
const SIGNATURE: &[u8; 8] = b"EFI PART";
const MIN_HEADER_SIZE: u32 = 92;
const HEADER_CRC_OFFSET: usize = 16;
const MIN_ENTRY_SIZE: u32 = 128;
const MAX_ENTRIES: u32 = 1024;
const NAME_OFFSET: usize = 56;
const NAME_UNITS: usize = 36;

/// A GUID as stored on disk.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// Unused partition entries carry the all-zero type.
    pub fn is_nil(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for Guid {
    // The first three groups are stored little endian.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-",
            LittleEndian::read_u32(&b[0..4]),
            LittleEndian::read_u16(&b[4..6]),
            LittleEndian::read_u16(&b[6..8]),
            b[8],
            b[9]
        )?;
        for byte in b[10..].iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug)]
struct Header {
    entries_lba: u64,
    entry_count: u32,
    entry_size: u32,
    entries_crc: u32,
}

impl Header {
    fn parse(raw: &[u8]) -> Option<Header> {
        if &raw[0..8] != SIGNATURE {
            return None;
        }

        let header_size = LittleEndian::read_u32(&raw[12..16]);
        if header_size < MIN_HEADER_SIZE || header_size as usize > raw.len() {
            warn!("GPT header size {} is invalid", header_size);
            return None;
        }

        let header_crc = LittleEndian::read_u32(&raw[HEADER_CRC_OFFSET..HEADER_CRC_OFFSET + 4]);
        let mut copy = raw[..header_size as usize].to_vec();
        copy[HEADER_CRC_OFFSET..HEADER_CRC_OFFSET + 4].copy_from_slice(&[0; 4]);
        if CRC32.checksum(&copy) != header_crc {
            warn!("GPT header checksum mismatch");
            return None;
        }

        let header = Header {
            entries_lba: LittleEndian::read_u64(&raw[72..80]),
            entry_count: LittleEndian::read_u32(&raw[80..84]),
            entry_size: LittleEndian::read_u32(&raw[84..88]),
            entries_crc: LittleEndian::read_u32(&raw[88..92]),
        };

        if header.entry_size < MIN_ENTRY_SIZE || header.entry_size % 8 != 0 {
            warn!("GPT entry size {} is invalid", header.entry_size);
            return None;
        }
        if header.entry_count > MAX_ENTRIES {
            warn!("GPT lists {} entries, refusing", header.entry_count);
            return None;
        }
        if header.entries_lba <= HEADER_LBA {
            warn!("GPT entry array at LBA {} overlaps the header", header.entries_lba);
            return None;
        }

        Some(header)
    }
}

fn entry_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw[NAME_OFFSET..NAME_OFFSET + NAME_UNITS * 2]
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .take_while(|u| *u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Parses the GPT, returning `None` when no valid header or entry array is found.
pub(super) fn parse<D: Read + Seek>(disk: &mut D, block_size: u64) -> Result<Option<Vec<Partition>>> {
    let raw = match read_or_none(disk, HEADER_LBA, 1, block_size)? {
        Some(raw) => raw,
        None => return Ok(None),
    };
    let header = match Header::parse(&raw) {
        Some(header) => header,
        None => return Ok(None),
    };

    let array_len = u64::from(header.entry_count) * u64::from(header.entry_size);
    let array_blocks = (array_len + block_size - 1) / block_size;
    let array = match read_or_none(disk, header.entries_lba, array_blocks, block_size)? {
        Some(array) => array,
        None => {
            warn!("GPT entry array lies beyond the end of the device");
            return Ok(None);
        }
    };
    let array = &array[..array_len as usize];

    if CRC32.checksum(array) != header.entries_crc {
        warn!("GPT entry array checksum mismatch");
        return Ok(None);
    }

    let mut partitions = Vec::new();
    for (i, raw) in array.chunks_exact(header.entry_size as usize).enumerate() {
        let mut type_guid = Guid::default();
        type_guid.0.copy_from_slice(&raw[0..16]);
        if type_guid.is_nil() {
            continue;
        }

        let first = LittleEndian::read_u64(&raw[32..40]);
        let last = LittleEndian::read_u64(&raw[40..48]);
        if last < first {
            warn!("GPT entry {} ends before it starts, ignoring", i);
            continue;
        }

        partitions.push(Partition {
            index: i as u32 + 1,
            start_sector: first,
            sector_count: last - first + 1,
            kind: PartitionKind::Gpt {
                type_guid,
                name: entry_name(raw),
            },
        });
    }

    Ok(Some(partitions))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::super::tests::{blank_disk, write_boot_record, BS};
    use super::super::{Error, PartitionTable, TableFormat};
    use super::*;

    use std::io::Cursor;

    pub const LINUX_FS: [u8; 16] = [
        0xaf, 0x3d, 0xc6, 0x0f, 0x83, 0x84, 0x72, 0x47, 0x8e, 0x79, 0x3d, 0x69, 0xd8, 0x47, 0x7d,
        0xe4,
    ];

    // Writes a protective classic table, a primary GPT header at LBA 1 and 128 entries
    // at LBA 2. Entries are (slot, first, last, name).
    pub fn write_gpt(disk: &mut [u8], entries: &[(usize, u64, u64, &str)]) {
        let blocks = disk.len() as u64 / BS;
        write_boot_record(disk, 0, &[(0xee, 1, (blocks - 1) as u32)]);

        let entry_size = 128usize;
        let count = 128usize;
        let array_start = (2 * BS) as usize;
        for (slot, first, last, name) in entries.iter() {
            let e = array_start + slot * entry_size;
            disk[e..e + 16].copy_from_slice(&LINUX_FS);
            LittleEndian::write_u64(&mut disk[e + 32..e + 40], *first);
            LittleEndian::write_u64(&mut disk[e + 40..e + 48], *last);
            for (i, unit) in name.encode_utf16().enumerate() {
                let off = e + NAME_OFFSET + i * 2;
                LittleEndian::write_u16(&mut disk[off..off + 2], unit);
            }
        }
        let array_crc = CRC32.checksum(&disk[array_start..array_start + entry_size * count]);

        let h = BS as usize;
        disk[h..h + 8].copy_from_slice(SIGNATURE);
        LittleEndian::write_u32(&mut disk[h + 8..h + 12], 0x0001_0000);
        LittleEndian::write_u32(&mut disk[h + 12..h + 16], 92);
        LittleEndian::write_u64(&mut disk[h + 24..h + 32], 1);
        LittleEndian::write_u64(&mut disk[h + 32..h + 40], blocks - 1);
        LittleEndian::write_u64(&mut disk[h + 40..h + 48], 34);
        LittleEndian::write_u64(&mut disk[h + 48..h + 56], blocks - 34);
        LittleEndian::write_u64(&mut disk[h + 72..h + 80], 2);
        LittleEndian::write_u32(&mut disk[h + 80..h + 84], count as u32);
        LittleEndian::write_u32(&mut disk[h + 84..h + 88], entry_size as u32);
        LittleEndian::write_u32(&mut disk[h + 88..h + 92], array_crc);
        let header_crc = CRC32.checksum(&disk[h..h + 92]);
        LittleEndian::write_u32(&mut disk[h + 16..h + 20], header_crc);
    }

    #[test]
    fn test_gpt() {
        let mut disk = blank_disk(4096);
        write_gpt(&mut disk, &[(0, 2048, 2559, "boot"), (2, 2560, 4000, "data")]);

        let table = PartitionTable::parse(&mut Cursor::new(disk), BS, true).unwrap();
        assert_eq!(table.format(), TableFormat::Gpt);
        assert_eq!(table.len(), 2);

        let p1 = table.partition(1).unwrap();
        assert_eq!((p1.start_sector, p1.sector_count), (2048, 512));
        match &p1.kind {
            PartitionKind::Gpt { type_guid, name } => {
                assert_eq!(name, "boot");
                assert_eq!(
                    type_guid.to_string(),
                    "0fc63daf-8483-4772-8e79-3d69d8477de4"
                );
            }
            kind => panic!("unexpected kind {:?}", kind),
        }

        // Unused slots keep their numbers.
        assert!(table.partition(2).is_none());
        let p3 = table.partition(3).unwrap();
        assert_eq!((p3.start_sector, p3.sector_count), (2560, 1441));
    }

    #[test]
    fn test_gpt_not_requested() {
        let mut disk = blank_disk(4096);
        write_gpt(&mut disk, &[(0, 2048, 2559, "boot")]);

        match PartitionTable::parse(&mut Cursor::new(disk), BS, false) {
            Err(Error::ProtectiveMbr) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_header_falls_back() {
        let mut disk = blank_disk(4096);
        write_gpt(&mut disk, &[(0, 2048, 2559, "boot")]);
        // Flip a byte covered by the header checksum.
        disk[BS as usize + 80] ^= 0x01;

        assert!(parse(&mut Cursor::new(disk.clone()), BS).unwrap().is_none());
        match PartitionTable::parse(&mut Cursor::new(disk.clone()), BS, true) {
            Err(Error::ProtectiveMbr) => (),
            other => panic!("unexpected result {:?}", other),
        }

        // A regular classic table is used once the GPT is discarded.
        write_boot_record(&mut disk, 0, &[(0x83, 2048, 512)]);
        let table = PartitionTable::parse(&mut Cursor::new(disk), BS, true).unwrap();
        assert_eq!(table.format(), TableFormat::Classic);
        assert_eq!(table.partition(1).unwrap().start_sector, 2048);
    }

    #[test]
    fn test_corrupt_entries() {
        let mut disk = blank_disk(4096);
        write_gpt(&mut disk, &[(0, 2048, 2559, "boot")]);
        disk[2 * BS as usize + 40] ^= 0xff;

        assert!(parse(&mut Cursor::new(disk), BS).unwrap().is_none());
    }

    #[test]
    fn test_tiny_image() {
        let disk = vec![0u8; 100];
        assert!(parse(&mut Cursor::new(disk), BS).unwrap().is_none());
    }
}
