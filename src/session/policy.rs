// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Turns a session request into a concrete grant.

use std::fmt;

use super::args::{self, SessionArgs};
use crate::config::{Config, PolicyEntry};
use crate::partition::PartitionTable;

/// Reasons for refusing a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Denied {
    /// No configured policy matches the session label.
    NoPolicy,
    /// The policy names a partition, but the device has no partition table.
    NoPartitionTable,
    /// The policy names a partition the table does not have.
    PartitionNotFound(u32),
    /// The requested offset lies beyond the end of the window.
    OffsetOutOfBounds {
        /// Requested offset.
        offset: u64,
        /// Number of blocks in the window.
        limit: u64,
    },
    /// The requested span reaches beyond the end of the window.
    SpanOutOfBounds {
        /// Requested span.
        span: u64,
        /// Number of blocks left after the offset.
        limit: u64,
    },
    /// A writeable session already covers part of the range.
    WriteConflict {
        /// Label of the conflicting session.
        other: String,
    },
    /// The session arguments are malformed.
    InvalidArgs(args::Error),
}

impl fmt::Display for Denied {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Denied::*;

        match self {
            NoPolicy => write!(f, "no matching policy"),
            NoPartitionTable => write!(f, "device has no partition table"),
            PartitionNotFound(n) => write!(f, "partition {} unavailable", n),
            OffsetOutOfBounds { offset, limit } => {
                write!(f, "offset {} exceeds block count {}", offset, limit)
            }
            SpanOutOfBounds { span, limit } => {
                write!(f, "span {} exceeds the {} blocks available", span, limit)
            }
            WriteConflict { other } => {
                write!(f, "would conflict with write session '{}'", other)
            }
            InvalidArgs(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Denied {}

impl From<args::Error> for Denied {
    fn from(e: args::Error) -> Self {
        Denied::InvalidArgs(e)
    }
}

/// The resolved, immutable access rights of one session.
///
/// `offset` and `span` are absolute device blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grant {
    /// Session label.
    pub label: String,
    /// First device block of the window.
    pub offset: u64,
    /// Number of blocks in the window.
    pub span: u64,
    /// Whether reads are allowed.
    pub readable: bool,
    /// Whether writes are allowed.
    pub writeable: bool,
}

impl Grant {
    /// One past the last device block of the window.
    pub fn end(&self) -> u64 {
        self.offset + self.span
    }

    /// Checks whether the two windows share at least one block.
    pub fn overlaps(&self, other: &Grant) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Session constraints from client arguments, restricted by the configured policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Policy {
    /// Requested first block, relative to the partition if there is one.
    pub offset: u64,
    /// Requested number of blocks, 0 meaning "up to the end".
    pub span: u64,
    /// Whether reads are allowed.
    pub readable: bool,
    /// Whether writes are allowed.
    pub writeable: bool,
    /// Partition the session is bound to.
    pub partition: Option<u32>,
}

impl Policy {
    /// Parses constraints from client arguments alone.
    pub fn from_args(args: &SessionArgs) -> args::Result<Self> {
        Ok(Policy {
            offset: args.ulong("offset", 0)?,
            span: args.ulong("span", 0)?,
            readable: args.boolean("readable", true)?,
            writeable: args.boolean("writeable", true)?,
            partition: None,
        })
    }

    /// Parses constraints from client arguments, where the configured policy may take away
    /// permissions but never grant more than the client asked for.
    pub fn with_entry(entry: &PolicyEntry, args: &SessionArgs) -> args::Result<Self> {
        let client = Policy::from_args(args)?;
        Ok(Policy {
            readable: entry.readable && client.readable,
            writeable: entry.writeable && client.writeable,
            partition: entry.partition,
            ..client
        })
    }

    /// Translates the constraints into absolute device coordinates and checks them against the
    /// partition (if any) and the device.
    pub fn grant(
        &self,
        label: &str,
        table: Option<&PartitionTable>,
        block_count: u64,
    ) -> Result<Grant, Denied> {
        let (offset, span) = match self.partition {
            Some(index) => {
                let table = table.ok_or(Denied::NoPartitionTable)?;
                let partition = table
                    .partition(index)
                    .ok_or(Denied::PartitionNotFound(index))?;

                if self.offset >= partition.sector_count {
                    return Err(Denied::OffsetOutOfBounds {
                        offset: self.offset,
                        limit: partition.sector_count,
                    });
                }
                let room = partition.sector_count - self.offset;
                if self.span > room {
                    return Err(Denied::SpanOutOfBounds {
                        span: self.span,
                        limit: room,
                    });
                }

                let span = if self.span == 0 { room } else { self.span };
                (partition.start_sector + self.offset, span)
            }
            None => {
                let span = if self.span == 0 {
                    block_count.saturating_sub(self.offset)
                } else {
                    self.span
                };
                (self.offset, span)
            }
        };

        if offset >= block_count {
            return Err(Denied::OffsetOutOfBounds {
                offset,
                limit: block_count,
            });
        }
        if span > block_count - offset {
            return Err(Denied::SpanOutOfBounds {
                span,
                limit: block_count - offset,
            });
        }

        Ok(Grant {
            label: label.to_string(),
            offset,
            span,
            readable: self.readable,
            writeable: self.writeable,
        })
    }
}

/// Resolves the grant for a session request.
///
/// The most specific policy matching the label decides about the permissions and the
/// partition; the client arguments pick the window within it. Conflicts with other sessions
/// are checked when the grant is registered.
pub fn resolve(
    config: &Config,
    args: &SessionArgs,
    table: Option<&PartitionTable>,
    block_count: u64,
) -> Result<Grant, Denied> {
    let label = args.label();
    let entry = config.policy_for(label).ok_or(Denied::NoPolicy)?;
    Policy::with_entry(entry, args)?.grant(label, table, block_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::partition::{Partition, PartitionKind, TableFormat};

    fn table() -> PartitionTable {
        let part = |index, start_sector, sector_count| Partition {
            index,
            start_sector,
            sector_count,
            kind: PartitionKind::Classic(0x83),
        };
        PartitionTable::new(
            TableFormat::Classic,
            vec![part(1, 100, 200), part(2, 300, 700)],
            1000,
        )
        .unwrap()
    }

    fn args(s: &str) -> SessionArgs {
        SessionArgs::parse(s).unwrap()
    }

    #[test]
    fn test_whole_device() {
        let config = Config::default().with_policy(PolicyEntry::default());

        let g = resolve(&config, &args("label=a, offset=100, span=50"), None, 1000).unwrap();
        assert_eq!((g.offset, g.span, g.end()), (100, 50, 150));
        assert!(g.readable && g.writeable);

        let g = resolve(&config, &args("offset=100"), None, 1000).unwrap();
        assert_eq!((g.offset, g.span), (100, 900));

        assert_eq!(
            resolve(&config, &args("offset=190, span=20"), None, 200),
            Err(Denied::SpanOutOfBounds { span: 20, limit: 10 })
        );
        assert_eq!(
            resolve(&config, &args("offset=200"), None, 200),
            Err(Denied::OffsetOutOfBounds {
                offset: 200,
                limit: 200
            })
        );
    }

    #[test]
    fn test_partition_translation() {
        let config = Config::default().with_policy(PolicyEntry {
            partition: Some(1),
            ..Default::default()
        });
        let t = table();

        let g = resolve(&config, &args("offset=10, span=20"), Some(&t), 1000).unwrap();
        assert_eq!((g.offset, g.span), (110, 20));

        let g = resolve(&config, &args("offset=10"), Some(&t), 1000).unwrap();
        assert_eq!((g.offset, g.span), (110, 190));

        let g = resolve(&config, &args(""), Some(&t), 1000).unwrap();
        assert_eq!((g.offset, g.span), (100, 200));

        assert_eq!(
            resolve(&config, &args("offset=200"), Some(&t), 1000),
            Err(Denied::OffsetOutOfBounds {
                offset: 200,
                limit: 200
            })
        );
        assert_eq!(
            resolve(&config, &args("offset=150, span=51"), Some(&t), 1000),
            Err(Denied::SpanOutOfBounds { span: 51, limit: 50 })
        );
        assert_eq!(
            resolve(&config, &args(""), None, 1000),
            Err(Denied::NoPartitionTable)
        );

        let missing = Config::default().with_policy(PolicyEntry {
            partition: Some(9),
            ..Default::default()
        });
        assert_eq!(
            resolve(&missing, &args(""), Some(&t), 1000),
            Err(Denied::PartitionNotFound(9))
        );
    }

    #[test]
    fn test_config_restricts_permissions() {
        let config = Config::default()
            .with_policy(PolicyEntry {
                label_prefix: Some("ro".to_string()),
                writeable: false,
                ..Default::default()
            })
            .with_policy(PolicyEntry {
                label_prefix: Some("rw".to_string()),
                ..Default::default()
            });

        let g = resolve(&config, &args("label=ro, writeable=yes"), None, 10).unwrap();
        assert!(g.readable && !g.writeable);

        let g = resolve(&config, &args("label=rw, readable=no"), None, 10).unwrap();
        assert!(!g.readable && g.writeable);

        assert_eq!(
            resolve(&config, &args("label=other"), None, 10),
            Err(Denied::NoPolicy)
        );
        assert_eq!(
            resolve(&config, &args("label=rw, span=lots"), None, 10),
            Err(Denied::InvalidArgs(args::Error::InvalidValue {
                key: "span".to_string(),
                value: "lots".to_string()
            }))
        );
    }
}
