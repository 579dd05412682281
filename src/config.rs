// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Multiplexer configuration.
//!
//! ```toml
//! use_gpt = true
//!
//! [[policy]]
//! label_prefix = "fs"
//! partition = 1
//! writeable = false
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::result;

use serde::Deserialize;

use crate::packet::stream::DEFAULT_QUEUE_SIZE;

/// Configuration related errors.
#[derive(Debug)]
pub enum Error {
    /// Reading the configuration file failed.
    Io(io::Error),
    /// The configuration is not valid TOML or has unexpected fields.
    Parse(toml::de::Error),
    /// `queue_size` is zero.
    InvalidQueueSize,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "failed to read configuration: {}", e),
            Error::Parse(e) => write!(f, "invalid configuration: {}", e),
            Error::InvalidQueueSize => write!(f, "queue_size must not be zero"),
        }
    }
}

impl std::error::Error for Error {}

/// Configuration result type.
pub type Result<T> = result::Result<T, Error>;

fn yes() -> bool {
    true
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

/// Access policy for the sessions whose label matches.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PolicyEntry {
    /// Matches exactly this label.
    pub label: Option<String>,
    /// Matches labels starting with this string.
    pub label_prefix: Option<String>,
    /// Matches labels ending with this string.
    pub label_suffix: Option<String>,
    /// Binds matching sessions to this partition.
    pub partition: Option<u32>,
    /// Whether matching sessions may read at all.
    #[serde(default = "yes")]
    pub readable: bool,
    /// Whether matching sessions may write at all.
    #[serde(default = "yes")]
    pub writeable: bool,
}

impl Default for PolicyEntry {
    fn default() -> Self {
        PolicyEntry {
            label: None,
            label_prefix: None,
            label_suffix: None,
            partition: None,
            readable: true,
            writeable: true,
        }
    }
}

impl PolicyEntry {
    // Rank of the match against `label`, higher is more specific.
    fn specificity(&self, label: &str) -> Option<(u8, usize)> {
        if let Some(exact) = &self.label {
            return if exact == label {
                Some((2, exact.len()))
            } else {
                None
            };
        }

        if self.label_prefix.is_none() && self.label_suffix.is_none() {
            return Some((0, 0));
        }

        let mut len = 0;
        if let Some(prefix) = &self.label_prefix {
            if !label.starts_with(prefix.as_str()) {
                return None;
            }
            len += prefix.len();
        }
        if let Some(suffix) = &self.label_suffix {
            if !label.ends_with(suffix.as_str()) {
                return None;
            }
            len += suffix.len();
        }
        Some((1, len))
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Look for a GPT before falling back to the classic table.
    #[serde(default)]
    pub use_gpt: bool,
    /// Capacity of the submit and acknowledgement queues of each session.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Session policies.
    #[serde(default, rename = "policy")]
    pub policies: Vec<PolicyEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            use_gpt: false,
            queue_size: DEFAULT_QUEUE_SIZE,
            policies: Vec::new(),
        }
    }
}

impl Config {
    /// Parses a TOML configuration.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(Error::Parse)?;
        if config.queue_size == 0 {
            return Err(Error::InvalidQueueSize);
        }
        Ok(config)
    }

    /// Reads and parses a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path).map_err(Error::Io)?;
        Config::from_toml_str(&s)
    }

    /// Adds `entry` to the policies.
    pub fn with_policy(mut self, entry: PolicyEntry) -> Self {
        self.policies.push(entry);
        self
    }

    /// Returns the most specific policy matching `label`.
    ///
    /// An exact label beats any prefix/suffix match, a longer prefix/suffix beats a shorter
    /// one, and a policy without any label attribute only matches when nothing else does.
    /// Among equally specific policies the first one wins.
    pub fn policy_for(&self, label: &str) -> Option<&PolicyEntry> {
        let mut best: Option<((u8, usize), &PolicyEntry)> = None;
        for entry in self.policies.iter() {
            if let Some(rank) = entry.specificity(label) {
                if best.map_or(true, |(r, _)| rank > r) {
                    best = Some((rank, entry));
                }
            }
        }
        best.map(|(_, entry)| entry)
    }
}
