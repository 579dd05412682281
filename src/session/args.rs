// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Session argument strings.
//!
//! Session requests arrive as `key=value` pairs separated by commas, for example
//! `ram_quota=128K, tx_buf_size=64K, label="fs -> root", writeable=no`.

use std::fmt;
use std::result;
use std::str::FromStr;

/// Argument parsing errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A pair has no `=`, or an empty key.
    Malformed(String),
    /// A quoted value is not terminated.
    UnterminatedQuote,
    /// The value of `key` is not of the expected type.
    InvalidValue {
        /// The offending key.
        key: String,
        /// Its value.
        value: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Malformed(arg) => write!(f, "malformed session argument '{}'", arg),
            Error::UnterminatedQuote => write!(f, "unterminated quote in session arguments"),
            Error::InvalidValue { key, value } => {
                write!(f, "invalid value '{}' for session argument '{}'", value, key)
            }
        }
    }
}

impl std::error::Error for Error {}

/// Argument parsing result type.
pub type Result<T> = result::Result<T, Error>;

/// Parsed session arguments, in their original order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionArgs {
    args: Vec<(String, String)>,
}

// Splits at commas outside of double quotes.
fn split(s: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => (),
        }
    }
    if quoted {
        return Err(Error::UnterminatedQuote);
    }
    parts.push(&s[start..]);
    Ok(parts)
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn parse_ulong(value: &str) -> Option<u64> {
    let (digits, shift) = match value.chars().last()? {
        'K' | 'k' => (&value[..value.len() - 1], 10),
        'M' | 'm' => (&value[..value.len() - 1], 20),
        'G' | 'g' => (&value[..value.len() - 1], 30),
        _ => (value, 0),
    };

    let n = if digits.starts_with("0x") || digits.starts_with("0X") {
        u64::from_str_radix(&digits[2..], 16).ok()?
    } else {
        digits.parse::<u64>().ok()?
    };
    n.checked_mul(1u64 << shift)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "yes" | "true" | "on" | "1" => Some(true),
        "no" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

impl SessionArgs {
    /// Parses an argument string.
    pub fn parse(s: &str) -> Result<Self> {
        let mut args = Vec::new();
        for part in split(s)? {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let eq = part
                .find('=')
                .ok_or_else(|| Error::Malformed(part.to_string()))?;
            let key = part[..eq].trim();
            if key.is_empty() {
                return Err(Error::Malformed(part.to_string()));
            }
            let value = unquote(part[eq + 1..].trim());
            args.push((key.to_string(), value.to_string()));
        }
        Ok(SessionArgs { args })
    }

    /// Returns the raw value of `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns `key` as an integer, `default` if absent.
    ///
    /// `K`, `M` and `G` suffixes multiply by powers of 1024, a `0x` prefix selects hex.
    pub fn ulong(&self, key: &str, default: u64) -> Result<u64> {
        match self.get(key) {
            Some(v) => parse_ulong(v).ok_or_else(|| Error::InvalidValue {
                key: key.to_string(),
                value: v.to_string(),
            }),
            None => Ok(default),
        }
    }

    /// Returns `key` as a boolean, `default` if absent.
    pub fn boolean(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            Some(v) => parse_bool(v).ok_or_else(|| Error::InvalidValue {
                key: key.to_string(),
                value: v.to_string(),
            }),
            None => Ok(default),
        }
    }

    /// Returns the session label, empty if absent.
    pub fn label(&self) -> &str {
        self.get("label").unwrap_or("")
    }

    /// Sets `key` to `value`, replacing an existing value.
    pub fn set<V: ToString>(&mut self, key: &str, value: V) {
        let value = value.to_string();
        match self.args.iter_mut().find(|(k, _)| k == key) {
            Some(arg) => arg.1 = value,
            None => self.args.push((key.to_string(), value)),
        }
    }
}

impl FromStr for SessionArgs {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SessionArgs::parse(s)
    }
}

impl fmt::Display for SessionArgs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, (k, v)) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if v.contains(|c: char| c == ',' || c == ' ') {
                write!(f, "{}=\"{}\"", k, v)?;
            } else {
                write!(f, "{}={}", k, v)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let args = SessionArgs::parse(
            "ram_quota=128K, tx_buf_size=0x1000,label=\"fs -> a, b\", writeable=no, span=2M",
        )
        .unwrap();

        assert_eq!(args.ulong("ram_quota", 0).unwrap(), 128 * 1024);
        assert_eq!(args.ulong("tx_buf_size", 0).unwrap(), 0x1000);
        assert_eq!(args.ulong("span", 0).unwrap(), 2 * 1024 * 1024);
        assert_eq!(args.ulong("offset", 7).unwrap(), 7);
        assert_eq!(args.label(), "fs -> a, b");
        assert!(!args.boolean("writeable", true).unwrap());
        assert!(args.boolean("readable", true).unwrap());
    }

    #[test]
    fn test_invalid() {
        assert_eq!(
            SessionArgs::parse("label=\"open"),
            Err(Error::UnterminatedQuote)
        );
        assert_eq!(
            SessionArgs::parse("offset"),
            Err(Error::Malformed("offset".to_string()))
        );
        let args = SessionArgs::parse("offset=ten, writeable=maybe").unwrap();
        assert!(args.ulong("offset", 0).is_err());
        assert!(args.boolean("writeable", true).is_err());
        assert!(SessionArgs::parse("span=99999999999999999G")
            .unwrap()
            .ulong("span", 0)
            .is_err());
    }

    #[test]
    fn test_rewrite() {
        let mut args: SessionArgs = "label=\"x -> y\", offset=5".parse().unwrap();
        args.set("offset", 105);
        args.set("writeable", false);
        assert_eq!(
            args.to_string(),
            "label=\"x -> y\", offset=105, writeable=false"
        );
        assert_eq!(SessionArgs::parse(&args.to_string()).unwrap(), args);
    }
}
