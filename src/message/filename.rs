// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Filename grammar for message files.
//!
//! ```text
//! MMDDHHMMSS-<type>-<from>><to>-<msgId>[-done|-orphan|-failed].md
//! ```
//!
//! The stamp leads the name so that a lexical sort of filenames is a
//! chronological sort. Two-part addresses appear as `domain.participant`.
//!
//! The stamp carries no year. [`FileStamp::to_datetime`] assumes the current
//! UTC year, and moves a stamp that would land more than one day in the
//! future back one year. A message more than a year old therefore reads as
//! recent; callers that care must use the header timestamp.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};

use super::types::{Address, Message, MessageType};
use crate::error::CodecError;

/// Extension of every message file.
pub const EXTENSION: &str = ".md";

// ============================================================================
// Stamp
// ============================================================================

/// The `MMDDHHMMSS` creation stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileStamp {
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl FileStamp {
    pub fn from_datetime(dt: &DateTime<Utc>) -> Self {
        Self {
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
        }
    }

    /// Parse exactly ten ASCII digits.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() != 10 || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let part = |i: usize| raw[i..i + 2].parse::<u32>().ok();
        let stamp = Self {
            month: part(0)?,
            day: part(2)?,
            hour: part(4)?,
            minute: part(6)?,
            second: part(8)?,
        };
        let in_range = (1..=12).contains(&stamp.month)
            && (1..=31).contains(&stamp.day)
            && stamp.hour < 24
            && stamp.minute < 60
            && stamp.second < 60;
        in_range.then_some(stamp)
    }

    /// Recover a full instant relative to `now` (see module docs for the year policy).
    pub fn to_datetime(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let this_year = self.in_year(now.year());
        match this_year {
            Some(dt) if dt <= now + Duration::days(1) => Some(dt),
            _ => self.in_year(now.year() - 1),
        }
    }

    fn in_year(&self, year: i32) -> Option<DateTime<Utc>> {
        NaiveDate::from_ymd_opt(year, self.month, self.day)
            .and_then(|d| d.and_hms_opt(self.hour, self.minute, self.second))
            .map(|naive| naive.and_utc())
    }
}

impl fmt::Display for FileStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}{:02}{:02}{:02}{:02}",
            self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

// ============================================================================
// Terminal states
// ============================================================================

/// Terminal marker appended to a finished message's filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalState {
    Done,
    Orphan,
    Failed,
}

impl TerminalState {
    pub const ALL: [TerminalState; 3] = [Self::Done, Self::Orphan, Self::Failed];

    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Done => "-done",
            Self::Orphan => "-orphan",
            Self::Failed => "-failed",
        }
    }
}

/// Whether a filename carries a terminal marker.
pub fn is_terminal_name(name: &str) -> bool {
    let stem = name.strip_suffix(EXTENSION).unwrap_or(name);
    TerminalState::ALL.iter().any(|s| stem.ends_with(s.suffix()))
}

/// The terminal form of a filename. Already-terminal names are returned unchanged.
pub fn terminal_name(name: &str, state: TerminalState) -> String {
    if is_terminal_name(name) {
        return name.to_string();
    }
    match name.strip_suffix(EXTENSION) {
        Some(stem) => format!("{}{}{}", stem, state.suffix(), EXTENSION),
        None => format!("{}{}", name, state.suffix()),
    }
}

/// Rename a message file in place to its terminal form.
pub fn mark_terminal(path: &Path, state: TerminalState) -> io::Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a message file"))?;
    let target = path.with_file_name(terminal_name(name, state));
    std::fs::rename(path, &target)?;
    Ok(target)
}

// ============================================================================
// Filename
// ============================================================================

/// A parsed message filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFilename {
    pub stamp: FileStamp,
    pub kind: MessageType,
    /// Sender token (`participant` or `domain.participant`).
    pub from: String,
    /// Destination token (`participant`, `domain` or `domain.participant`).
    pub to: String,
    pub msg_id: String,
    pub terminal: Option<TerminalState>,
}

impl MessageFilename {
    /// Build the filename for a message. Fails if an address cannot be tokenised.
    pub fn for_message(message: &Message) -> Result<Self, CodecError> {
        let timestamp = message.timestamp.unwrap_or_else(Utc::now);
        let msg_id = message
            .msg_id
            .clone()
            .unwrap_or_else(super::types::generate_msg_id);
        if msg_id.is_empty() || msg_id.contains('-') {
            return Err(CodecError::InvalidFilename(format!(
                "message id `{}` cannot appear in a filename",
                msg_id
            )));
        }
        Ok(Self {
            stamp: FileStamp::from_datetime(&timestamp),
            kind: message.kind.clone(),
            from: message.from_address()?.to_token(),
            to: message.to_address()?.to_token(),
            msg_id,
            terminal: None,
        })
    }

    pub fn parse(name: &str) -> Result<Self, CodecError> {
        let invalid = || CodecError::InvalidFilename(name.to_string());

        let mut stem = name.strip_suffix(EXTENSION).ok_or_else(invalid)?;
        let mut terminal = None;
        for state in TerminalState::ALL {
            if let Some(rest) = stem.strip_suffix(state.suffix()) {
                stem = rest;
                terminal = Some(state);
                break;
            }
        }

        let (stamp_raw, rest) = stem.split_once('-').ok_or_else(invalid)?;
        let stamp = FileStamp::parse(stamp_raw).ok_or_else(invalid)?;

        let (left, right) = rest.split_once('>').ok_or_else(invalid)?;
        let (kind, from) = split_type(left).ok_or_else(invalid)?;
        let (to, msg_id) = right.rsplit_once('-').ok_or_else(invalid)?;

        if from.is_empty() || to.is_empty() || msg_id.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            stamp,
            kind,
            from: from.to_string(),
            to: to.to_string(),
            msg_id: msg_id.to_string(),
            terminal,
        })
    }

    /// The destination as an address.
    pub fn to_address(&self) -> Result<Address, CodecError> {
        Address::parse_token(&self.to)
    }

    /// The sender as an address.
    pub fn from_address(&self) -> Result<Address, CodecError> {
        Address::parse_token(&self.from)
    }

    /// Recover the creation instant (see the year policy in the module docs).
    pub fn timestamp(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.stamp.to_datetime(now)
    }
}

fn split_type(left: &str) -> Option<(MessageType, &str)> {
    for known in MessageType::KNOWN {
        if let Some(from) = left
            .strip_prefix(known.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
        {
            return Some((known.clone(), from));
        }
    }
    let (kind, from) = left.split_once('-')?;
    if kind.is_empty() {
        return None;
    }
    Some((MessageType::from(kind), from))
}

impl fmt::Display for MessageFilename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}>{}-{}",
            self.stamp, self.kind, self.from, self.to, self.msg_id
        )?;
        if let Some(state) = self.terminal {
            f.write_str(state.suffix())?;
        }
        f.write_str(EXTENSION)
    }
}
