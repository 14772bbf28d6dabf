// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Append-only evidence log.
//!
//! Every anomaly the bus detects (an unroutable message, a missing session,
//! a stuck active message) is written here as one JSON line instead of the
//! message being thrown away. The file is trimmed from the head once it
//! exceeds its line bound.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

/// Default line bound for the evidence log.
pub const DEFAULT_MAX_LINES: usize = 5000;

/// Kind of anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvidenceKind {
    RoutingFailure,
    DomainNotFound,
    HardcodedFallback,
    MissingDestination,
    ParseError,
    StuckMessage,
    DeliveryFailure,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoutingFailure => "routing-failure",
            Self::DomainNotFound => "domain-not-found",
            Self::HardcodedFallback => "hardcoded-fallback",
            Self::MissingDestination => "missing-destination",
            Self::ParseError => "parse-error",
            Self::StuckMessage => "stuck-message",
            Self::DeliveryFailure => "delivery-failure",
        }
    }
}

impl fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an anomaly happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// The offending header, if one was read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<BTreeMap<String, String>>,
}

impl EvidenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn participant(mut self, participant: impl Into<String>) -> Self {
        self.participant = Some(participant.into());
        self
    }

    pub fn file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn header(mut self, header: BTreeMap<String, String>) -> Self {
        self.header = Some(header);
        self
    }
}

/// One evidence line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub ts: DateTime<Utc>,
    pub kind: EvidenceKind,
    pub description: String,
    #[serde(default)]
    pub context: EvidenceContext,
}

/// Aggregate view for operators.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvidenceSummary {
    pub total: usize,
    pub by_kind: BTreeMap<EvidenceKind, usize>,
    pub by_domain: BTreeMap<String, usize>,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

/// Writer and reader for the evidence log.
#[derive(Debug)]
pub struct EvidenceRecorder {
    path: PathBuf,
    max_lines: usize,
    /// Lines currently in the file, counted once at open.
    lines: Mutex<usize>,
}

impl EvidenceRecorder {
    /// Open (creating if needed) the evidence log. Failure is fatal at startup.
    pub fn open(path: impl Into<PathBuf>, max_lines: usize) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        let lines = count_lines(&path)?;
        Ok(Self {
            path,
            max_lines: max_lines.max(1),
            lines: Mutex::new(lines),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Past the bound the head is trimmed down to the
    /// low-water mark, so the next rewrite is a tenth of the bound away.
    pub fn record(
        &self,
        kind: EvidenceKind,
        description: impl Into<String>,
        context: EvidenceContext,
    ) -> Result<EvidenceRecord> {
        let record = EvidenceRecord {
            ts: Utc::now(),
            kind,
            description: description.into(),
            context,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut count = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            file.write_all(line.as_bytes())?;
        }
        *count += 1;
        if *count > self.max_lines {
            *count = self.trim()?;
        }
        warn!(kind = %record.kind, "{}", record.description);
        Ok(record)
    }

    /// Record and swallow any failure to write, logging it instead.
    pub fn note(&self, kind: EvidenceKind, description: impl Into<String>, context: EvidenceContext) {
        let description = description.into();
        if let Err(e) = self.record(kind, description.clone(), context) {
            warn!("Failed to record {} evidence ({}): {}", kind, description, e);
        }
    }

    fn trim(&self) -> Result<usize> {
        let content = std::fs::read_to_string(&self.path)?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let keep = &lines[lines.len().saturating_sub(self.low_water())..];
        let mut out = keep.join("\n");
        out.push('\n');
        let tmp = self.path.with_extension("jsonl.tmp");
        std::fs::write(&tmp, out)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(keep.len())
    }

    /// Line count a trim leaves behind: 90% of the bound.
    fn low_water(&self) -> usize {
        (self.max_lines * 9 / 10).max(1)
    }

    /// All readable records, oldest first. Unreadable lines are skipped.
    pub fn read_all(&self) -> Result<Vec<EvidenceRecord>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// The last `n` records matching the optional filters, oldest first.
    pub fn tail(
        &self,
        n: usize,
        kind: Option<EvidenceKind>,
        domain: Option<&str>,
    ) -> Result<Vec<EvidenceRecord>> {
        let mut records: Vec<EvidenceRecord> = self
            .read_all()?
            .into_iter()
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .filter(|r| domain.map_or(true, |d| r.context.domain.as_deref() == Some(d)))
            .collect();
        let len = records.len();
        if len > n {
            records = records.split_off(len - n);
        }
        Ok(records)
    }

    pub fn summary(&self) -> Result<EvidenceSummary> {
        let records = self.read_all()?;
        let mut summary = EvidenceSummary {
            total: records.len(),
            first: records.first().map(|r| r.ts),
            last: records.last().map(|r| r.ts),
            ..Default::default()
        };
        for record in &records {
            *summary.by_kind.entry(record.kind).or_insert(0) += 1;
            if let Some(domain) = &record.context.domain {
                *summary.by_domain.entry(domain.clone()).or_insert(0) += 1;
            }
        }
        Ok(summary)
    }

    /// Number of records of one kind.
    pub fn count(&self, kind: EvidenceKind) -> Result<usize> {
        Ok(self.read_all()?.iter().filter(|r| r.kind == kind).count())
    }
}

fn count_lines(path: &Path) -> Result<usize> {
    let content = std::fs::read_to_string(path)?;
    Ok(content.lines().filter(|l| !l.trim().is_empty()).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_tail() {
        let temp = TempDir::new().unwrap();
        let recorder = EvidenceRecorder::open(temp.path().join("evidence.jsonl"), 100).unwrap();
        recorder
            .record(
                EvidenceKind::DomainNotFound,
                "no such domain",
                EvidenceContext::new().domain("x").file("f.md"),
            )
            .unwrap();
        recorder
            .record(
                EvidenceKind::MissingDestination,
                "session gone",
                EvidenceContext::new().domain("y").participant("p"),
            )
            .unwrap();

        let all = recorder.tail(10, None, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, EvidenceKind::DomainNotFound);

        let only_y = recorder.tail(10, None, Some("y")).unwrap();
        assert_eq!(only_y.len(), 1);
        assert_eq!(only_y[0].context.participant.as_deref(), Some("p"));

        let by_kind = recorder
            .tail(10, Some(EvidenceKind::DomainNotFound), None)
            .unwrap();
        assert_eq!(by_kind.len(), 1);
    }

    #[test]
    fn test_trim_keeps_newest() {
        let temp = TempDir::new().unwrap();
        let recorder = EvidenceRecorder::open(temp.path().join("evidence.jsonl"), 3).unwrap();
        for i in 0..5 {
            recorder
                .record(EvidenceKind::StuckMessage, format!("stuck {}", i), EvidenceContext::new())
                .unwrap();
        }
        let records = recorder.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].description, "stuck 2");
        assert_eq!(records[2].description, "stuck 4");
    }

    #[test]
    fn test_reopen_counts_existing_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("evidence.jsonl");
        {
            let recorder = EvidenceRecorder::open(&path, 2).unwrap();
            recorder
                .record(EvidenceKind::ParseError, "a", EvidenceContext::new())
                .unwrap();
            recorder
                .record(EvidenceKind::ParseError, "b", EvidenceContext::new())
                .unwrap();
        }
        let recorder = EvidenceRecorder::open(&path, 2).unwrap();
        recorder
            .record(EvidenceKind::ParseError, "c", EvidenceContext::new())
            .unwrap();
        let records = recorder.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].description, "c");
    }

    #[test]
    fn test_trim_leaves_headroom_below_bound() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("evidence.jsonl");
        let recorder = EvidenceRecorder::open(&path, 10).unwrap();
        for i in 0..11 {
            recorder
                .record(EvidenceKind::StuckMessage, format!("stuck {}", i), EvidenceContext::new())
                .unwrap();
        }
        let records = recorder.read_all().unwrap();
        assert_eq!(records.len(), 9);
        assert_eq!(records[0].description, "stuck 2");

        // Below the bound again: further records only append.
        let before = std::fs::read_to_string(&path).unwrap();
        recorder
            .record(EvidenceKind::StuckMessage, "stuck 11", EvidenceContext::new())
            .unwrap();
        let after = std::fs::read_to_string(&path).unwrap();
        assert!(after.starts_with(&before));
        assert_eq!(recorder.read_all().unwrap().len(), 10);
    }

    #[test]
    fn test_summary() {
        let temp = TempDir::new().unwrap();
        let recorder = EvidenceRecorder::open(temp.path().join("e.jsonl"), 100).unwrap();
        recorder.note(EvidenceKind::ParseError, "bad", EvidenceContext::new().domain("d"));
        recorder.note(EvidenceKind::ParseError, "bad", EvidenceContext::new().domain("d"));
        recorder.note(EvidenceKind::HardcodedFallback, "fb", EvidenceContext::new());
        let summary = recorder.summary().unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_kind[&EvidenceKind::ParseError], 2);
        assert_eq!(summary.by_domain["d"], 2);
        assert!(summary.first.is_some());
        assert_eq!(recorder.count(EvidenceKind::HardcodedFallback).unwrap(), 1);
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&EvidenceKind::HardcodedFallback).unwrap();
        assert_eq!(json, "\"hardcoded-fallback\"");
    }
}
