// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! On-disk layout shared by the router, the consumers and the watch layer.
//!
//! ```text
//! <root>/
//! ├── log/                                  shared message log (flat)
//! ├── domains/<domain>/
//! │   ├── config.json                       participants, entry point, workflow
//! │   ├── state.json / state.lock           atomic state record
//! │   ├── msgs/{inbox,next,active,complete,archive,outbox}/
//! │   └── participants/<participant>/
//! │       ├── state.json / state.lock
//! │       └── msgs/{inbox,next,active,complete,archive,outbox}/
//! ├── offsets/<participant>.json            consumer cursors
//! ├── rendered/                             rewritten messages awaiting injection
//! ├── templates/<name>.md                   self-modify templates
//! ├── lenses.json                           lens index
//! └── evidence.jsonl                        evidence log
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::message::is_live_message_name;

/// A queue tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Inbox,
    Next,
    Active,
    Complete,
    Archive,
    Outbox,
}

impl Tier {
    pub const ALL: [Tier; 6] = [
        Tier::Inbox,
        Tier::Next,
        Tier::Active,
        Tier::Complete,
        Tier::Archive,
        Tier::Outbox,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Next => "next",
            Self::Active => "active",
            Self::Complete => "complete",
            Self::Archive => "archive",
            Self::Outbox => "outbox",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.dir_name() == name)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// The owner of a set of tiers: a whole domain, or one participant in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TierOwner {
    pub domain: String,
    pub participant: Option<String>,
}

impl TierOwner {
    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            participant: None,
        }
    }

    pub fn participant(domain: impl Into<String>, participant: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            participant: Some(participant.into()),
        }
    }

    pub fn is_domain(&self) -> bool {
        self.participant.is_none()
    }
}

impl fmt::Display for TierOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.participant {
            Some(p) => write!(f, "{}/{}", self.domain, p),
            None => write!(f, "{}", self.domain),
        }
    }
}

/// Where a message file sits, recovered from its path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathLocation {
    /// A file in the shared message log.
    Log { file: String },
    /// A file in one of an owner's tiers.
    Tier {
        owner: TierOwner,
        tier: Tier,
        file: String,
    },
}

/// The bus directory layout rooted at one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusPaths {
    root: PathBuf,
}

impl BusPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn domains_dir(&self) -> PathBuf {
        self.root.join("domains")
    }

    pub fn domain_dir(&self, domain: &str) -> PathBuf {
        self.domains_dir().join(domain)
    }

    pub fn domain_config_path(&self, domain: &str) -> PathBuf {
        self.domain_dir(domain).join("config.json")
    }

    pub fn owner_dir(&self, owner: &TierOwner) -> PathBuf {
        let domain = self.domain_dir(&owner.domain);
        match &owner.participant {
            Some(p) => domain.join("participants").join(p),
            None => domain,
        }
    }

    pub fn tier_dir(&self, owner: &TierOwner, tier: Tier) -> PathBuf {
        self.owner_dir(owner).join("msgs").join(tier.dir_name())
    }

    pub fn state_path(&self, owner: &TierOwner) -> PathBuf {
        self.owner_dir(owner).join("state.json")
    }

    pub fn lock_path(&self, owner: &TierOwner) -> PathBuf {
        self.owner_dir(owner).join("state.lock")
    }

    pub fn offsets_dir(&self) -> PathBuf {
        self.root.join("offsets")
    }

    pub fn offset_path(&self, participant: &str) -> PathBuf {
        self.offsets_dir().join(format!("{}.json", participant))
    }

    pub fn rendered_dir(&self) -> PathBuf {
        self.root.join("rendered")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root.join("templates")
    }

    pub fn lens_index_path(&self) -> PathBuf {
        self.root.join("lenses.json")
    }

    pub fn evidence_path(&self) -> PathBuf {
        self.root.join("evidence.jsonl")
    }

    /// Create the top-level directories. Failure here is fatal at startup.
    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.log_dir(),
            self.domains_dir(),
            self.offsets_dir(),
            self.rendered_dir(),
            self.templates_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Create every tier directory for an owner.
    pub fn ensure_owner_dirs(&self, owner: &TierOwner) -> Result<()> {
        for tier in Tier::ALL {
            std::fs::create_dir_all(self.tier_dir(owner, tier))?;
        }
        Ok(())
    }

    /// Whether a domain directory exists.
    pub fn domain_exists(&self, domain: &str) -> bool {
        !domain.is_empty() && self.domain_dir(domain).is_dir()
    }

    /// Names of all domain directories, sorted.
    pub fn list_domains(&self) -> Result<Vec<String>> {
        list_subdirs(&self.domains_dir())
    }

    /// Every tier owner present on disk: each domain, then its participants.
    pub fn list_owners(&self) -> Result<Vec<TierOwner>> {
        let mut owners = Vec::new();
        for domain in self.list_domains()? {
            let participants = list_subdirs(&self.domain_dir(&domain).join("participants"))?;
            owners.push(TierOwner::domain(domain.clone()));
            owners.extend(
                participants
                    .into_iter()
                    .map(|p| TierOwner::participant(domain.clone(), p)),
            );
        }
        Ok(owners)
    }

    /// Live message filenames in a tier, in lexical (chronological) order.
    pub fn list_tier(&self, owner: &TierOwner, tier: Tier) -> Result<Vec<String>> {
        list_messages(&self.tier_dir(owner, tier))
    }

    /// Map a path back to its place in the layout.
    pub fn classify(&self, path: &Path) -> Option<PathLocation> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel.iter().filter_map(|c| c.to_str()).collect();
        let file = (*parts.last()?).to_string();
        match parts.as_slice() {
            ["log", _] => Some(PathLocation::Log { file }),
            ["domains", domain, "msgs", tier, _] => Some(PathLocation::Tier {
                owner: TierOwner::domain(*domain),
                tier: Tier::from_dir_name(tier)?,
                file,
            }),
            ["domains", domain, "participants", participant, "msgs", tier, _] => {
                Some(PathLocation::Tier {
                    owner: TierOwner::participant(*domain, *participant),
                    tier: Tier::from_dir_name(tier)?,
                    file,
                })
            }
            _ => None,
        }
    }
}

/// Live message filenames in a directory, sorted. A missing directory is empty.
pub fn list_messages(dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| is_live_message_name(name))
        .collect();
    names.sort();
    Ok(names)
}

fn list_subdirs(dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    Ok(names)
}
