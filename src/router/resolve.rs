// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Destination resolution.
//!
//! Order for a `to` address:
//! 1. `domain/participant` is used as written.
//! 2. A bare name matching a domain directory goes to that domain's entry
//!    point, else its first configured participant, else the configured
//!    fallback participant.
//! 3. Any other bare name is a participant in the sender's domain.

use std::fmt;

use tracing::warn;

use crate::config::DomainConfig;
use crate::error::{BusError, Result};
use crate::events::RoutingHint;
use crate::message::Address;
use crate::paths::{BusPaths, TierOwner};

/// How a destination was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    Explicit,
    EntryPoint,
    FirstParticipant,
    /// No default configured; the hardcoded fallback participant was used.
    Fallback,
    SameDomain,
}

impl fmt::Display for RouteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Explicit => "explicit",
            Self::EntryPoint => "entry-point",
            Self::FirstParticipant => "first-participant",
            Self::Fallback => "fallback",
            Self::SameDomain => "same-domain",
        };
        f.write_str(s)
    }
}

/// A resolved destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub domain: String,
    pub participant: String,
    pub source: RouteSource,
}

impl Resolution {
    pub fn owner(&self) -> TierOwner {
        TierOwner::participant(self.domain.clone(), self.participant.clone())
    }
}

/// Resolves addresses against the domain directories and their configs.
#[derive(Debug, Clone)]
pub struct Resolver {
    paths: BusPaths,
    fallback_participant: String,
}

impl Resolver {
    pub fn new(paths: BusPaths, fallback_participant: impl Into<String>) -> Self {
        Self {
            paths,
            fallback_participant: fallback_participant.into(),
        }
    }

    /// Resolve `to` for a message sent from `sender_domain`.
    ///
    /// Fails with [`BusError::DomainNotFound`] when the resolved domain has
    /// no directory, or when a bare participant has no sender domain to
    /// belong to.
    pub fn resolve(&self, to: &Address, sender_domain: Option<&str>) -> Result<Resolution> {
        let resolution = self.choose(to, sender_domain)?;
        if !self.paths.domain_exists(&resolution.domain) {
            return Err(BusError::DomainNotFound(resolution.domain));
        }
        Ok(resolution)
    }

    fn choose(&self, to: &Address, sender_domain: Option<&str>) -> Result<Resolution> {
        if let Some(domain) = &to.domain {
            return Ok(Resolution {
                domain: domain.clone(),
                participant: to.name.clone(),
                source: RouteSource::Explicit,
            });
        }

        if self.paths.domain_exists(&to.name) {
            let (participant, source) = self.default_participant(&to.name);
            return Ok(Resolution {
                domain: to.name.clone(),
                participant,
                source,
            });
        }

        match sender_domain {
            Some(domain) => Ok(Resolution {
                domain: domain.to_string(),
                participant: to.name.clone(),
                source: RouteSource::SameDomain,
            }),
            None => Err(BusError::DomainNotFound(to.name.clone())),
        }
    }

    /// The participant that receives messages addressed to a bare domain.
    pub fn default_participant(&self, domain: &str) -> (String, RouteSource) {
        let config = match DomainConfig::load(&self.paths, domain) {
            Ok(config) => config,
            Err(e) => {
                warn!(domain, "Unreadable domain config: {}", e);
                None
            }
        };
        if let Some(config) = config {
            if let Some(entry) = config.entry_point.filter(|e| !e.is_empty()) {
                return (entry, RouteSource::EntryPoint);
            }
            if let Some(first) = config.participants.into_iter().next() {
                return (first, RouteSource::FirstParticipant);
            }
        }
        (self.fallback_participant.clone(), RouteSource::Fallback)
    }

    /// Best-effort hint for the watch layer. Never fails and records nothing.
    pub fn hint(&self, to: &Address, sender_domain: Option<&str>) -> RoutingHint {
        match self.choose(to, sender_domain) {
            Ok(resolution) => RoutingHint {
                domain: Some(resolution.domain),
                participant: resolution.participant,
            },
            Err(_) => RoutingHint {
                domain: None,
                participant: to.name.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Resolver) {
        let temp = TempDir::new().unwrap();
        let paths = BusPaths::new(temp.path());
        for domain in ["alpha", "beta", "gamma"] {
            paths.ensure_owner_dirs(&TierOwner::domain(domain)).unwrap();
        }
        DomainConfig {
            participants: vec!["a1".into(), "a2".into()],
            entry_point: Some("a2".into()),
            workflow: None,
        }
        .save(&paths, "alpha")
        .unwrap();
        DomainConfig {
            participants: vec!["b1".into()],
            entry_point: None,
            workflow: None,
        }
        .save(&paths, "beta")
        .unwrap();
        let resolver = Resolver::new(paths, "coordinator");
        (temp, resolver)
    }

    #[test]
    fn test_explicit_address() {
        let (_temp, resolver) = setup();
        let r = resolver
            .resolve(&Address::qualified("beta", "x"), Some("alpha"))
            .unwrap();
        assert_eq!((r.domain.as_str(), r.participant.as_str()), ("beta", "x"));
        assert_eq!(r.source, RouteSource::Explicit);
    }

    #[test]
    fn test_bare_domain_defaults() {
        let (_temp, resolver) = setup();
        let r = resolver.resolve(&Address::bare("alpha"), None).unwrap();
        assert_eq!((r.participant.as_str(), r.source), ("a2", RouteSource::EntryPoint));

        let r = resolver.resolve(&Address::bare("beta"), None).unwrap();
        assert_eq!(
            (r.participant.as_str(), r.source),
            ("b1", RouteSource::FirstParticipant)
        );

        let r = resolver.resolve(&Address::bare("gamma"), None).unwrap();
        assert_eq!(
            (r.participant.as_str(), r.source),
            ("coordinator", RouteSource::Fallback)
        );
    }

    #[test]
    fn test_bare_participant_is_same_domain() {
        let (_temp, resolver) = setup();
        let r = resolver.resolve(&Address::bare("a1"), Some("alpha")).unwrap();
        assert_eq!(r.owner(), TierOwner::participant("alpha", "a1"));
        assert_eq!(r.source, RouteSource::SameDomain);
    }

    #[test]
    fn test_missing_domain() {
        let (_temp, resolver) = setup();
        assert!(matches!(
            resolver.resolve(&Address::qualified("nowhere", "x"), None),
            Err(BusError::DomainNotFound(d)) if d == "nowhere"
        ));
        assert!(matches!(
            resolver.resolve(&Address::bare("stray"), None),
            Err(BusError::DomainNotFound(_))
        ));
    }

    #[test]
    fn test_hint_never_fails() {
        let (_temp, resolver) = setup();
        let hint = resolver.hint(&Address::bare("stray"), None);
        assert_eq!(hint.domain, None);
        assert_eq!(hint.participant, "stray");

        let hint = resolver.hint(&Address::qualified("nowhere", "x"), None);
        assert_eq!(hint.domain.as_deref(), Some("nowhere"));
    }
}
