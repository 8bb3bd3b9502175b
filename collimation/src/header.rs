//! Header sanity checks run before a frame is analysed.
//!
//! A Hartmann arc is only useful if the flat-field screen is closed and the
//! arc lamps for the site are all on. Failures exclude the camera; the
//! flat-field screen check can be bypassed on request.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::Observatory;
use crate::frame::FrameHeader;

const FFS_PETALS: usize = 8;
const LAMPS_PER_TYPE: usize = 4;

/// A check the operator has asked to skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bypass {
    /// Flat-field screen state
    Ffs,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("unknown bypass {0:?}; the only supported bypass is \"ffs\"")]
pub struct UnknownBypass(pub String);

impl FromStr for Bypass {
    type Err = UnknownBypass;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ffs" => Ok(Bypass::Ffs),
            other => Err(UnknownBypass(other.to_string())),
        }
    }
}

impl fmt::Display for Bypass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bypass::Ffs => write!(f, "ffs"),
        }
    }
}

/// Outcome of checking one header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderVerdict {
    /// Non-fatal findings
    pub warnings: Vec<String>,
    /// Findings that make the frame unusable
    pub failures: Vec<String>,
    /// Failures downgraded to warnings by a bypass
    pub bypassed: Vec<String>,
}

impl HeaderVerdict {
    pub fn is_usable(&self) -> bool {
        self.failures.is_empty()
    }

    /// Every finding worth logging, warnings first, each exactly once
    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.warnings
            .iter()
            .chain(&self.failures)
            .map(String::as_str)
    }

    /// Fold another verdict into this one
    pub fn merge(&mut self, other: HeaderVerdict) {
        self.warnings.extend(other.warnings);
        self.failures.extend(other.failures);
        self.bypassed.extend(other.bypassed);
    }
}

/// Parse a card of space-separated 0/1 flags into the number of ones.
fn count_flags(value: &str, expected: usize) -> Option<usize> {
    let flags: Vec<u8> = value
        .split_whitespace()
        .map(|tok| tok.parse::<u8>().ok().filter(|v| *v <= 1))
        .collect::<Option<_>>()?;
    (flags.len() == expected).then(|| flags.iter().map(|&v| v as usize).sum())
}

fn check_ffs(camera: &str, header: &FrameHeader, verdict: &mut HeaderVerdict) -> Option<String> {
    let Some(value) = header.get("FFS") else {
        return Some(format!("{camera}: flat-field screen state (FFS) not in header"));
    };

    match count_flags(value, FFS_PETALS) {
        None => Some(format!(
            "{camera}: cannot read flat-field screen state FFS={value:?}"
        )),
        Some(0) => Some(format!(
            "{camera}: flat-field screen is open, no petals closed: {value}"
        )),
        Some(closed) if closed < FFS_PETALS => {
            verdict.warnings.push(format!(
                "{camera}: only {closed} of {FFS_PETALS} flat-field petals closed: {value}"
            ));
            None
        }
        Some(_) => None,
    }
}

/// Header card, display name, and the site that requires it (`None` for all sites)
const LAMP_CARDS: [(&str, &str, Option<Observatory>); 3] = [
    ("NE", "Ne", None),
    ("HGCD", "HgCd", Some(Observatory::Apo)),
    ("HEAR", "HeAr", Some(Observatory::Lco)),
];

fn check_lamps(
    camera: &str,
    header: &FrameHeader,
    observatory: Observatory,
    verdict: &mut HeaderVerdict,
) {
    for (card, name, site) in LAMP_CARDS {
        if site.is_some_and(|s| s != observatory) {
            continue;
        }
        match header.get(card) {
            None => verdict
                .failures
                .push(format!("{camera}: {name} lamp state ({card}) not in header")),
            Some(value) => match count_flags(value, LAMPS_PER_TYPE) {
                None => verdict
                    .failures
                    .push(format!("{camera}: cannot read {name} lamp state {card}={value:?}")),
                Some(on) if on < LAMPS_PER_TYPE => verdict.failures.push(format!(
                    "{camera}: {on} of {LAMPS_PER_TYPE} {name} lamps are on: {value}"
                )),
                Some(_) => {}
            },
        }
    }
}

/// Check the flat-field screen and arc lamp cards of one exposure.
pub fn validate_header(
    camera: &str,
    header: &FrameHeader,
    observatory: Observatory,
    bypass: &[Bypass],
) -> HeaderVerdict {
    let mut verdict = HeaderVerdict::default();

    if let Some(failure) = check_ffs(camera, header, &mut verdict) {
        if bypass.contains(&Bypass::Ffs) {
            verdict.bypassed.push(failure.clone());
            verdict.warnings.push(format!("{failure}; check bypassed"));
        } else {
            verdict.failures.push(failure);
        }
    }

    check_lamps(camera, header, observatory, &mut verdict);

    for message in verdict.messages() {
        warn!("{message}");
    }

    verdict
}
