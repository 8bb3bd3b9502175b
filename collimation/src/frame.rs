//! Raw detector frames and their metadata.

use std::collections::BTreeMap;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::config::Observatory;

/// Which Hartmann door was closed for an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HartmannSide {
    Left,
    Right,
}

impl HartmannSide {
    pub fn opposite(self) -> Self {
        match self {
            HartmannSide::Left => HartmannSide::Right,
            HartmannSide::Right => HartmannSide::Left,
        }
    }

    /// Header value written for this side
    pub fn header_value(self) -> &'static str {
        match self {
            HartmannSide::Left => "Left",
            HartmannSide::Right => "Right",
        }
    }
}

/// Header cards of an exposure, keyed by upper-case card name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    cards: BTreeMap<String, String>,
}

impl FrameHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.cards.get(&key.to_ascii_uppercase()).map(String::as_str)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.cards.insert(key.to_ascii_uppercase(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.cards.remove(&key.to_ascii_uppercase())
    }

    /// Door side recorded in the header.
    ///
    /// Dithered flats carry it in `OBSCOMM`; regular arcs in `HARTMANN`.
    pub fn hartmann_side(&self) -> Option<HartmannSide> {
        match self.get("OBSCOMM") {
            Some("{focus, hartmann l}") => return Some(HartmannSide::Left),
            Some("{focus, hartmann r}") => return Some(HartmannSide::Right),
            _ => {}
        }
        match self.get("HARTMANN").map(str::trim) {
            Some("Left") => Some(HartmannSide::Left),
            Some("Right") => Some(HartmannSide::Right),
            _ => None,
        }
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for FrameHeader {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut header = FrameHeader::new();
        for (k, v) in iter {
            header.insert(k.as_ref(), v);
        }
        header
    }
}

/// Everything known about an exposure besides its pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub camera: String,
    pub spectrograph: String,
    pub observatory: Observatory,
    /// Sequential exposure number
    pub exposure_id: u64,
    /// Exposure time in seconds
    pub exposure_time: f64,
    pub lamps: Vec<String>,
    /// Collimator position at capture, in motor steps
    pub collimator_position: Option<f64>,
    pub header: FrameHeader,
}

/// A raw detector frame. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Array2<u16>,
    meta: FrameMetadata,
}

impl Frame {
    pub fn new(data: Array2<u16>, meta: FrameMetadata) -> Self {
        Self { data, meta }
    }

    pub fn data(&self) -> ArrayView2<'_, u16> {
        self.data.view()
    }

    pub fn meta(&self) -> &FrameMetadata {
        &self.meta
    }

    pub fn camera(&self) -> &str {
        &self.meta.camera
    }

    /// `(rows, cols)`
    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn hartmann_side(&self) -> Option<HartmannSide> {
        self.meta.header.hartmann_side()
    }
}

/// The two Hartmann exposures of one camera, in the order they were taken.
#[derive(Debug, Clone)]
pub struct FramePair {
    pub first: Frame,
    pub second: Frame,
}

impl FramePair {
    pub fn new(first: Frame, second: Frame) -> Self {
        Self { first, second }
    }

    pub fn camera(&self) -> &str {
        self.first.camera()
    }
}
