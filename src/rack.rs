use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeSet;
use std::fmt;

lazy_static! {
    static ref LABEL_PATTERN: Regex = Regex::new(r"^([A-Za-z]{1,2})\s*0*([1-9][0-9]*)$")
        .expect("Invalid rack position label pattern");
}

/// A well coordinate. Positions with equal indices are interchangeable, so
/// this is a plain `Copy` value ordered row-major.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RackPosition {
    pub row_index: u16,
    pub column_index: u16,
}

impl RackPosition {
    pub const fn new(row_index: u16, column_index: u16) -> Self {
        Self {
            row_index,
            column_index,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let caps = LABEL_PATTERN.captures(label.trim())?;
        let letters = caps.get(1)?.as_str().to_ascii_uppercase();
        let mut row: u32 = 0;
        for b in letters.bytes() {
            row = row * 26 + (b - b'A' + 1) as u32;
        }
        let column: u32 = caps.get(2)?.as_str().parse().ok()?;
        if row == 0 || column == 0 || row > u16::MAX as u32 || column > u16::MAX as u32 {
            return None;
        }
        Some(Self::new((row - 1) as u16, (column - 1) as u16))
    }

    pub fn row_label(&self) -> String {
        let mut n = self.row_index as u32 + 1;
        let mut letters = vec![];
        while n > 0 {
            let rem = (n - 1) % 26;
            letters.push(b'A' + rem as u8);
            n = (n - 1) / 26;
        }
        letters.reverse();
        String::from_utf8_lossy(&letters).to_string()
    }

    /// "A1" … "P24"
    pub fn label(&self) -> String {
        format!("{}{}", self.row_label(), self.column_index + 1)
    }
}

impl fmt::Display for RackPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RackShape {
    pub rows: u16,
    pub columns: u16,
}

pub const SHAPE_96: RackShape = RackShape {
    rows: 8,
    columns: 12,
};
pub const SHAPE_384: RackShape = RackShape {
    rows: 16,
    columns: 24,
};

impl RackShape {
    /// Only 8x12 and 16x24 are supported.
    pub fn from_dimensions(rows: u16, columns: u16) -> Option<Self> {
        match (rows, columns) {
            (8, 12) => Some(SHAPE_96),
            (16, 24) => Some(SHAPE_384),
            _ => None,
        }
    }

    pub fn name(&self) -> String {
        format!("{}x{}", self.rows, self.columns)
    }

    pub fn size(&self) -> usize {
        self.rows as usize * self.columns as usize
    }

    pub fn is_384(&self) -> bool {
        *self == SHAPE_384
    }

    pub fn contains(&self, position: &RackPosition) -> bool {
        position.row_index < self.rows && position.column_index < self.columns
    }

    /// All positions, row-major.
    pub fn positions(&self) -> impl Iterator<Item = RackPosition> + '_ {
        (0..self.rows).flat_map(move |r| (0..self.columns).map(move |c| RackPosition::new(r, c)))
    }

    pub fn row_positions(&self, row_index: u16) -> impl Iterator<Item = RackPosition> + '_ {
        (0..self.columns).map(move |c| RackPosition::new(row_index, c))
    }
}

pub const NUMBER_SECTORS: u8 = 4;

/// Translates between a 384-well plate and the four 96-well sub-grids
/// ("sectors"/quadrants) a sector-bound pipetting robot addresses at once.
pub struct QuadrantTranslator;

impl QuadrantTranslator {
    /// Sector index `(r mod 2) * 2 + (c mod 2)`.
    pub fn sector_index(position: &RackPosition) -> u8 {
        ((position.row_index % 2) * 2 + (position.column_index % 2)) as u8
    }

    /// The 96-well position a 384-well position corresponds to in its sector.
    pub fn to_96(position: &RackPosition) -> RackPosition {
        RackPosition::new(position.row_index / 2, position.column_index / 2)
    }

    /// The 384-well position of a 96-well position within a sector.
    pub fn to_384(position: &RackPosition, sector_index: u8) -> RackPosition {
        RackPosition::new(
            position.row_index * 2 + (sector_index / 2) as u16,
            position.column_index * 2 + (sector_index % 2) as u16,
        )
    }

    /// The 2x2 block ("quadrant") a 384-well position lies in, as its
    /// row-major block index.
    pub fn quadrant_index(position: &RackPosition) -> usize {
        let block = Self::to_96(position);
        block.row_index as usize * SHAPE_96.columns as usize + block.column_index as usize
    }

    pub fn sector_positions(shape: &RackShape, sector_index: u8) -> Vec<RackPosition> {
        shape
            .positions()
            .filter(|p| Self::sector_index(p) == sector_index)
            .collect()
    }
}

/// A set of rack positions with a content hash used for deduplication at the
/// persistence boundary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RackPositionSet {
    positions: BTreeSet<RackPosition>,
}

impl RackPositionSet {
    pub fn new(positions: impl IntoIterator<Item = RackPosition>) -> Self {
        Self {
            positions: positions.into_iter().collect(),
        }
    }

    pub fn positions(&self) -> &BTreeSet<RackPosition> {
        &self.positions
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, position: &RackPosition) -> bool {
        self.positions.contains(position)
    }

    /// SHA-1 over the sorted member indices.
    pub fn hash_value(&self) -> String {
        let mut hasher = Sha1::new();
        for p in &self.positions {
            hasher.update(format!("{},{};", p.row_index, p.column_index).as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn labels(&self) -> Vec<String> {
        self.positions.iter().map(|p| p.label()).collect()
    }
}
