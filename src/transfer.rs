use crate::error::{IsoError, IsoResult};
use crate::rack::RackPosition;
use crate::units::{get_trimmed_string, microlitre_to_litre, round_up};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

pub const DEFAULT_DILUENT: &str = "buffer";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferKind {
    SampleDilution,
    SampleTransfer,
    RackSampleTransfer,
}

impl TransferKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SampleDilution => "SAMPLE_DILUTION",
            Self::SampleTransfer => "SAMPLE_TRANSFER",
            Self::RackSampleTransfer => "RACK_SAMPLE_TRANSFER",
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One liquid handling step. Volumes are µL, rounded up to one decimal on
/// construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PlannedTransfer {
    SampleDilution {
        volume: f64,
        target_position: RackPosition,
        diluent_info: String,
    },
    SampleTransfer {
        volume: f64,
        source_position: RackPosition,
        target_position: RackPosition,
    },
    RackSampleTransfer {
        volume: f64,
        number_sectors: u8,
        source_sector: u8,
        target_sector: u8,
    },
}

impl PlannedTransfer {
    pub fn dilution(volume: f64, target_position: RackPosition, diluent_info: &str) -> Self {
        Self::SampleDilution {
            volume: round_up(volume, 1),
            target_position,
            diluent_info: diluent_info.to_string(),
        }
    }

    pub fn transfer(volume: f64, source_position: RackPosition, target_position: RackPosition) -> Self {
        Self::SampleTransfer {
            volume: round_up(volume, 1),
            source_position,
            target_position,
        }
    }

    pub fn rack_transfer(volume: f64, number_sectors: u8, source_sector: u8, target_sector: u8) -> Self {
        Self::RackSampleTransfer {
            volume: round_up(volume, 1),
            number_sectors,
            source_sector,
            target_sector,
        }
    }

    pub fn kind(&self) -> TransferKind {
        match self {
            Self::SampleDilution { .. } => TransferKind::SampleDilution,
            Self::SampleTransfer { .. } => TransferKind::SampleTransfer,
            Self::RackSampleTransfer { .. } => TransferKind::RackSampleTransfer,
        }
    }

    pub fn volume(&self) -> f64 {
        match self {
            Self::SampleDilution { volume, .. }
            | Self::SampleTransfer { volume, .. }
            | Self::RackSampleTransfer { volume, .. } => *volume,
        }
    }

    /// Volume in litres, for the persistence boundary.
    pub fn volume_litre(&self) -> f64 {
        microlitre_to_litre(self.volume())
    }

    /// Ordered normalized fields, volume first.
    pub fn fields(&self) -> Vec<String> {
        let volume = get_trimmed_string(self.volume());
        match self {
            Self::SampleDilution {
                target_position,
                diluent_info,
                ..
            } => vec![volume, target_position.label(), diluent_info.clone()],
            Self::SampleTransfer {
                source_position,
                target_position,
                ..
            } => vec![volume, source_position.label(), target_position.label()],
            Self::RackSampleTransfer {
                number_sectors,
                source_sector,
                target_sector,
                ..
            } => vec![
                volume,
                number_sectors.to_string(),
                source_sector.to_string(),
                target_sector.to_string(),
            ],
        }
    }

    pub fn hash_value(&self) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.fields().join(";").as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn from_fields(kind: TransferKind, fields: &[String]) -> IsoResult<Self> {
        let invalid = || {
            IsoError::programmer(format!(
                "Invalid fields for a {kind}: {}",
                fields.join(";")
            ))
        };
        let volume: f64 = fields
            .first()
            .and_then(|v| v.parse().ok())
            .ok_or_else(invalid)?;
        let position = |idx: usize| {
            fields
                .get(idx)
                .and_then(|v| RackPosition::from_label(v))
                .ok_or_else(invalid)
        };
        let sector = |idx: usize| {
            fields
                .get(idx)
                .and_then(|v| v.parse::<u8>().ok())
                .ok_or_else(invalid)
        };
        let ret = match kind {
            TransferKind::SampleDilution => {
                if fields.len() != 3 {
                    return Err(invalid());
                }
                Self::dilution(volume, position(1)?, &fields[2])
            }
            TransferKind::SampleTransfer => {
                if fields.len() != 3 {
                    return Err(invalid());
                }
                Self::transfer(volume, position(1)?, position(2)?)
            }
            TransferKind::RackSampleTransfer => {
                if fields.len() != 4 {
                    return Err(invalid());
                }
                Self::rack_transfer(volume, sector(1)?, sector(2)?, sector(3)?)
            }
        };
        Ok(ret)
    }

    /// Rebuilds a transfer from persisted fields and checks its hash.
    pub fn from_hash(hash: &str, kind: TransferKind, fields: &[String]) -> IsoResult<Self> {
        let ret = Self::from_fields(kind, fields)?;
        if ret.hash_value() != hash {
            return Err(IsoError::programmer(format!(
                "Hash {hash} does not match transfer fields {}",
                fields.join(";")
            )));
        }
        Ok(ret)
    }
}

/// Deduplicates planned transfers by content hash. The hash covers the
/// fields only, so entries are keyed by kind as well.
#[derive(Clone, Debug, Default)]
pub struct TransferRegistry {
    transfers: HashMap<(TransferKind, String), PlannedTransfer>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `transfer` and returns its hash. An existing entry of the
    /// same kind with the same hash must be structurally equal.
    pub fn register(&mut self, transfer: &PlannedTransfer) -> IsoResult<String> {
        let hash = transfer.hash_value();
        let key = (transfer.kind(), hash.clone());
        match self.transfers.get(&key) {
            Some(existing) if existing != transfer => Err(IsoError::programmer(format!(
                "Planned transfers with hash {hash} differ: {existing:?} vs {transfer:?}"
            ))),
            Some(_) => Ok(hash),
            None => {
                self.transfers.insert(key, transfer.clone());
                Ok(hash)
            }
        }
    }

    pub fn get(&self, kind: TransferKind, hash: &str) -> Option<&PlannedTransfer> {
        self.transfers.get(&(kind, hash.to_string()))
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

/// Transfers of one kind, executed by one pipetting spec.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedWorklist {
    pub label: String,
    pub kind: TransferKind,
    pub pipetting_specs: String,
    pub source_marker: Option<String>,
    pub target_marker: String,
    transfers: BTreeMap<String, PlannedTransfer>,
}

impl PlannedWorklist {
    pub fn new(
        label: &str,
        kind: TransferKind,
        pipetting_specs: &str,
        source_marker: Option<&str>,
        target_marker: &str,
    ) -> Self {
        Self {
            label: label.to_string(),
            kind,
            pipetting_specs: pipetting_specs.to_string(),
            source_marker: source_marker.map(str::to_string),
            target_marker: target_marker.to_string(),
            transfers: BTreeMap::new(),
        }
    }

    pub fn add_transfer(&mut self, transfer: PlannedTransfer) -> IsoResult<()> {
        if transfer.kind() != self.kind {
            return Err(IsoError::programmer(format!(
                "Worklist {} holds {} transfers, got a {}",
                self.label,
                self.kind,
                transfer.kind()
            )));
        }
        self.transfers.insert(transfer.hash_value(), transfer);
        Ok(())
    }

    pub fn transfers(&self) -> impl Iterator<Item = &PlannedTransfer> {
        self.transfers.values()
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn total_volume(&self) -> f64 {
        self.transfers.values().map(PlannedTransfer::volume).sum()
    }
}

/// Worklists keyed by execution index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorklistSeries {
    worklists: BTreeMap<u32, PlannedWorklist>,
}

impl WorklistSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worklist(&mut self, index: u32, worklist: PlannedWorklist) -> IsoResult<()> {
        if self.worklists.contains_key(&index) {
            return Err(IsoError::programmer(format!(
                "Worklist series index {index} is already taken"
            )));
        }
        self.worklists.insert(index, worklist);
        Ok(())
    }

    /// Appends at the next free index and returns it.
    pub fn push(&mut self, worklist: PlannedWorklist) -> u32 {
        let index = self.worklists.keys().next_back().map_or(0, |i| i + 1);
        self.worklists.insert(index, worklist);
        index
    }

    pub fn get(&self, index: u32) -> Option<&PlannedWorklist> {
        self.worklists.get(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &PlannedWorklist)> {
        self.worklists.iter().map(|(i, w)| (*i, w))
    }

    pub fn len(&self) -> usize {
        self.worklists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.worklists.is_empty()
    }
}
