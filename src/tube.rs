//! Stock tube lookup, confirmation and replacement.

use crate::error::{IsoError, IsoResult};
use crate::pool::MoleculeDesignPool;
use crate::rack::RackPosition;
use crate::units::{are_equal_values, is_smaller_than};
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A stock tube that can serve a pool.
#[derive(Clone, Debug, PartialEq)]
pub struct TubeCandidate {
    pub tube_barcode: String,
    pub pool: Arc<MoleculeDesignPool>,
    pub rack_barcode: String,
    pub position: RackPosition,
    /// Available volume in µL.
    pub volume_ul: f64,
    pub concentration_nm: f64,
    /// Barcoded location of the rack, filled in after selection.
    pub location: Option<String>,
}

impl TubeCandidate {
    pub fn new(
        tube_barcode: &str,
        pool: Arc<MoleculeDesignPool>,
        rack_barcode: &str,
        position: RackPosition,
        volume_ul: f64,
    ) -> Self {
        let concentration_nm = pool.stock_concentration_nm();
        Self {
            tube_barcode: tube_barcode.to_string(),
            pool,
            rack_barcode: rack_barcode.to_string(),
            position,
            volume_ul,
            concentration_nm,
            location: None,
        }
    }

    pub fn pool_id(&self) -> u64 {
        self.pool.id
    }
}

/// Read-only view of the stock repository. Only managed tubes are visible.
pub trait StockDatabase {
    fn tubes_by_barcodes(&self, barcodes: &[String]) -> IsoResult<Vec<TubeCandidate>>;

    /// Tubes of a pool at the given concentration holding at least
    /// `min_volume_ul`, in repository order.
    fn tubes_for_pool(&self, pool_id: u64, concentration_nm: f64, min_volume_ul: f64) -> IsoResult<Vec<TubeCandidate>>;

    /// Rack barcode -> barcoded location name.
    fn rack_locations(&self, rack_barcodes: &[String]) -> IsoResult<BTreeMap<String, String>>;
}

#[derive(Clone, Debug)]
struct StoredTube {
    tube: TubeCandidate,
    managed: bool,
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryStockDatabase {
    tubes: Vec<StoredTube>,
    locations: BTreeMap<String, String>,
}

impl InMemoryStockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tube(&mut self, tube: TubeCandidate) {
        self.tubes.push(StoredTube { tube, managed: true });
    }

    /// Tubes that are not managed stay invisible to all queries.
    pub fn add_unmanaged_tube(&mut self, tube: TubeCandidate) {
        self.tubes.push(StoredTube { tube, managed: false });
    }

    pub fn set_rack_location(&mut self, rack_barcode: &str, location: &str) {
        self.locations
            .insert(rack_barcode.to_string(), location.to_string());
    }

    fn managed(&self) -> impl Iterator<Item = &TubeCandidate> {
        self.tubes.iter().filter(|t| t.managed).map(|t| &t.tube)
    }
}

impl StockDatabase for InMemoryStockDatabase {
    fn tubes_by_barcodes(&self, barcodes: &[String]) -> IsoResult<Vec<TubeCandidate>> {
        let wanted: BTreeSet<&str> = barcodes.iter().map(String::as_str).collect();
        Ok(self
            .managed()
            .filter(|t| wanted.contains(t.tube_barcode.as_str()))
            .cloned()
            .collect())
    }

    fn tubes_for_pool(&self, pool_id: u64, concentration_nm: f64, min_volume_ul: f64) -> IsoResult<Vec<TubeCandidate>> {
        Ok(self
            .managed()
            .filter(|t| t.pool_id() == pool_id)
            .filter(|t| are_equal_values(t.concentration_nm, concentration_nm))
            .filter(|t| !is_smaller_than(t.volume_ul, min_volume_ul))
            .cloned()
            .collect())
    }

    fn rack_locations(&self, rack_barcodes: &[String]) -> IsoResult<BTreeMap<String, String>> {
        Ok(rack_barcodes
            .iter()
            .filter_map(|b| self.locations.get(b).map(|l| (b.clone(), l.clone())))
            .collect())
    }
}

/// The stock demand of one pool plus the tube chosen to serve it.
#[derive(Clone, Debug, PartialEq)]
pub struct StockTubeContainer {
    pub pool: Arc<MoleculeDesignPool>,
    /// Scheduled tube, if one was picked earlier.
    pub tube_barcode: Option<String>,
    pub expected_rack_barcode: Option<String>,
    /// µL, without the tube dead volume.
    pub required_volume: f64,
    pub tube_candidate: Option<TubeCandidate>,
}

impl StockTubeContainer {
    pub fn new(pool: Arc<MoleculeDesignPool>, required_volume: f64) -> Self {
        Self {
            pool,
            tube_barcode: None,
            expected_rack_barcode: None,
            required_volume,
            tube_candidate: None,
        }
    }

    pub fn scheduled(mut self, tube_barcode: &str, rack_barcode: &str) -> Self {
        self.tube_barcode = Some(tube_barcode.to_string());
        self.expected_rack_barcode = Some(rack_barcode.to_string());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum ReplacementReason {
    NotScheduled,
    NotFound,
    Concentration,
    Volume,
    ExcludedRack,
}

impl ReplacementReason {
    fn message(self) -> Option<&'static str> {
        match self {
            Self::NotScheduled => None,
            Self::NotFound => Some("Some scheduled tubes could not be found in the stock"),
            Self::Concentration => Some(
                "Some scheduled tubes had to be replaced because their concentration does not match the stock concentration",
            ),
            Self::Volume => Some("Some scheduled tubes had to be replaced because their volume was not sufficient"),
            Self::ExcludedRack => Some("Some scheduled tubes had to be replaced because their racks are excluded"),
        }
    }
}

/// Confirms scheduled stock tubes and finds replacements for those that no
/// longer qualify.
pub struct TubeConfirmer<'a> {
    db: &'a dyn StockDatabase,
    stock_dead_volume: f64,
    excluded_racks: BTreeSet<String>,
    requested_tubes: Vec<String>,
}

impl<'a> TubeConfirmer<'a> {
    pub fn new(db: &'a dyn StockDatabase, stock_dead_volume: f64) -> Self {
        Self {
            db,
            stock_dead_volume,
            excluded_racks: BTreeSet::new(),
            requested_tubes: vec![],
        }
    }

    pub fn with_excluded_racks(mut self, racks: &[String]) -> Self {
        self.excluded_racks = racks.iter().map(|r| r.trim().to_string()).collect();
        self
    }

    pub fn with_requested_tubes(mut self, tubes: &[String]) -> Self {
        self.requested_tubes = tubes.iter().map(|t| t.trim().to_string()).collect();
        self
    }

    /// Updates the containers in place and returns the warnings. A
    /// container without a candidate afterwards could not be served.
    pub fn run(&self, containers: &mut BTreeMap<u64, StockTubeContainer>) -> IsoResult<Vec<String>> {
        let mut warnings = vec![];
        let requested = self.check_requested_tubes(containers, &mut warnings)?;
        let replace = self.confirm_scheduled_tubes(containers)?;
        self.find_replacements(containers, &requested, &replace, &mut warnings)?;
        self.resolve_rack_locations(containers)?;

        let by_reason = replace.into_iter().into_group_map_by(|(_, r)| *r);
        for (reason, pools) in by_reason.into_iter().sorted_by_key(|(r, _)| *r) {
            let Some(message) = reason.message() else {
                continue;
            };
            let details = pools
                .iter()
                .filter_map(|(pool_id, _)| containers.get(pool_id))
                .map(|c| {
                    let old = c.tube_barcode.as_deref().unwrap_or("-");
                    let new = c.tube_candidate.as_ref().map_or("none", |t| t.tube_barcode.as_str());
                    format!("{} ({old} -> {new})", c.pool.id)
                })
                .join(", ");
            warnings.push(format!("{message}: {details}."));
        }
        for warning in &warnings {
            warn!(%warning, "stock tube confirmation");
        }
        Ok(warnings)
    }

    /// Requested tubes replace the scheduled tubes of their pools.
    fn check_requested_tubes(
        &self,
        containers: &mut BTreeMap<u64, StockTubeContainer>,
        warnings: &mut Vec<String>,
    ) -> IsoResult<BTreeMap<u64, TubeCandidate>> {
        if self.requested_tubes.is_empty() {
            return Ok(BTreeMap::new());
        }
        let tubes = self.db.tubes_by_barcodes(&self.requested_tubes)?;
        let found: BTreeSet<&str> = tubes.iter().map(|t| t.tube_barcode.as_str()).collect();
        let missing = self
            .requested_tubes
            .iter()
            .filter(|b| !found.contains(b.as_str()))
            .join(", ");
        if !missing.is_empty() {
            warnings.push(format!("The following requested tubes could not be found: {missing}."));
        }

        let by_pool = tubes.into_iter().into_group_map_by(TubeCandidate::pool_id);
        let mut ret = BTreeMap::new();
        let mut multiple = vec![];
        let mut unused = vec![];
        for (pool_id, mut tubes) in by_pool.into_iter().sorted_by_key(|(id, _)| *id) {
            tubes.sort_by(|a, b| a.tube_barcode.cmp(&b.tube_barcode));
            if tubes.len() > 1 {
                multiple.push(format!(
                    "{pool_id} ({})",
                    tubes.iter().map(|t| t.tube_barcode.as_str()).join(", ")
                ));
            }
            let tube = tubes.swap_remove(0);
            match containers.get_mut(&pool_id) {
                Some(container) => {
                    if container.tube_barcode.as_deref() != Some(tube.tube_barcode.as_str()) {
                        debug!(pool = pool_id, tube = %tube.tube_barcode, "requested tube replaces scheduled tube");
                        container.tube_barcode = Some(tube.tube_barcode.clone());
                        container.expected_rack_barcode = Some(tube.rack_barcode.clone());
                    }
                    ret.insert(pool_id, tube);
                }
                None => unused.push(format!("{} ({pool_id})", tube.tube_barcode)),
            }
        }
        if !multiple.is_empty() {
            warnings.push(format!(
                "There are several requested tubes for the following pools: {}. Only the first tube is used.",
                multiple.join("; ")
            ));
        }
        if !unused.is_empty() {
            warnings.push(format!(
                "The following requested tubes are not needed for this ISO request: {}.",
                unused.join(", ")
            ));
        }
        Ok(ret)
    }

    fn confirm_scheduled_tubes(
        &self,
        containers: &mut BTreeMap<u64, StockTubeContainer>,
    ) -> IsoResult<BTreeMap<u64, ReplacementReason>> {
        let barcodes: Vec<String> = containers
            .values()
            .filter_map(|c| c.tube_barcode.clone())
            .collect();
        let tubes = if barcodes.is_empty() {
            vec![]
        } else {
            self.db.tubes_by_barcodes(&barcodes)?
        };
        let mut by_pool: BTreeMap<u64, TubeCandidate> = BTreeMap::new();
        for tube in tubes {
            let pool_id = tube.pool_id();
            if let Some(other) = by_pool.insert(pool_id, tube) {
                return Err(IsoError::resource(format!(
                    "Several scheduled tubes found for pool {pool_id} (e.g. {}). Please check the stock data.",
                    other.tube_barcode
                )));
            }
        }

        let mut replace = BTreeMap::new();
        for (pool_id, container) in containers.iter_mut() {
            let scheduled = container.tube_barcode.clone();
            let reason = match (scheduled.as_deref(), by_pool.remove(pool_id)) {
                (None, _) => Some(ReplacementReason::NotScheduled),
                (Some(_), None) => Some(ReplacementReason::NotFound),
                (Some(barcode), Some(tube)) if tube.tube_barcode != barcode => Some(ReplacementReason::NotFound),
                (Some(_), Some(tube)) => {
                    let reason = self.reject_reason(container, &tube);
                    if reason.is_none() {
                        container.tube_candidate = Some(tube);
                    }
                    reason
                }
            };
            if let Some(reason) = reason {
                container.tube_candidate = None;
                replace.insert(*pool_id, reason);
            }
        }
        Ok(replace)
    }

    fn reject_reason(&self, container: &StockTubeContainer, tube: &TubeCandidate) -> Option<ReplacementReason> {
        if !are_equal_values(tube.concentration_nm, container.pool.stock_concentration_nm()) {
            Some(ReplacementReason::Concentration)
        } else if is_smaller_than(tube.volume_ul, container.required_volume + self.stock_dead_volume) {
            Some(ReplacementReason::Volume)
        } else if self.excluded_racks.contains(&tube.rack_barcode) {
            Some(ReplacementReason::ExcludedRack)
        } else {
            None
        }
    }

    fn find_replacements(
        &self,
        containers: &mut BTreeMap<u64, StockTubeContainer>,
        requested: &BTreeMap<u64, TubeCandidate>,
        replace: &BTreeMap<u64, ReplacementReason>,
        warnings: &mut Vec<String>,
    ) -> IsoResult<()> {
        let mut skipped = vec![];
        let mut unavailable = vec![];
        for pool_id in replace.keys() {
            let Some(container) = containers.get_mut(pool_id) else {
                continue;
            };
            let needed = container.required_volume + self.stock_dead_volume;
            let candidates = self
                .db
                .tubes_for_pool(*pool_id, container.pool.stock_concentration_nm(), needed)?;
            let (excluded, usable): (Vec<_>, Vec<_>) = candidates
                .into_iter()
                .partition(|t| self.excluded_racks.contains(&t.rack_barcode));
            skipped.extend(
                excluded
                    .iter()
                    .map(|t| format!("{} (rack {})", t.tube_barcode, t.rack_barcode)),
            );
            let preferred = requested.get(pool_id).map(|t| t.tube_barcode.as_str());
            let choice = usable
                .iter()
                .position(|t| Some(t.tube_barcode.as_str()) == preferred)
                .unwrap_or(0);
            container.tube_candidate = usable.into_iter().nth(choice);
            match &container.tube_candidate {
                Some(tube) => debug!(pool = pool_id, tube = %tube.tube_barcode, "replacement tube found"),
                None => unavailable.push(pool_id.to_string()),
            }
        }
        if !skipped.is_empty() {
            warnings.push(format!(
                "The following tubes were skipped because their racks are excluded: {}.",
                skipped.join(", ")
            ));
        }
        if !unavailable.is_empty() {
            warnings.push(format!(
                "Could not find a stock tube with sufficient volume for the following pools: {}.",
                unavailable.join(", ")
            ));
        }
        info!(
            replaced = replace.len() - unavailable.len(),
            unavailable = unavailable.len(),
            "stock tube replacement finished"
        );
        Ok(())
    }

    fn resolve_rack_locations(&self, containers: &mut BTreeMap<u64, StockTubeContainer>) -> IsoResult<()> {
        let racks: Vec<String> = containers
            .values()
            .filter_map(|c| c.tube_candidate.as_ref().map(|t| t.rack_barcode.clone()))
            .unique()
            .collect();
        if racks.is_empty() {
            return Ok(());
        }
        let locations = self.db.rack_locations(&racks)?;
        for tube in containers.values_mut().filter_map(|c| c.tube_candidate.as_mut()) {
            tube.location = locations.get(&tube.rack_barcode).cloned();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(id: u64) -> Arc<MoleculeDesignPool> {
        Arc::new(MoleculeDesignPool::new(id, "SIRNA", 5e-5))
    }

    fn tube(barcode: &str, pool: &Arc<MoleculeDesignPool>, rack: &str, volume: f64) -> TubeCandidate {
        TubeCandidate::new(barcode, pool.clone(), rack, RackPosition::new(0, 0), volume)
    }

    fn containers(c: StockTubeContainer) -> BTreeMap<u64, StockTubeContainer> {
        [(c.pool.id, c)].into_iter().collect()
    }

    #[test]
    fn test_scheduled_tube_confirmed() {
        let p = pool(205200);
        let mut db = InMemoryStockDatabase::new();
        db.add_tube(tube("t1", &p, "R1", 50.0));
        db.set_rack_location("R1", "freezer 3");
        let mut map = containers(StockTubeContainer::new(p, 12.0).scheduled("t1", "R1"));
        let warnings = TubeConfirmer::new(&db, 5.0).run(&mut map).unwrap();
        assert!(warnings.is_empty());
        let candidate = map[&205200].tube_candidate.as_ref().unwrap();
        assert_eq!(candidate.tube_barcode, "t1");
        assert_eq!(candidate.location.as_deref(), Some("freezer 3"));
    }

    #[test]
    fn test_insufficient_volume_replaced() {
        let p = pool(205200);
        let mut db = InMemoryStockDatabase::new();
        db.add_tube(tube("t1", &p, "R1", 8.0));
        db.add_tube(tube("t2", &p, "EXCL", 100.0));
        db.add_tube(tube("t3", &p, "R3", 50.0));
        let mut map = containers(StockTubeContainer::new(p, 12.0).scheduled("t1", "R1"));
        let warnings = TubeConfirmer::new(&db, 5.0)
            .with_excluded_racks(&["EXCL".to_string()])
            .run(&mut map)
            .unwrap();
        assert_eq!(map[&205200].tube_candidate.as_ref().unwrap().tube_barcode, "t3");
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.starts_with(
            "Some scheduled tubes had to be replaced because their volume was not sufficient"
        )));
        assert!(warnings.iter().any(|w| w.contains("t2 (rack EXCL)")));
    }

    #[test]
    fn test_requested_tubes_preferred() {
        let p = pool(205200);
        let mut db = InMemoryStockDatabase::new();
        db.add_tube(tube("t1", &p, "R1", 100.0));
        db.add_tube(tube("t9", &p, "R9", 100.0));
        db.add_tube(tube("x1", &pool(1), "R9", 100.0));
        let mut map = containers(StockTubeContainer::new(p, 12.0).scheduled("t1", "R1"));
        let warnings = TubeConfirmer::new(&db, 5.0)
            .with_requested_tubes(&["t9".to_string(), "x1".to_string(), "nope".to_string()])
            .run(&mut map)
            .unwrap();
        assert_eq!(map[&205200].tube_candidate.as_ref().unwrap().tube_barcode, "t9");
        assert!(warnings.iter().any(|w| w.contains("could not be found: nope")));
        assert!(warnings.iter().any(|w| w.contains("not needed") && w.contains("x1 (1)")));
    }

    #[test]
    fn test_unscheduled_pool_picked_without_warning() {
        let p = pool(7);
        let mut db = InMemoryStockDatabase::new();
        db.add_unmanaged_tube(tube("u1", &p, "R1", 100.0));
        db.add_tube(tube("m1", &p, "R2", 100.0));
        let mut map = containers(StockTubeContainer::new(p, 10.0));
        let warnings = TubeConfirmer::new(&db, 5.0).run(&mut map).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(map[&7].tube_candidate.as_ref().unwrap().tube_barcode, "m1");
    }

    #[test]
    fn test_missing_stock_reported() {
        let p = pool(7);
        let db = InMemoryStockDatabase::new();
        let mut map = containers(StockTubeContainer::new(p, 10.0).scheduled("gone", "R1"));
        let warnings = TubeConfirmer::new(&db, 5.0).run(&mut map).unwrap();
        assert!(map[&7].tube_candidate.is_none());
        assert!(warnings.iter().any(|w| w.contains("sufficient volume for the following pools: 7")));
        assert!(warnings.iter().any(|w| w.starts_with("Some scheduled tubes could not be found")));
    }
}
