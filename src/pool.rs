use crate::rack::RackPosition;
use crate::units::molar_to_nanomolar;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

pub const FLOATING_PREFIX: &str = "md_";
pub const MOCK_VALUE: &str = "mock";
pub const UNTREATED_VALUES: [&str; 2] = ["untreated", "untransfected"];
pub const LIBRARY_VALUE: &str = "library";
pub const NONE_VALUE: &str = "None";

/// A set of molecule designs co-present in one stock tube.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MoleculeDesignPool {
    pub id: u64,
    #[serde(default)]
    pub molecule_designs: BTreeSet<u64>,
    pub molecule_type: String,
    /// Molar, as stored.
    pub default_stock_concentration: f64,
}

impl MoleculeDesignPool {
    pub fn new(id: u64, molecule_type: &str, default_stock_concentration: f64) -> Self {
        Self {
            id,
            molecule_designs: BTreeSet::new(),
            molecule_type: molecule_type.to_string(),
            default_stock_concentration,
        }
    }

    pub fn stock_concentration_nm(&self) -> f64 {
        molar_to_nanomolar(self.default_stock_concentration)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionType {
    Fixed,
    Floating,
    Library,
    Mock,
    Empty,
    Untreated,
}

impl PositionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Floating => "floating",
            Self::Library => "library",
            Self::Mock => "mock",
            Self::Empty => "empty",
            Self::Untreated => "untreated",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "fixed" => Some(Self::Fixed),
            "floating" => Some(Self::Floating),
            "library" => Some(Self::Library),
            "mock" => Some(Self::Mock),
            "empty" => Some(Self::Empty),
            "untreated" | "untransfected" => Some(Self::Untreated),
            _ => None,
        }
    }

    /// Positions that will receive sample from a stock tube.
    pub fn is_sample(self) -> bool {
        matches!(self, Self::Fixed | Self::Floating)
    }
}

impl fmt::Display for PositionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a well holds. The raw "many shapes in one field" form only exists at
/// the parse boundary; everything past it works with this variant.
#[derive(Clone, Debug, PartialEq)]
pub enum PoolReference {
    Fixed(Arc<MoleculeDesignPool>),
    Floating(String),
    Library,
    Mock,
    Untreated,
    Empty,
}

impl PoolReference {
    pub fn position_type(&self) -> PositionType {
        match self {
            Self::Fixed(_) => PositionType::Fixed,
            Self::Floating(_) => PositionType::Floating,
            Self::Library => PositionType::Library,
            Self::Mock => PositionType::Mock,
            Self::Untreated => PositionType::Untreated,
            Self::Empty => PositionType::Empty,
        }
    }

    pub fn pool(&self) -> Option<&Arc<MoleculeDesignPool>> {
        match self {
            Self::Fixed(pool) => Some(pool),
            _ => None,
        }
    }

    pub fn placeholder(&self) -> Option<&str> {
        match self {
            Self::Floating(placeholder) => Some(placeholder),
            _ => None,
        }
    }

    /// Value of the pool tag; `None` for empty wells.
    pub fn tag_value(&self) -> Option<String> {
        match self {
            Self::Fixed(pool) => Some(pool.id.to_string()),
            Self::Floating(placeholder) => Some(placeholder.clone()),
            Self::Library => Some(LIBRARY_VALUE.to_string()),
            Self::Mock => Some(MOCK_VALUE.to_string()),
            Self::Untreated => Some(UNTREATED_VALUES[0].to_string()),
            Self::Empty => None,
        }
    }

    /// Key under which containers of this pool are coupled and tubes are
    /// picked: the pool id for fixed pools, the placeholder for floatings.
    pub fn pool_key(&self) -> Option<PoolKey> {
        match self {
            Self::Fixed(pool) => Some(PoolKey::Fixed(pool.id)),
            Self::Floating(placeholder) => Some(PoolKey::Floating(placeholder.clone())),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PoolKey {
    Fixed(u64),
    Floating(String),
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(id) => write!(f, "{id}"),
            Self::Floating(placeholder) => write!(f, "{placeholder}"),
        }
    }
}

/// How a raw pool cell is classified before any lookup happens.
#[derive(Clone, Debug, PartialEq)]
pub enum RawPoolValue {
    Empty,
    Floating(String),
    Mock,
    Untreated,
    Library,
    PoolId(u64),
    Invalid(String),
}

impl RawPoolValue {
    pub fn classify(value: Option<&str>) -> Self {
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return Self::Empty;
        };
        let lower = value.to_ascii_lowercase();
        if lower == NONE_VALUE.to_ascii_lowercase() {
            return Self::Empty;
        }
        if lower.starts_with(FLOATING_PREFIX) {
            return Self::Floating(lower);
        }
        if lower == MOCK_VALUE {
            return Self::Mock;
        }
        if UNTREATED_VALUES.contains(&lower.as_str()) {
            return Self::Untreated;
        }
        if lower == LIBRARY_VALUE {
            return Self::Library;
        }
        // spreadsheet exports render integer ids as "205200.0"
        let numeric = lower.strip_suffix(".0").unwrap_or(&lower);
        match numeric.parse::<u64>() {
            Ok(id) if id > 0 => Self::PoolId(id),
            _ => Self::Invalid(value.to_string()),
        }
    }
}

/// Resolves pools by id. Lookups that fail are the caller's to collect.
pub trait PoolAggregate {
    fn get_by_id(&self, id: u64) -> Option<Arc<MoleculeDesignPool>>;
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryPoolAggregate {
    pools: HashMap<u64, Arc<MoleculeDesignPool>>,
}

impl InMemoryPoolAggregate {
    pub fn new(pools: impl IntoIterator<Item = MoleculeDesignPool>) -> Self {
        Self {
            pools: pools.into_iter().map(|p| (p.id, Arc::new(p))).collect(),
        }
    }

    pub fn add(&mut self, pool: MoleculeDesignPool) -> Arc<MoleculeDesignPool> {
        let pool = Arc::new(pool);
        self.pools.insert(pool.id, pool.clone());
        pool
    }

    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        let pools: Vec<MoleculeDesignPool> = serde_json::from_str(text)?;
        Ok(Self::new(pools))
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

impl PoolAggregate for InMemoryPoolAggregate {
    fn get_by_id(&self, id: u64) -> Option<Arc<MoleculeDesignPool>> {
        self.pools.get(&id).cloned()
    }
}

/// Planning-time bundle of one pool and the layout positions using it.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolContainer {
    pub key: PoolKey,
    pub pool: PoolReference,
    pub position_type: PositionType,
    pub stock_concentration_nm: f64,
    pub positions: Vec<RackPosition>,
}

impl PoolContainer {
    /// Groups the sample positions of a layout by pool. Floating pools get
    /// the floating stock concentration.
    pub fn collect<'a, I>(positions: I, floating_stock_concentration_nm: f64) -> Vec<PoolContainer>
    where
        I: IntoIterator<Item = (&'a RackPosition, &'a PoolReference)>,
    {
        let mut by_key: BTreeMap<PoolKey, PoolContainer> = BTreeMap::new();
        for (position, pool) in positions {
            let Some(key) = pool.pool_key() else {
                continue;
            };
            let stock = match pool {
                PoolReference::Fixed(p) => p.stock_concentration_nm(),
                _ => floating_stock_concentration_nm,
            };
            by_key
                .entry(key.clone())
                .or_insert_with(|| PoolContainer {
                    key,
                    pool: pool.clone(),
                    position_type: pool.position_type(),
                    stock_concentration_nm: stock,
                    positions: vec![],
                })
                .positions
                .push(*position);
        }
        let mut ret: Vec<PoolContainer> = by_key.into_values().collect();
        for container in ret.iter_mut() {
            container.positions.sort();
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(id: u64) -> Arc<MoleculeDesignPool> {
        Arc::new(MoleculeDesignPool::new(id, "SIRNA", 5e-5))
    }

    #[test]
    fn test_stock_concentration_in_nanomolar() {
        assert!((pool(1).stock_concentration_nm() - 50_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_classify_raw_values() {
        assert_eq!(RawPoolValue::classify(None), RawPoolValue::Empty);
        assert_eq!(RawPoolValue::classify(Some("  ")), RawPoolValue::Empty);
        assert_eq!(RawPoolValue::classify(Some("None")), RawPoolValue::Empty);
        assert_eq!(
            RawPoolValue::classify(Some("MD_007")),
            RawPoolValue::Floating("md_007".to_string())
        );
        assert_eq!(RawPoolValue::classify(Some("Mock")), RawPoolValue::Mock);
        assert_eq!(
            RawPoolValue::classify(Some("untransfected")),
            RawPoolValue::Untreated
        );
        assert_eq!(
            RawPoolValue::classify(Some("205200.0")),
            RawPoolValue::PoolId(205200)
        );
        assert_eq!(
            RawPoolValue::classify(Some("abc")),
            RawPoolValue::Invalid("abc".to_string())
        );
    }

    #[test]
    fn test_position_types() {
        assert_eq!(PoolReference::Fixed(pool(3)).position_type(), PositionType::Fixed);
        assert_eq!(PoolReference::Mock.tag_value().as_deref(), Some("mock"));
        assert_eq!(PoolReference::Empty.tag_value(), None);
        assert_eq!(PositionType::parse("untransfected"), Some(PositionType::Untreated));
        assert!(PositionType::Floating.is_sample());
        assert!(!PositionType::Mock.is_sample());
    }

    #[test]
    fn test_aggregate_lookup() {
        let aggregate = InMemoryPoolAggregate::from_json_str(
            r#"[{"id": 205200, "molecule_type": "SIRNA", "default_stock_concentration": 5e-5}]"#,
        )
        .unwrap();
        assert!(aggregate.get_by_id(205200).is_some());
        assert!(aggregate.get_by_id(1).is_none());
    }

    #[test]
    fn test_collect_pool_containers() {
        let a1 = RackPosition::new(0, 0);
        let b1 = RackPosition::new(1, 0);
        let c1 = RackPosition::new(2, 0);
        let fixed = PoolReference::Fixed(pool(7));
        let floating = PoolReference::Floating("md_001".to_string());
        let items = vec![(b1, fixed.clone()), (a1, fixed), (c1, floating), (RackPosition::new(3, 0), PoolReference::Mock)];
        let containers = PoolContainer::collect(items.iter().map(|(p, r)| (p, r)), 1000.0);
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].key, PoolKey::Fixed(7));
        assert_eq!(containers[0].positions, vec![a1, b1]);
        assert_eq!(containers[1].stock_concentration_nm, 1000.0);
    }
}
