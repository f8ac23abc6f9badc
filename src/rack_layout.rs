use crate::parameters::Tag;
use crate::rack::{RackPosition, RackPositionSet, RackShape};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One persisted (tags, positions) record. The position set is referenced by
/// its hash so equal sets are stored once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaggedRackPositionSet {
    pub tags: BTreeSet<Tag>,
    pub position_set_hash: String,
}

/// The persistence form of any layout: tag sets attached to position sets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RackLayout {
    pub shape: RackShape,
    position_sets: BTreeMap<String, RackPositionSet>,
    tagged_sets: Vec<TaggedRackPositionSet>,
}

impl RackLayout {
    pub fn new(shape: RackShape) -> Self {
        Self {
            shape,
            position_sets: BTreeMap::new(),
            tagged_sets: vec![],
        }
    }

    /// Groups positions with identical tag sets into one record each.
    pub fn from_tag_sets<I>(shape: RackShape, tag_sets: I) -> Self
    where
        I: IntoIterator<Item = (RackPosition, BTreeSet<Tag>)>,
    {
        let mut groups: BTreeMap<BTreeSet<Tag>, Vec<RackPosition>> = BTreeMap::new();
        for (position, tags) in tag_sets {
            if tags.is_empty() {
                continue;
            }
            groups.entry(tags).or_default().push(position);
        }
        let mut ret = Self::new(shape);
        for (tags, positions) in groups {
            ret.add_tagged(tags, RackPositionSet::new(positions));
        }
        ret
    }

    /// Adds tags for a position set. If a record with exactly this position
    /// set exists, the tags are merged into it.
    pub fn add_tagged(&mut self, tags: BTreeSet<Tag>, positions: RackPositionSet) {
        let hash = positions.hash_value();
        self.position_sets.entry(hash.clone()).or_insert(positions);
        if let Some(existing) = self
            .tagged_sets
            .iter_mut()
            .find(|t| t.position_set_hash == hash)
        {
            existing.tags.extend(tags);
            return;
        }
        self.tagged_sets.push(TaggedRackPositionSet {
            tags,
            position_set_hash: hash,
        });
    }

    pub fn tagged_sets(&self) -> &[TaggedRackPositionSet] {
        &self.tagged_sets
    }

    pub fn position_set(&self, hash: &str) -> Option<&RackPositionSet> {
        self.position_sets.get(hash)
    }

    pub fn tagged_position_sets(&self) -> impl Iterator<Item = (&BTreeSet<Tag>, &RackPositionSet)> {
        self.tagged_sets.iter().filter_map(|t| {
            self.position_sets
                .get(&t.position_set_hash)
                .map(|set| (&t.tags, set))
        })
    }

    /// All tags attached to one position, across records.
    pub fn tags_for_position(&self, position: &RackPosition) -> BTreeSet<Tag> {
        self.tagged_position_sets()
            .filter(|(_, set)| set.contains(position))
            .flat_map(|(tags, _)| tags.iter().cloned())
            .collect()
    }

    pub fn positions(&self) -> BTreeSet<RackPosition> {
        self.position_sets
            .values()
            .flat_map(|set| set.positions().iter().copied())
            .collect()
    }

    /// Positions carrying a tag with the given domain and predicate.
    pub fn positions_for_predicate(&self, domain: &str, predicate: &str) -> BTreeSet<RackPosition> {
        self.tagged_position_sets()
            .filter(|(tags, _)| {
                tags.iter()
                    .any(|t| t.domain == domain && t.predicate == predicate)
            })
            .flat_map(|(_, set)| set.positions().iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rack::SHAPE_96;

    fn tags(values: &[(&str, &str)]) -> BTreeSet<Tag> {
        values.iter().map(|(p, v)| Tag::new("iso", p, *v)).collect()
    }

    #[test]
    fn test_grouping_by_identical_tag_sets() {
        let a1 = RackPosition::new(0, 0);
        let a2 = RackPosition::new(0, 1);
        let b1 = RackPosition::new(1, 0);
        let layout = RackLayout::from_tag_sets(
            SHAPE_96,
            vec![
                (a1, tags(&[("iso_volume", "10")])),
                (a2, tags(&[("iso_volume", "10")])),
                (b1, tags(&[("iso_volume", "5")])),
            ],
        );
        assert_eq!(layout.tagged_sets().len(), 2);
        assert_eq!(layout.positions().len(), 3);
        assert_eq!(layout.tags_for_position(&a2), tags(&[("iso_volume", "10")]));
    }

    #[test]
    fn test_additional_tags_share_position_sets() {
        let a1 = RackPosition::new(0, 0);
        let mut layout = RackLayout::from_tag_sets(SHAPE_96, vec![(a1, tags(&[("iso_volume", "10")]))]);
        layout.add_tagged(
            [Tag::new("cell_line", "name", "HeLa")].into_iter().collect(),
            RackPositionSet::new([a1]),
        );
        assert_eq!(layout.tagged_sets().len(), 1);
        assert_eq!(layout.tags_for_position(&a1).len(), 2);
        assert_eq!(
            layout.positions_for_predicate("cell_line", "name"),
            [a1].into_iter().collect()
        );
    }
}
