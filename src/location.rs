//! Preparation graph nodes. Every physical well (or 96-well sector) that
//! holds sample during preparation is a [`LocationContainer`]; containers
//! live in a [`ContainerGraph`] arena and refer to each other by id.

use crate::error::{IsoError, IsoResult};
use crate::pool::PoolKey;
use crate::rack::RackPosition;
use crate::units::{are_equal_values, is_larger_than};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(pub u64);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Per-pass state threaded through planners and assigners. Container ids
/// are only valid within the pass that issued them.
#[derive(Debug, Default)]
pub struct PlanningContext {
    next_id: u64,
    active: bool,
    pass: u64,
}

impl PlanningContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the id counter; call at the start of every planning pass.
    pub fn begin_pass(&mut self) {
        self.next_id = 0;
        self.active = true;
        self.pass += 1;
    }

    /// Invalidates the counter at the end of a pass.
    pub fn end_pass(&mut self) {
        self.active = false;
        self.next_id = 0;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn pass_number(&self) -> u64 {
        self.pass
    }

    pub fn next_container_id(&mut self) -> IsoResult<ContainerId> {
        if !self.active {
            return Err(IsoError::programmer(
                "Container ids requested outside of a planning pass",
            ));
        }
        self.next_id += 1;
        Ok(ContainerId(self.next_id))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContainerLocation {
    Position(RackPosition),
    Sector(u8),
}

impl fmt::Display for ContainerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Position(p) => write!(f, "{p}"),
            Self::Sector(s) => write!(f, "sector {s}"),
        }
    }
}

/// Which containers may share intermediates.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CouplingKey {
    Pool(PoolKey),
    SectorSet(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerRole {
    /// Aliquot container; volume and concentration come from the request.
    Requested,
    /// Intermediate preparation container; adjusted while planning.
    Preparation,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransferEdge {
    /// Volume of one transfer in µL.
    pub volume: f64,
    /// Number of physical transfers (one per target copy).
    pub count: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LocationContainer {
    pub id: ContainerId,
    pub role: ContainerRole,
    pub coupling: CouplingKey,
    pub location: Option<ContainerLocation>,
    pub preferred_location: Option<ContainerLocation>,
    pub plate_marker: Option<String>,
    /// Volume remaining after all outgoing transfers, excluding dead volume.
    pub residual_volume: f64,
    pub target_concentration: f64,
    pub parent: Option<ContainerId>,
    /// Concentration of the source; the stock concentration for roots.
    pub parent_concentration: f64,
    pub children: BTreeMap<ContainerId, TransferEdge>,
    pub dead_volume: f64,
    /// Number of identical physical copies (aliquot plates).
    pub copies: u32,
}

impl LocationContainer {
    pub fn new_requested(
        id: ContainerId,
        coupling: CouplingKey,
        location: ContainerLocation,
        volume: f64,
        concentration: f64,
        stock_concentration: f64,
        copies: u32,
    ) -> Self {
        Self {
            id,
            role: ContainerRole::Requested,
            coupling,
            location: Some(location),
            preferred_location: Some(location),
            plate_marker: None,
            residual_volume: volume,
            target_concentration: concentration,
            parent: None,
            parent_concentration: stock_concentration,
            children: BTreeMap::new(),
            dead_volume: 0.0,
            copies: copies.max(1),
        }
    }

    pub fn new_preparation(
        id: ContainerId,
        coupling: CouplingKey,
        concentration: f64,
        stock_concentration: f64,
        preferred_location: Option<ContainerLocation>,
    ) -> Self {
        Self {
            id,
            role: ContainerRole::Preparation,
            coupling,
            location: None,
            preferred_location,
            plate_marker: None,
            residual_volume: 0.0,
            target_concentration: concentration,
            parent: None,
            parent_concentration: stock_concentration,
            children: BTreeMap::new(),
            dead_volume: 0.0,
            copies: 1,
        }
    }

    pub fn is_mutable(&self) -> bool {
        self.role == ContainerRole::Preparation
    }

    pub fn is_requested(&self) -> bool {
        self.role == ContainerRole::Requested
    }

    pub fn outgoing_transfer_count(&self) -> u32 {
        self.children.values().map(|e| e.count).sum()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ContainerGraph {
    containers: BTreeMap<ContainerId, LocationContainer>,
    min_transfer_volume: f64,
}

impl ContainerGraph {
    pub fn new(min_transfer_volume: f64) -> Self {
        Self {
            containers: BTreeMap::new(),
            min_transfer_volume,
        }
    }

    pub fn min_transfer_volume(&self) -> f64 {
        self.min_transfer_volume
    }

    pub fn insert(&mut self, container: LocationContainer) -> ContainerId {
        let id = container.id;
        self.containers.insert(id, container);
        id
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn get(&self, id: ContainerId) -> IsoResult<&LocationContainer> {
        self.containers
            .get(&id)
            .ok_or_else(|| IsoError::programmer(format!("Unknown container {id}")))
    }

    pub fn get_mut(&mut self, id: ContainerId) -> IsoResult<&mut LocationContainer> {
        self.containers
            .get_mut(&id)
            .ok_or_else(|| IsoError::programmer(format!("Unknown container {id}")))
    }

    pub fn containers(&self) -> impl Iterator<Item = &LocationContainer> {
        self.containers.values()
    }

    pub fn ids(&self) -> Vec<ContainerId> {
        self.containers.keys().copied().collect()
    }

    pub fn requested_ids(&self) -> Vec<ContainerId> {
        self.containers
            .values()
            .filter(|c| c.is_requested())
            .map(|c| c.id)
            .collect()
    }

    pub fn intermediate_ids(&self) -> Vec<ContainerId> {
        self.containers
            .values()
            .filter(|c| c.is_mutable())
            .map(|c| c.id)
            .collect()
    }

    pub fn roots(&self) -> Vec<ContainerId> {
        self.containers
            .values()
            .filter(|c| c.parent.is_none())
            .map(|c| c.id)
            .collect()
    }

    /// residual + dead volume + all outgoing transfers.
    pub fn full_volume(&self, id: ContainerId) -> IsoResult<f64> {
        let c = self.get(id)?;
        let outgoing: f64 = c
            .children
            .values()
            .map(|e| e.volume * e.count as f64)
            .sum();
        Ok(c.residual_volume + c.dead_volume + outgoing)
    }

    fn transfer_count(parent_copies: u32, child_copies: u32) -> u32 {
        (child_copies / parent_copies.max(1)).max(1)
    }

    /// Volume one transfer into `child` needs at the given source
    /// concentration, clamped below to the minimum transfer volume.
    pub fn required_transfer_volume(&self, child: ContainerId, source_concentration: f64) -> IsoResult<f64> {
        let c = self.get(child)?;
        let v = self.full_volume(child)? * c.target_concentration / source_concentration;
        Ok(v.max(self.min_transfer_volume))
    }

    /// Links `child` below `parent` and re-propagates volumes up the chain.
    pub fn set_parent_container(&mut self, child: ContainerId, parent: ContainerId) -> IsoResult<f64> {
        if child == parent || self.is_ancestor(child, parent)? {
            return Err(IsoError::programmer(format!(
                "Linking {child} below {parent} would create a cycle"
            )));
        }
        self.detach(child)?;
        let parent_concentration = self.get(parent)?.target_concentration;
        let parent_copies = self.get(parent)?.copies;
        let child_copies = self.get(child)?.copies;
        let volume = self.required_transfer_volume(child, parent_concentration)?;
        {
            let c = self.get_mut(child)?;
            c.parent = Some(parent);
            c.parent_concentration = parent_concentration;
        }
        self.get_mut(parent)?.children.insert(
            child,
            TransferEdge {
                volume,
                count: Self::transfer_count(parent_copies, child_copies),
            },
        );
        self.propagate_from(parent)?;
        Ok(volume)
    }

    /// Makes `child` a root fed directly from the stock tube.
    pub fn set_stock_parent(&mut self, child: ContainerId, stock_concentration: f64) -> IsoResult<()> {
        self.detach(child)?;
        let c = self.get_mut(child)?;
        c.parent = None;
        c.parent_concentration = stock_concentration;
        Ok(())
    }

    fn detach(&mut self, child: ContainerId) -> IsoResult<()> {
        if let Some(old_parent) = self.get(child)?.parent {
            self.get_mut(old_parent)?.children.remove(&child);
            self.get_mut(child)?.parent = None;
            self.propagate_from(old_parent)?;
        }
        Ok(())
    }

    /// Recomputes the edge weights from `id` up to its root.
    pub fn propagate_from(&mut self, id: ContainerId) -> IsoResult<()> {
        let mut current = id;
        let mut guard = 0usize;
        while let Some(parent) = self.get(current)?.parent {
            let parent_concentration = self.get(parent)?.target_concentration;
            let volume = self.required_transfer_volume(current, parent_concentration)?;
            if let Some(edge) = self.get_mut(parent)?.children.get_mut(&current) {
                edge.volume = volume;
            }
            current = parent;
            guard += 1;
            if guard > self.containers.len() {
                return Err(IsoError::programmer("Cycle in preparation graph"));
            }
        }
        Ok(())
    }

    /// Post-order recomputation of every edge weight in the graph.
    pub fn recalculate(&mut self) -> IsoResult<()> {
        for root in self.roots() {
            for id in self.post_order(root)? {
                if let Some(parent) = self.get(id)?.parent {
                    let parent_concentration = self.get(parent)?.target_concentration;
                    let volume = self.required_transfer_volume(id, parent_concentration)?;
                    if let Some(edge) = self.get_mut(parent)?.children.get_mut(&id) {
                        edge.volume = volume;
                    }
                }
            }
        }
        Ok(())
    }

    /// Children before parents, starting below `root`.
    pub fn post_order(&self, root: ContainerId) -> IsoResult<Vec<ContainerId>> {
        let mut ret = vec![];
        let mut stack = vec![(root, false)];
        let mut seen = BTreeSet::new();
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                ret.push(id);
                continue;
            }
            if !seen.insert(id) {
                return Err(IsoError::programmer(format!("Container {id} reached twice")));
            }
            stack.push((id, true));
            for child in self.get(id)?.children.keys().rev() {
                stack.push((*child, false));
            }
        }
        Ok(ret)
    }

    pub fn is_ancestor(&self, candidate: ContainerId, of: ContainerId) -> IsoResult<bool> {
        let mut current = self.get(of)?.parent;
        while let Some(id) = current {
            if id == candidate {
                return Ok(true);
            }
            current = self.get(id)?.parent;
        }
        Ok(false)
    }

    pub fn root(&self, id: ContainerId) -> IsoResult<ContainerId> {
        let mut current = id;
        while let Some(parent) = self.get(current)?.parent {
            current = parent;
        }
        Ok(current)
    }

    /// Number of ancestors above `id`.
    pub fn depth(&self, id: ContainerId) -> IsoResult<u32> {
        let mut depth = 0;
        let mut current = id;
        while let Some(parent) = self.get(current)?.parent {
            depth += 1;
            current = parent;
        }
        Ok(depth)
    }

    pub fn stock_concentration(&self, id: ContainerId) -> IsoResult<f64> {
        let root = self.root(id)?;
        Ok(self.get(root)?.parent_concentration)
    }

    pub fn starting_concentration(&self, id: ContainerId) -> IsoResult<f64> {
        let root = self.root(id)?;
        Ok(self.get(root)?.target_concentration)
    }

    /// Volume taken from the stock tube for the chain `id` belongs to.
    pub fn starting_volume(&self, id: ContainerId) -> IsoResult<f64> {
        let root = self.root(id)?;
        Ok(self.stock_transfer_volume(root)? * self.get(root)?.copies as f64)
    }

    /// Volume of one stock transfer into a root container.
    pub fn stock_transfer_volume(&self, root: ContainerId) -> IsoResult<f64> {
        let c = self.get(root)?;
        let v = self.full_volume(root)? * c.target_concentration / c.parent_concentration;
        Ok(v.max(self.min_transfer_volume))
    }

    /// Volume of one transfer into `id`, from its parent or the stock.
    pub fn incoming_transfer_volume(&self, id: ContainerId) -> IsoResult<f64> {
        match self.get(id)?.parent {
            Some(parent) => Ok(self
                .get(parent)?
                .children
                .get(&id)
                .map(|e| e.volume)
                .unwrap_or(0.0)),
            None => self.stock_transfer_volume(id),
        }
    }

    pub fn buffer_volume(&self, id: ContainerId) -> IsoResult<f64> {
        let buffer = self.full_volume(id)? - self.incoming_transfer_volume(id)?;
        Ok(if are_equal_values(buffer, 0.0) { 0.0 } else { buffer })
    }

    /// Length of the same-plate prefix of the parent chain.
    pub fn intraplate_ancestor_count(&self, id: ContainerId) -> IsoResult<u32> {
        let marker = self.get(id)?.plate_marker.clone();
        let mut count = 0;
        let mut current = id;
        while let Some(parent) = self.get(current)?.parent {
            if self.get(parent)?.plate_marker != marker {
                break;
            }
            count += 1;
            current = parent;
        }
        Ok(count)
    }

    /// Distance to the nearest requested descendant (requested = 0).
    pub fn generation(&self, id: ContainerId) -> IsoResult<u32> {
        let c = self.get(id)?;
        if c.is_requested() {
            return Ok(0);
        }
        let mut best: Option<u32> = None;
        for child in c.children.keys() {
            let g = self.generation(*child)? + 1;
            best = Some(best.map_or(g, |b| b.min(g)));
        }
        Ok(best.unwrap_or(u32::MAX))
    }

    /// Requested containers below `id` (including itself).
    pub fn requested_descendants(&self, id: ContainerId) -> IsoResult<Vec<ContainerId>> {
        let mut ret = vec![];
        for node in self.post_order(id)? {
            if self.get(node)?.is_requested() {
                ret.push(node);
            }
        }
        Ok(ret)
    }

    pub fn max_preparation_volume(&self) -> IsoResult<f64> {
        let mut max = 0.0f64;
        for id in self.intermediate_ids() {
            max = max.max(self.full_volume(id)?);
        }
        Ok(max)
    }

    /// Grows mutable containers (children first) until every incoming
    /// transfer and buffer addition reaches the minimum transfer volume.
    pub fn grow_to_transfer_minimum(&mut self) -> IsoResult<()> {
        let min = self.min_transfer_volume;
        for root in self.roots() {
            for id in self.post_order(root)? {
                if let Some(parent) = self.get(id)?.parent {
                    let parent_concentration = self.get(parent)?.target_concentration;
                    let volume = self.required_transfer_volume(id, parent_concentration)?;
                    if let Some(edge) = self.get_mut(parent)?.children.get_mut(&id) {
                        edge.volume = volume;
                    }
                }
                if !self.get(id)?.is_mutable() {
                    continue;
                }
                let c = self.get(id)?;
                let ratio = c.target_concentration / c.parent_concentration;
                let full = self.full_volume(id)?;
                let mut needed = full;
                if ratio > 0.0 {
                    needed = needed.max(min / ratio);
                }
                if is_larger_than(1.0 - ratio, 0.0) {
                    needed = needed.max(min / (1.0 - ratio));
                }
                if is_larger_than(needed, full) {
                    let extra = crate::units::round_up(needed - full, 1);
                    self.get_mut(id)?.residual_volume += extra;
                    if let Some(parent) = self.get(id)?.parent {
                        let parent_concentration = self.get(parent)?.target_concentration;
                        let volume = self.required_transfer_volume(id, parent_concentration)?;
                        if let Some(edge) = self.get_mut(parent)?.children.get_mut(&id) {
                            edge.volume = volume;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::are_equal_values;

    fn key() -> CouplingKey {
        CouplingKey::Pool(PoolKey::Fixed(1))
    }

    fn setup() -> (PlanningContext, ContainerGraph, ContainerId, ContainerId) {
        let mut ctx = PlanningContext::new();
        ctx.begin_pass();
        let mut graph = ContainerGraph::new(1.0);
        let aliquot = graph.insert(LocationContainer::new_requested(
            ctx.next_container_id().unwrap(),
            key(),
            ContainerLocation::Position(RackPosition::new(0, 0)),
            10.0,
            50.0,
            50_000.0,
            1,
        ));
        let prep = graph.insert(LocationContainer::new_preparation(
            ctx.next_container_id().unwrap(),
            key(),
            500.0,
            50_000.0,
            None,
        ));
        (ctx, graph, aliquot, prep)
    }

    #[test]
    fn test_context_ids_reset_per_pass() {
        let mut ctx = PlanningContext::new();
        assert!(ctx.next_container_id().is_err());
        ctx.begin_pass();
        assert_eq!(ctx.next_container_id().unwrap(), ContainerId(1));
        assert_eq!(ctx.next_container_id().unwrap(), ContainerId(2));
        ctx.end_pass();
        assert!(ctx.next_container_id().is_err());
        ctx.begin_pass();
        assert_eq!(ctx.next_container_id().unwrap(), ContainerId(1));
        assert_eq!(ctx.pass_number(), 2);
    }

    #[test]
    fn test_set_parent_computes_edge_volume() {
        let (_ctx, mut graph, aliquot, prep) = setup();
        let v = graph.set_parent_container(aliquot, prep).unwrap();
        assert!(are_equal_values(v, 1.0));
        assert!(are_equal_values(graph.full_volume(prep).unwrap(), 1.0));
        assert!(are_equal_values(graph.buffer_volume(aliquot).unwrap(), 9.0));
        assert_eq!(graph.depth(aliquot).unwrap(), 1);
        assert_eq!(graph.generation(prep).unwrap(), 1);
        assert!(are_equal_values(graph.stock_concentration(aliquot).unwrap(), 50_000.0));
        assert!(are_equal_values(graph.starting_concentration(aliquot).unwrap(), 500.0));
    }

    #[test]
    fn test_propagation_keeps_edge_invariant() {
        let (mut ctx, mut graph, aliquot, prep) = setup();
        graph.set_parent_container(aliquot, prep).unwrap();
        let top = graph.insert(LocationContainer::new_preparation(
            ctx.next_container_id().unwrap(),
            key(),
            5_000.0,
            50_000.0,
            None,
        ));
        graph.set_parent_container(prep, top).unwrap();
        graph.get_mut(prep).unwrap().dead_volume = 10.0;
        graph.propagate_from(prep).unwrap();
        let prep_full = graph.full_volume(prep).unwrap();
        assert!(are_equal_values(prep_full, 11.0));
        let edge = graph.get(top).unwrap().children[&prep];
        assert!(are_equal_values(edge.volume, prep_full * 500.0 / 5_000.0));
        assert!(are_equal_values(
            graph.full_volume(top).unwrap(),
            graph.get(top).unwrap().residual_volume + edge.volume
        ));
    }

    #[test]
    fn test_cycles_are_rejected() {
        let (_ctx, mut graph, aliquot, prep) = setup();
        graph.set_parent_container(aliquot, prep).unwrap();
        assert!(graph.set_parent_container(prep, aliquot).is_err());
    }

    #[test]
    fn test_grow_to_transfer_minimum() {
        let (_ctx, mut graph, aliquot, prep) = setup();
        graph.set_parent_container(aliquot, prep).unwrap();
        // stock -> prep transfers 1/100 of the prep volume
        graph.grow_to_transfer_minimum().unwrap();
        let full = graph.full_volume(prep).unwrap();
        assert!(full + 1e-9 >= 100.0);
        assert!(graph.stock_transfer_volume(prep).unwrap() + 1e-9 >= 1.0);
    }

    #[test]
    fn test_intraplate_ancestor_count() {
        let (mut ctx, mut graph, aliquot, prep) = setup();
        let top = graph.insert(LocationContainer::new_preparation(
            ctx.next_container_id().unwrap(),
            key(),
            5_000.0,
            50_000.0,
            None,
        ));
        graph.set_parent_container(aliquot, prep).unwrap();
        graph.set_parent_container(prep, top).unwrap();
        graph.get_mut(top).unwrap().plate_marker = Some("p#1".into());
        graph.get_mut(prep).unwrap().plate_marker = Some("p#1".into());
        graph.get_mut(aliquot).unwrap().plate_marker = Some("a#1".into());
        assert_eq!(graph.intraplate_ancestor_count(prep).unwrap(), 1);
        assert_eq!(graph.intraplate_ancestor_count(aliquot).unwrap(), 0);
        assert_eq!(graph.intraplate_ancestor_count(top).unwrap(), 0);
    }
}
