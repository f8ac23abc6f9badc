//! Physical placement of preparation containers.

use crate::error::{IsoError, IsoResult};
use crate::location::{ContainerGraph, ContainerId, ContainerLocation, CouplingKey};
use crate::rack::RackShape;
use crate::specs::ReservoirSpecs;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Free locations plus the location -> container map of one plate.
#[derive(Clone, Debug)]
pub struct PlateState {
    pub marker: String,
    pub reservoir: ReservoirSpecs,
    available: BTreeSet<ContainerLocation>,
    occupied: BTreeMap<ContainerLocation, ContainerId>,
}

impl PlateState {
    fn new(marker: &str, reservoir: &ReservoirSpecs, locations: BTreeSet<ContainerLocation>) -> Self {
        Self {
            marker: marker.to_string(),
            reservoir: reservoir.clone(),
            available: locations,
            occupied: BTreeMap::new(),
        }
    }

    pub fn occupied(&self) -> &BTreeMap<ContainerLocation, ContainerId> {
        &self.occupied
    }
}

pub trait PlateContainer {
    fn state(&self) -> &PlateState;
    fn state_mut(&mut self) -> &mut PlateState;

    /// Picks a location for a container that has no preferred one.
    fn find_location(&self, graph: &ContainerGraph, id: ContainerId) -> IsoResult<Option<ContainerLocation>>;

    fn marker(&self) -> &str {
        &self.state().marker
    }

    fn is_empty_location(&self, location: &ContainerLocation) -> bool {
        self.state().available.contains(location)
    }

    fn has_capacity(&self) -> bool {
        !self.state().available.is_empty()
    }

    fn on_placed(&mut self, _graph: &ContainerGraph, _id: ContainerId, _location: ContainerLocation) -> IsoResult<()> {
        Ok(())
    }

    /// Places `id` at `location`, or at `find_location` when none is given.
    fn set_container(
        &mut self,
        graph: &mut ContainerGraph,
        id: ContainerId,
        location: Option<ContainerLocation>,
    ) -> IsoResult<ContainerLocation> {
        let location = match location {
            Some(location) => location,
            None => self.find_location(graph, id)?.ok_or_else(|| {
                IsoError::programmer(format!("Plate {} has no free location left", self.marker()))
            })?,
        };
        if !self.is_empty_location(&location) {
            return Err(IsoError::programmer(format!(
                "Location {location} of plate {} is already occupied",
                self.marker()
            )));
        }
        {
            let state = self.state_mut();
            state.available.remove(&location);
            state.occupied.insert(location, id);
        }
        let marker = self.marker().to_string();
        let container = graph.get_mut(id)?;
        container.location = Some(location);
        container.plate_marker = Some(marker);
        self.on_placed(graph, id, location)?;
        Ok(location)
    }
}

/// A plate addressed in 96-well sectors (quadrant pipetting).
#[derive(Clone, Debug)]
pub struct SectorPlate {
    state: PlateState,
}

impl SectorPlate {
    pub fn new(marker: &str, reservoir: &ReservoirSpecs) -> Self {
        let count = if reservoir.shape.is_384() { 4 } else { 1 };
        let locations = (0..count).map(ContainerLocation::Sector).collect();
        Self {
            state: PlateState::new(marker, reservoir, locations),
        }
    }

    pub fn number_locations(shape: &RackShape) -> usize {
        if shape.is_384() { 4 } else { 1 }
    }
}

impl PlateContainer for SectorPlate {
    fn state(&self) -> &PlateState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PlateState {
        &mut self.state
    }

    fn find_location(&self, _graph: &ContainerGraph, _id: ContainerId) -> IsoResult<Option<ContainerLocation>> {
        Ok(self.state.available.iter().next().copied())
    }
}

/// A plate addressed by individual positions. Containers of one pool are
/// kept together in rows.
#[derive(Clone, Debug)]
pub struct RackPositionPlate {
    state: PlateState,
    shape: RackShape,
    rows_by_coupling: BTreeMap<CouplingKey, BTreeSet<u16>>,
}

impl RackPositionPlate {
    pub fn new(marker: &str, reservoir: &ReservoirSpecs) -> Self {
        let locations = reservoir.shape.positions().map(ContainerLocation::Position).collect();
        Self {
            state: PlateState::new(marker, reservoir, locations),
            shape: reservoir.shape,
            rows_by_coupling: BTreeMap::new(),
        }
    }

    fn first_free_in_row(&self, row: u16) -> Option<ContainerLocation> {
        self.shape
            .row_positions(row)
            .map(ContainerLocation::Position)
            .find(|l| self.state.available.contains(l))
    }

    fn row_is_empty(&self, row: u16) -> bool {
        self.shape
            .row_positions(row)
            .all(|p| self.state.available.contains(&ContainerLocation::Position(p)))
    }
}

impl PlateContainer for RackPositionPlate {
    fn state(&self) -> &PlateState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PlateState {
        &mut self.state
    }

    fn find_location(&self, graph: &ContainerGraph, id: ContainerId) -> IsoResult<Option<ContainerLocation>> {
        let coupling = &graph.get(id)?.coupling;
        if let Some(rows) = self.rows_by_coupling.get(coupling) {
            for row in rows {
                if let Some(location) = self.first_free_in_row(*row) {
                    return Ok(Some(location));
                }
            }
        }
        for row in 0..self.shape.rows {
            if self.row_is_empty(row) {
                return Ok(self.first_free_in_row(row));
            }
        }
        Ok(self.state.available.iter().next().copied())
    }

    fn on_placed(&mut self, graph: &ContainerGraph, id: ContainerId, location: ContainerLocation) -> IsoResult<()> {
        if let ContainerLocation::Position(p) = location {
            let coupling = graph.get(id)?.coupling.clone();
            self.rows_by_coupling.entry(coupling).or_default().insert(p.row_index);
        }
        Ok(())
    }
}

/// Distributes containers over `plates`: containers with a usable preferred
/// location first (first plate where it is free), the rest round-robin.
pub fn assign_locations<P: PlateContainer>(
    plates: &mut [P],
    graph: &mut ContainerGraph,
    ids: &[ContainerId],
) -> IsoResult<()> {
    if plates.is_empty() {
        if ids.is_empty() {
            return Ok(());
        }
        return Err(IsoError::programmer("No plates to assign containers to"));
    }
    let mut remaining = vec![];
    for id in ids {
        let preferred = graph.get(*id)?.preferred_location;
        let target = preferred.and_then(|loc| {
            plates
                .iter()
                .position(|plate| plate.is_empty_location(&loc))
                .map(|idx| (idx, loc))
        });
        match target {
            Some((idx, loc)) => {
                plates[idx].set_container(graph, *id, Some(loc))?;
            }
            None => remaining.push(*id),
        }
    }
    let mut cursor = 0usize;
    for id in remaining {
        let mut tried = 0;
        while !plates[cursor % plates.len()].has_capacity() {
            cursor += 1;
            tried += 1;
            if tried > plates.len() {
                return Err(IsoError::programmer(format!(
                    "No capacity left for container {id}"
                )));
            }
        }
        let idx = cursor % plates.len();
        let location = plates[idx].set_container(graph, id, None)?;
        debug!(container = %id, plate = plates[idx].marker(), %location, "placed preparation container");
        cursor += 1;
    }
    Ok(())
}
