use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use log::debug;

use otcoord_common::{Network, RouteId, StationId};

use crate::error::RuntimeError;

/// A named, connected subset of the route graph with designated entry and
/// exit routes. Computed once from the network model at startup, immutable
/// afterwards.
#[derive(Debug)]
pub struct Area {
    pub name: String,
    /// Outflow station: where overtaken trains are held.
    pub station: StationId,
    pub routes: BTreeSet<RouteId>,
    pub entry_routes: BTreeSet<RouteId>,
    pub exit_routes: BTreeSet<RouteId>,
    /// Routes a held train may wait on; bounded by the train's length.
    pub waiting_routes: BTreeSet<RouteId>,
    /// Routes leaving the outflow station.
    pub outflow_routes: BTreeSet<RouteId>,
    pub inflow_stations: BTreeSet<StationId>,
    pub max_waiting: u32,
}

impl Area {
    pub fn is_entry(&self, route: &str) -> bool {
        self.entry_routes.contains(route)
    }

    pub fn contains(&self, route: &str) -> bool {
        self.routes.contains(route)
    }
}

/// All overtaking areas of a network, keyed by name. Iteration order is
/// deterministic.
pub struct AreaSet {
    areas: BTreeMap<String, Arc<Area>>,
    by_station: HashMap<StationId, Vec<String>>,
}

impl AreaSet {
    /// One area per itinerary flagged `overtaking`. The itinerary's routes
    /// form the interior; graph sources and sinks of the interior adjacency
    /// are the entry and exit routes (a single-route area is its own entry
    /// and exit); routes ending at the outflow station are waiting routes.
    pub fn build(network: &Network) -> Result<AreaSet, RuntimeError> {
        let mut areas = BTreeMap::new();
        let mut by_station: HashMap<StationId, Vec<String>> = HashMap::new();

        for itinerary in network.itineraries() {
            if !itinerary.overtaking {
                continue;
            }
            let station = itinerary.station.clone().ok_or_else(|| {
                RuntimeError::Config(format!(
                    "overtaking itinerary {} has no outflow station",
                    itinerary.id
                ))
            })?;

            let interior: Vec<_> = itinerary
                .routes
                .iter()
                .map(|id| network.route(id))
                .collect::<Result<_, _>>()?;

            let mut entry_routes = BTreeSet::new();
            let mut exit_routes = BTreeSet::new();
            for route in &interior {
                let has_pred = interior
                    .iter()
                    .any(|p| p.id != route.id && p.leads_to(route));
                let has_succ = interior
                    .iter()
                    .any(|s| s.id != route.id && route.leads_to(s));
                if !has_pred {
                    entry_routes.insert(route.id.clone());
                }
                if !has_succ {
                    exit_routes.insert(route.id.clone());
                }
            }

            let waiting_routes: BTreeSet<RouteId> = interior
                .iter()
                .filter(|r| r.to_station.as_deref() == Some(station.as_str()))
                .map(|r| r.id.clone())
                .collect();

            let inflow_stations: BTreeSet<StationId> = interior
                .iter()
                .filter(|r| entry_routes.contains(&r.id))
                .filter_map(|r| r.from_station.clone())
                .collect();

            let area = Area {
                name: itinerary.id.clone(),
                station: station.clone(),
                routes: interior.iter().map(|r| r.id.clone()).collect(),
                entry_routes,
                exit_routes,
                waiting_routes,
                outflow_routes: network
                    .outflow_routes(&station)
                    .into_iter()
                    .map(|r| r.id.clone())
                    .collect(),
                inflow_stations,
                max_waiting: itinerary.max_waiting.unwrap_or(1),
            };
            debug!(
                "area {}: {} routes, entries {:?}, exits {:?}, maxWaiting {}",
                area.name,
                area.routes.len(),
                area.entry_routes,
                area.exit_routes,
                area.max_waiting
            );
            by_station
                .entry(station)
                .or_default()
                .push(area.name.clone());
            areas.insert(area.name.clone(), Arc::new(area));
        }

        Ok(AreaSet { areas, by_station })
    }

    pub fn get(&self, name: &str) -> Result<&Arc<Area>, RuntimeError> {
        self.areas
            .get(name)
            .ok_or_else(|| RuntimeError::Bug(format!("unknown area: {}", name)))
    }

    pub fn areas(&self) -> impl Iterator<Item = &Arc<Area>> {
        self.areas.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.areas.keys().cloned().collect()
    }

    /// Areas whose outflow station is `station`.
    pub fn from_station(&self, station: &str) -> Vec<Arc<Area>> {
        self.by_station
            .get(station)
            .map(|names| names.iter().map(|n| self.areas[n].clone()).collect())
            .unwrap_or_default()
    }
}
