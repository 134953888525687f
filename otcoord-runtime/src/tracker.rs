use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};
use petgraph::algo::dijkstra;
use petgraph::graphmap::DiGraphMap;

use otcoord_common::{Network, RouteId, StationId, TrainId};

use crate::area::{Area, AreaSet};
use crate::channel::{Command, PositionReport, SimChannel, SimEvent};
use crate::error::RuntimeError;

/// Dynamic state of one train. Created on `trainCreated`, discarded fully on
/// `trainDeleted`; nothing here outlives the train's lifetime in the
/// simulator.
#[derive(Default)]
pub struct TrainState {
    pub last_report: Option<PositionReport>,
    pub last_route: Option<RouteId>,
    pub occupied: HashSet<RouteId>,
    pub reserved: HashSet<RouteId>,
    pub last_station: Option<StationId>,
    /// Areas currently containing the train, with the entry route used.
    pub areas: HashMap<String, RouteId>,
    /// Simulated time of the first report with zero speed and acceleration,
    /// cleared by any movement. Measures how long the train has stood still.
    pub first_stop: Option<f64>,
}

/// Topological events derived from the raw telemetry stream. Returned to the
/// caller instead of dispatched through listener tables; the coordinator is
/// the single listener.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackEvent {
    EnteredArea { area: String, train: TrainId, route: RouteId, time: f64 },
    LeftArea { area: String, train: TrainId, route: RouteId, time: f64 },
    ReservedRoute { train: TrainId, route: RouteId, time: f64 },
    ReleasedRoute { train: TrainId, route: RouteId, time: f64 },
}

struct AreaIndex {
    area: Arc<Area>,
    /// Shortest remaining distance from each route (its full length
    /// included) to past the nearest exit route. Computed once; the network
    /// is immutable for the run.
    dist_to_exit: HashMap<RouteId, f64>,
}

/// Converts the raw event stream into queryable per-train state and area
/// entry/exit events.
pub struct TrainTracker {
    areas: BTreeMap<String, AreaIndex>,
    /// route -> areas for which it is an entry route
    entry_index: HashMap<RouteId, Vec<String>>,
    /// route -> areas containing it
    member_index: HashMap<RouteId, Vec<String>>,
    trains: HashMap<TrainId, TrainState>,
    report_interval_secs: u32,
}

impl TrainTracker {
    pub fn new(
        areas: &AreaSet,
        network: &Network,
        report_interval_secs: u32,
    ) -> Result<Self, RuntimeError> {
        let mut indexed = BTreeMap::new();
        let mut entry_index: HashMap<RouteId, Vec<String>> = HashMap::new();
        let mut member_index: HashMap<RouteId, Vec<String>> = HashMap::new();

        for area in areas.areas() {
            for route in &area.routes {
                member_index
                    .entry(route.clone())
                    .or_default()
                    .push(area.name.clone());
            }
            for route in &area.entry_routes {
                entry_index
                    .entry(route.clone())
                    .or_default()
                    .push(area.name.clone());
            }
            indexed.insert(
                area.name.clone(),
                AreaIndex {
                    dist_to_exit: distance_to_exit(area, network)?,
                    area: area.clone(),
                },
            );
        }

        Ok(TrainTracker {
            areas: indexed,
            entry_index,
            member_index,
            trains: HashMap::new(),
            report_interval_secs,
        })
    }

    /// Apply one telemetry event and return the derived area events, in the
    /// causal order of the underlying route events. Outbound side effects
    /// are best-effort; their failures are logged, never propagated.
    pub async fn handle_event<C: SimChannel + ?Sized>(
        &mut self,
        event: &SimEvent,
        channel: &C,
    ) -> Vec<TrackEvent> {
        let mut derived = Vec::new();
        match event {
            SimEvent::TrainCreated { train, .. } => {
                self.trains.entry(train.clone()).or_default();
                let cmd = Command::SetPositionReports {
                    train: train.clone(),
                    interval_secs: self.report_interval_secs,
                };
                if let Err(e) = channel.send(&cmd).await {
                    warn!("cannot enable position reports for {}: {}", train, e);
                }
            }
            SimEvent::TrainDeleted { train, .. } => {
                self.trains.remove(train);
            }
            SimEvent::TrainPositionReport { train, report } => {
                if let Some(state) = self.trains.get_mut(train) {
                    if report.is_standstill() {
                        state.first_stop.get_or_insert(report.time);
                    } else {
                        state.first_stop = None;
                    }
                    state.last_report = Some(report.clone());
                } else {
                    debug!("position report for untracked train {}", train);
                }
            }
            SimEvent::TrainArrival { train, station, .. }
            | SimEvent::TrainDeparture { train, station, .. }
            | SimEvent::TrainPass { train, station, .. } => {
                if let Some(state) = self.trains.get_mut(train) {
                    state.last_station = Some(station.clone());
                }
            }
            SimEvent::RouteEntry { train, route, time } => {
                if let Some(state) = self.trains.get_mut(train) {
                    state.last_route = Some(route.clone());
                    state.occupied.insert(route.clone());
                    if let Some(names) = self.entry_index.get(route) {
                        for name in names {
                            if !state.areas.contains_key(name) {
                                state.areas.insert(name.clone(), route.clone());
                                derived.push(TrackEvent::EnteredArea {
                                    area: name.clone(),
                                    train: train.clone(),
                                    route: route.clone(),
                                    time: *time,
                                });
                            }
                        }
                    }
                } else {
                    debug!("route entry for untracked train {}", train);
                }
            }
            SimEvent::RouteExit { train, route, time } => {
                if let Some(state) = self.trains.get_mut(train) {
                    state.occupied.remove(route);
                    if let Some(names) = self.member_index.get(route) {
                        for name in names {
                            let area = &self.areas[name].area;
                            let still_inside =
                                state.occupied.iter().any(|r| area.contains(r));
                            if !still_inside && state.areas.remove(name).is_some() {
                                derived.push(TrackEvent::LeftArea {
                                    area: name.clone(),
                                    train: train.clone(),
                                    route: route.clone(),
                                    time: *time,
                                });
                            }
                        }
                    }
                }
            }
            SimEvent::RouteReserved { train, route, time } => {
                if let Some(state) = self.trains.get_mut(train) {
                    state.reserved.insert(route.clone());
                    derived.push(TrackEvent::ReservedRoute {
                        train: train.clone(),
                        route: route.clone(),
                        time: *time,
                    });
                } else {
                    debug!("route reservation for untracked train {}", train);
                }
            }
            SimEvent::RouteReleased { train, route, time } => {
                if let Some(state) = self.trains.get_mut(train) {
                    state.reserved.remove(route);
                    derived.push(TrackEvent::ReleasedRoute {
                        train: train.clone(),
                        route: route.clone(),
                        time: *time,
                    });
                } else {
                    debug!("route release for untracked train {}", train);
                }
            }
            SimEvent::SimStarted { time }
            | SimEvent::SimStopped { time }
            | SimEvent::SimPaused { time }
            | SimEvent::SimContinued { time } => {
                debug!("{} at t={}", event.kind(), time);
            }
        }
        derived
    }

    pub fn train(&self, id: &str) -> Option<&TrainState> {
        self.trains.get(id)
    }

    pub fn has_reserved(&self, train: &str, route: &str) -> bool {
        self.trains
            .get(train)
            .map_or(false, |s| s.reserved.contains(route))
    }

    /// Entry route the train used to enter `area`, while it is still inside.
    pub fn entry_route_of(&self, train: &str, area: &str) -> Option<&RouteId> {
        self.trains.get(train).and_then(|s| s.areas.get(area))
    }

    /// Seconds the train has been standing still, per its position reports.
    pub fn stop_duration(&self, train: &str, now: f64) -> Option<f64> {
        self.trains
            .get(train)
            .and_then(|s| s.first_stop)
            .map(|since| now - since)
    }

    /// Occupants of an area sorted by ascending remaining distance to its
    /// exit, i.e. the train closest to leaving first. Re-derived on every
    /// call from the latest reports.
    pub fn trains_in_area_in_order(&self, area: &str) -> Vec<TrainId> {
        let index = match self.areas.get(area) {
            Some(index) => index,
            None => return Vec::new(),
        };
        let mut occupants: Vec<(f64, &TrainId)> = self
            .trains
            .iter()
            .filter(|(_, state)| state.areas.contains_key(area))
            .map(|(id, state)| (remaining_distance(index, state), id))
            .collect();
        occupants.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.cmp(b.1))
        });
        occupants.into_iter().map(|(_, id)| id.clone()).collect()
    }
}

/// Distance still to travel before the train has cleared the area: the
/// precomputed route distance minus the offset already covered on the
/// current route. Missing data defaults conservatively (offset 0: just
/// entered; unknown distance 0: about to leave).
fn remaining_distance(index: &AreaIndex, state: &TrainState) -> f64 {
    let route = match &state.last_route {
        Some(route) => route,
        None => return 0.0,
    };
    let dist = index.dist_to_exit.get(route).copied().unwrap_or(0.0);
    let offset = match &state.last_report {
        Some(report) if &report.route == route => report.offset,
        _ => 0.0,
    };
    dist - offset
}

/// Dijkstra over the area's route-adjacency graph (edges reversed, weighted
/// by route length) from a virtual node behind all exit routes. The distance
/// of a route is the length sum of the shortest chain from it through an
/// exit, its own length included.
fn distance_to_exit(area: &Area, network: &Network) -> Result<HashMap<RouteId, f64>, RuntimeError> {
    let ids: Vec<&RouteId> = area.routes.iter().collect();
    let index_of: HashMap<&str, usize> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let mut graph: DiGraphMap<usize, f64> = DiGraphMap::new();
    for i in 0..ids.len() {
        graph.add_node(i);
    }
    for a in &ids {
        let ra = network.route(a)?;
        for b in &ids {
            if a == b {
                continue;
            }
            let rb = network.route(b)?;
            if ra.leads_to(rb) {
                graph.add_edge(index_of[b.as_str()], index_of[a.as_str()], ra.length);
            }
        }
    }
    let source = ids.len();
    graph.add_node(source);
    for exit in &area.exit_routes {
        let route = network.route(exit)?;
        graph.add_edge(source, index_of[exit.as_str()], route.length);
    }

    let dist = dijkstra(&graph, source, None, |e| *e.2);
    Ok(ids
        .iter()
        .enumerate()
        .filter_map(|(i, id)| dist.get(&i).map(|d| ((*id).clone(), *d)))
        .collect())
}
