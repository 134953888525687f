use std::collections::HashMap;

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

pub type RouteId = String;
pub type StationId = String;
pub type TrainId = String;
pub type ItineraryId = String;

/// A piece of the static route graph. Two routes are adjacent when the last
/// vertex of one equals the first vertex of the other.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Route {
    pub id: RouteId,
    pub length: f64,
    pub vertices: Vec<String>,
    #[serde(default)]
    pub from_station: Option<StationId>,
    #[serde(default)]
    pub to_station: Option<StationId>,
    #[serde(default)]
    pub track: Option<String>,
}

impl Route {
    pub fn first_vertex(&self) -> Option<&String> {
        self.vertices.first()
    }

    pub fn last_vertex(&self) -> Option<&String> {
        self.vertices.last()
    }

    /// R relation: `self` can be followed directly by `other`.
    pub fn leads_to(&self, other: &Route) -> bool {
        match (self.last_vertex(), other.first_vertex()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Station {
    pub id: StationId,
    pub name: String,
}

/// An ordered route sequence. Itineraries flagged `overtaking` define the
/// overtaking areas of the network; `max_waiting` bounds how many trains may
/// be held at the area's outflow station at once.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Itinerary {
    pub id: ItineraryId,
    pub routes: Vec<RouteId>,
    #[serde(default)]
    pub overtaking: bool,
    #[serde(default)]
    pub max_waiting: Option<u32>,
    #[serde(default)]
    pub station: Option<StationId>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TimetableEntry {
    pub station: StationId,
    #[serde(default)]
    pub arrival: Option<NaiveTime>,
    #[serde(default)]
    pub departure: Option<NaiveTime>,
    #[serde(default)]
    pub min_dwell_secs: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Timetable {
    pub entries: Vec<TimetableEntry>,
}

impl Timetable {
    pub fn entry_for(&self, station: &str) -> Option<&TimetableEntry> {
        self.entries.iter().find(|e| e.station == station)
    }

    fn index_of(&self, station: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.station == station)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Train {
    pub id: TrainId,
    pub length: f64,
    pub max_speed: f64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub routes: Vec<RouteId>,
    #[serde(default)]
    pub itineraries: Vec<ItineraryId>,
    #[serde(default)]
    pub timetable: Timetable,
}

impl Train {
    /// Itinerary index 0 is the main itinerary.
    pub fn main_itinerary(&self) -> Option<&ItineraryId> {
        self.itineraries.first()
    }

    pub fn is_assigned(&self, route: &str) -> bool {
        self.routes.iter().any(|r| r == route)
    }
}

/// Flat form of the model as it comes out of the input files.
#[derive(Deserialize, Serialize, Debug)]
pub struct RawNetwork {
    pub routes: Vec<Route>,
    pub stations: Vec<Station>,
    pub itineraries: Vec<Itinerary>,
    pub trains: Vec<Train>,
}

/// The static network model. Built once at startup, shared by reference for
/// the whole run; never mutated afterwards.
pub struct Network {
    routes: HashMap<RouteId, Route>,
    stations: HashMap<StationId, Station>,
    itineraries: HashMap<ItineraryId, Itinerary>,
    trains: HashMap<TrainId, Train>,
}

fn index_unique<T, F>(items: Vec<T>, kind: &'static str, id_of: F) -> Result<HashMap<String, T>, ModelError>
where
    F: Fn(&T) -> &str,
{
    let mut map = HashMap::with_capacity(items.len());
    for item in items {
        let id = id_of(&item).to_string();
        if map.insert(id.clone(), item).is_some() {
            return Err(ModelError::Duplicate { kind, id });
        }
    }
    Ok(map)
}

impl Network {
    pub fn from_yaml(yaml: &str) -> Result<Self, ModelError> {
        let raw: RawNetwork = serde_yaml::from_str(yaml)?;
        Network::build(raw)
    }

    pub fn build(raw: RawNetwork) -> Result<Self, ModelError> {
        let network = Network {
            routes: index_unique(raw.routes, "route", |r| &r.id)?,
            stations: index_unique(raw.stations, "station", |s| &s.id)?,
            itineraries: index_unique(raw.itineraries, "itinerary", |i| &i.id)?,
            trains: index_unique(raw.trains, "train", |t| &t.id)?,
        };
        network.validate()?;
        Ok(network)
    }

    fn validate(&self) -> Result<(), ModelError> {
        for itinerary in self.itineraries.values() {
            for route in &itinerary.routes {
                self.route(route)?;
            }
            if let Some(station) = &itinerary.station {
                self.station(station)?;
            }
        }
        for train in self.trains.values() {
            for route in &train.routes {
                self.route(route)?;
            }
            for entry in &train.timetable.entries {
                self.station(&entry.station)?;
            }
            for itinerary in &train.itineraries {
                self.itinerary(itinerary)?;
            }
            self.check_itinerary_consistency(train)?;
        }
        Ok(())
    }

    /// A secondary itinerary must branch off the main one and come back to
    /// it: both of its endpoints have to lie on the main vertex chain.
    fn check_itinerary_consistency(&self, train: &Train) -> Result<(), ModelError> {
        let main = match train.main_itinerary() {
            Some(id) => self.itinerary(id)?,
            None => return Ok(()),
        };
        let mut main_chain = Vec::new();
        for route in &main.routes {
            main_chain.extend(self.route(route)?.vertices.iter().cloned());
        }
        for id in train.itineraries.iter().skip(1) {
            let secondary = self.itinerary(id)?;
            let first = secondary.routes.first().and_then(|r| {
                self.routes.get(r).and_then(|r| r.first_vertex())
            });
            let last = secondary.routes.last().and_then(|r| {
                self.routes.get(r).and_then(|r| r.last_vertex())
            });
            let on_main = |v: Option<&String>| v.map_or(false, |v| main_chain.contains(v));
            if !on_main(first) || !on_main(last) {
                return Err(ModelError::Invalid(format!(
                    "secondary itinerary {} of train {} does not start and end on the main itinerary",
                    id, train.id
                )));
            }
        }
        Ok(())
    }

    pub fn route(&self, id: &str) -> Result<&Route, ModelError> {
        self.routes.get(id).ok_or_else(|| ModelError::not_found("route", id))
    }

    pub fn station(&self, id: &str) -> Result<&Station, ModelError> {
        self.stations.get(id).ok_or_else(|| ModelError::not_found("station", id))
    }

    pub fn itinerary(&self, id: &str) -> Result<&Itinerary, ModelError> {
        self.itineraries.get(id).ok_or_else(|| ModelError::not_found("itinerary", id))
    }

    pub fn train(&self, id: &str) -> Result<&Train, ModelError> {
        self.trains.get(id).ok_or_else(|| ModelError::not_found("train", id))
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    pub fn trains(&self) -> impl Iterator<Item = &Train> {
        self.trains.values()
    }

    pub fn itineraries(&self) -> impl Iterator<Item = &Itinerary> {
        self.itineraries.values()
    }

    /// Routes leaving a station, i.e. the station's outflow routes.
    pub fn outflow_routes(&self, station: &str) -> Vec<&Route> {
        let mut routes: Vec<&Route> = self
            .routes
            .values()
            .filter(|r| r.from_station.as_deref() == Some(station))
            .collect();
        routes.sort_by(|a, b| a.id.cmp(&b.id));
        routes
    }

    /// Timetable entries shared by both trains, from `station` onwards in the
    /// order of `a`'s timetable.
    pub fn common_entries<'a>(
        &'a self,
        a: &str,
        b: &str,
        station: &str,
    ) -> Result<Vec<(&'a TimetableEntry, &'a TimetableEntry)>, ModelError> {
        let a = self.train(a)?;
        let b = self.train(b)?;
        let start = match a.timetable.index_of(station) {
            Some(i) => i,
            None => return Ok(Vec::new()),
        };
        let mut common = Vec::new();
        for entry in &a.timetable.entries[start..] {
            if let Some(other) = b.timetable.entry_for(&entry.station) {
                common.push((entry, other));
            }
        }
        Ok(common)
    }

    /// Planned slack of `train` between two stations: the scheduled running
    /// time minus the minimum dwell at intermediate stops. `None` when the
    /// timetable lacks the needed times.
    pub fn timetable_reserve(
        &self,
        train: &str,
        from: &str,
        to: &str,
    ) -> Result<Option<f64>, ModelError> {
        let train = self.train(train)?;
        let (from_idx, to_idx) = match (
            train.timetable.index_of(from),
            train.timetable.index_of(to),
        ) {
            (Some(f), Some(t)) if f < t => (f, t),
            _ => return Ok(None),
        };
        let departure = match train.timetable.entries[from_idx].departure {
            Some(t) => t,
            None => return Ok(None),
        };
        let arrival = match train.timetable.entries[to_idx].arrival {
            Some(t) => t,
            None => return Ok(None),
        };
        let running = arrival.num_seconds_from_midnight() as f64
            - departure.num_seconds_from_midnight() as f64;
        let dwell: u32 = train.timetable.entries[from_idx + 1..to_idx]
            .iter()
            .map(|e| e.min_dwell_secs)
            .sum();
        Ok(Some(running - dwell as f64))
    }
}
