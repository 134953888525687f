//! Shared fixtures: a small two-track overtaking layout and a scripted
//! in-memory channel standing in for the simulator connection.
//!
//! Layout: S1 --in-main/in-side--> S2 --out--> S3 --tail-->
//! Both inflow routes join at vertex `w` ahead of the outflow route.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use otcoord_common::model::RawNetwork;
use otcoord_common::{Itinerary, Network, Route, Station, Timetable, TimetableEntry, Train};

use crate::area::AreaSet;
use crate::channel::{Command, PositionReport, SimChannel};
use crate::error::ChannelError;

fn route(id: &str, length: f64, vertices: &[&str], from: Option<&str>, to: Option<&str>) -> Route {
    Route {
        id: id.to_string(),
        length,
        vertices: vertices.iter().map(|v| v.to_string()).collect(),
        from_station: from.map(str::to_string),
        to_station: to.map(str::to_string),
        track: None,
    }
}

fn station(id: &str) -> Station {
    Station {
        id: id.to_string(),
        name: id.to_string(),
    }
}

fn entry(station: &str, arrival: &str, departure: &str) -> TimetableEntry {
    TimetableEntry {
        station: station.to_string(),
        arrival: Some(arrival.parse().unwrap()),
        departure: Some(departure.parse().unwrap()),
        min_dwell_secs: 60,
    }
}

fn train(id: &str, max_speed: f64, length: f64, routes: &[&str]) -> Train {
    Train {
        id: id.to_string(),
        length,
        max_speed,
        category: None,
        routes: routes.iter().map(|r| r.to_string()).collect(),
        itineraries: vec![],
        timetable: Timetable::default(),
    }
}

pub(crate) fn test_network() -> Network {
    let mut t1 = train("T1", 100.0, 150.0, &["in-main", "out"]);
    t1.timetable = Timetable {
        entries: vec![
            entry("S1", "08:00:00", "08:02:00"),
            entry("S2", "08:20:00", "08:22:00"),
            entry("S3", "08:40:00", "08:42:00"),
        ],
    };
    let raw = RawNetwork {
        routes: vec![
            route("in-main", 1000.0, &["a", "w"], Some("S1"), Some("S2")),
            route("in-side", 900.0, &["b", "w"], Some("S1"), Some("S2")),
            route("out", 500.0, &["w", "x"], Some("S2"), Some("S3")),
            route("tail", 700.0, &["x", "y"], Some("S3"), None),
        ],
        stations: vec![station("S1"), station("S2"), station("S3")],
        itineraries: vec![
            Itinerary {
                id: "ovt-S2".to_string(),
                routes: vec![
                    "in-main".to_string(),
                    "in-side".to_string(),
                    "out".to_string(),
                ],
                overtaking: true,
                max_waiting: Some(2),
                station: Some("S2".to_string()),
            },
            Itinerary {
                id: "ovt-S3".to_string(),
                routes: vec!["tail".to_string()],
                overtaking: true,
                max_waiting: None,
                station: Some("S3".to_string()),
            },
        ],
        trains: vec![
            t1,
            train("T2", 160.0, 150.0, &["in-side", "out"]),
            train("T3", 120.0, 150.0, &["in-main", "out"]),
            train("T4", 120.0, 150.0, &["in-main", "out"]),
            train("TL", 90.0, 5000.0, &["in-side", "out"]),
        ],
    };
    Network::build(raw).unwrap()
}

pub(crate) fn test_areas(network: &Network) -> AreaSet {
    AreaSet::build(network).unwrap()
}

pub(crate) fn report(route: &str, offset: f64, time: f64) -> PositionReport {
    PositionReport {
        route: route.to_string(),
        offset,
        time,
        delay: 0.0,
        speed: 20.0,
        acceleration: 0.0,
    }
}

/// Records every successfully sent command; can be told to fail the next
/// `times` sends of a given command name.
pub(crate) struct ScriptChannel {
    sent: Mutex<Vec<Command>>,
    failures: Mutex<HashMap<String, u32>>,
}

impl ScriptChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptChannel {
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        })
    }

    pub fn fail(&self, command: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(command.to_string(), times);
    }

    pub fn sent(&self) -> Vec<Command> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_names(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl SimChannel for ScriptChannel {
    async fn send(&self, command: &Command) -> Result<(), ChannelError> {
        let name = command.to_string();
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ChannelError::Timeout(50));
                }
            }
        }
        self.sent.lock().unwrap().push(command.clone());
        Ok(())
    }
}
