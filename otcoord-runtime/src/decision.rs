use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Timelike;
use log::debug;
use serde::Deserialize;
use serde_json::Value;

use otcoord_common::{Network, RouteId, TimetableEntry, Train, TrainId};

use crate::area::{Area, AreaSet};
use crate::error::RuntimeError;
use crate::tracker::TrainTracker;

/// Context of one area entry, handed to the decision module.
pub struct AreaEntry {
    pub area: Arc<Area>,
    pub train: TrainId,
    pub entry_route: RouteId,
    pub time: f64,
}

/// One overtake intent produced by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub area: String,
    pub overtaking: TrainId,
    pub waiting: TrainId,
}

/// Capability surface of a decision module invocation. Read access to the
/// network and tracker; write access limited to queueing overtake intents.
/// Built fresh per invocation, so concurrent decisions never share queues;
/// the coordinator commits the queues afterwards, cancellations first.
pub struct DecisionApi<'a> {
    network: &'a Network,
    tracker: &'a TrainTracker,
    areas: &'a AreaSet,
    planned: Vec<Decision>,
    cancelled: Vec<Decision>,
}

impl<'a> DecisionApi<'a> {
    pub fn new(network: &'a Network, tracker: &'a TrainTracker, areas: &'a AreaSet) -> Self {
        DecisionApi {
            network,
            tracker,
            areas,
            planned: Vec::new(),
            cancelled: Vec::new(),
        }
    }

    pub fn train(&self, id: &str) -> Result<&Train, RuntimeError> {
        Ok(self.network.train(id)?)
    }

    pub fn trains_in_area_in_order(&self, area: &Area) -> Vec<TrainId> {
        self.tracker.trains_in_area_in_order(&area.name)
    }

    pub fn areas_from_station(&self, station: &str) -> Vec<Arc<Area>> {
        self.areas.from_station(station)
    }

    pub fn common_entries(
        &self,
        a: &str,
        b: &str,
        station: &str,
    ) -> Result<Vec<(&'a TimetableEntry, &'a TimetableEntry)>, RuntimeError> {
        Ok(self.network.common_entries(a, b, station)?)
    }

    pub fn timetable_reserve(
        &self,
        train: &str,
        from: &str,
        to: &str,
    ) -> Result<Option<f64>, RuntimeError> {
        Ok(self.network.timetable_reserve(train, from, to)?)
    }

    /// Seconds the train has been standing still, per its position reports.
    pub fn stop_duration(&self, train: &str, now: f64) -> Option<f64> {
        self.tracker.stop_duration(train, now)
    }

    /// Estimated arrival at a station in seconds since midnight: the planned
    /// arrival shifted by the train's currently reported delay.
    pub fn delayed_arrival(&self, train: &str, station: &str) -> Result<Option<f64>, RuntimeError> {
        let planned = self
            .network
            .train(train)?
            .timetable
            .entry_for(station)
            .and_then(|e| e.arrival);
        let planned = match planned {
            Some(t) => t.num_seconds_from_midnight() as f64,
            None => return Ok(None),
        };
        let delay = self
            .tracker
            .train(train)
            .and_then(|s| s.last_report.as_ref())
            .map_or(0.0, |r| r.delay);
        Ok(Some(planned + delay))
    }

    /// Queue an overtake; applied by the coordinator after the module
    /// returns, never immediately.
    pub fn plan_overtaking(&mut self, area: &Area, overtaking: &str, waiting: &str) {
        self.planned.push(Decision {
            area: area.name.clone(),
            overtaking: overtaking.to_string(),
            waiting: waiting.to_string(),
        });
    }

    pub fn cancel_overtaking(&mut self, area: &Area, overtaking: &str, waiting: &str) {
        self.cancelled.push(Decision {
            area: area.name.clone(),
            overtaking: overtaking.to_string(),
            waiting: waiting.to_string(),
        });
    }

    /// (planned, cancelled) intents, in queueing order.
    pub(crate) fn into_queues(self) -> (Vec<Decision>, Vec<Decision>) {
        (self.planned, self.cancelled)
    }
}

/// A pluggable overtaking strategy, invoked whenever a train enters an
/// overtaking area.
#[async_trait]
pub trait DecisionModule: Send {
    fn name(&self) -> &str;

    async fn on_train_entered_area(
        &mut self,
        api: &mut DecisionApi<'_>,
        entry: &AreaEntry,
    ) -> Result<(), RuntimeError>;
}

/// Plans an overtake whenever the entering train is faster than another
/// occupant of the area by at least `min_gain` (km/h, default 0).
pub struct MaxSpeedModule {
    min_gain: f64,
}

#[derive(Deserialize, Default)]
struct MaxSpeedArgs {
    #[serde(default)]
    min_gain: f64,
}

impl MaxSpeedModule {
    pub fn from_args(args: Value) -> Result<Box<dyn DecisionModule>, RuntimeError> {
        let args: MaxSpeedArgs = if args.is_null() {
            Default::default()
        } else {
            serde_json::from_value(args)
                .map_err(|e| RuntimeError::Config(format!("max-speed args: {}", e)))?
        };
        Ok(Box::new(MaxSpeedModule {
            min_gain: args.min_gain,
        }))
    }
}

#[async_trait]
impl DecisionModule for MaxSpeedModule {
    fn name(&self) -> &str {
        "max-speed"
    }

    async fn on_train_entered_area(
        &mut self,
        api: &mut DecisionApi<'_>,
        entry: &AreaEntry,
    ) -> Result<(), RuntimeError> {
        let newcomer = api.train(&entry.train)?.max_speed;
        for other in api.trains_in_area_in_order(&entry.area) {
            if other == entry.train {
                continue;
            }
            let ahead = api.train(&other)?.max_speed;
            if newcomer > ahead + self.min_gain {
                debug!(
                    "{} ({} km/h) can overtake {} ({} km/h) in {}",
                    entry.train, newcomer, other, ahead, entry.area.name
                );
                api.plan_overtaking(&entry.area, &entry.train, &other);
            }
        }
        Ok(())
    }
}

/// Decides nothing; the baseline for comparison runs.
pub struct NoopModule;

#[async_trait]
impl DecisionModule for NoopModule {
    fn name(&self) -> &str {
        "noop"
    }

    async fn on_train_entered_area(
        &mut self,
        _api: &mut DecisionApi<'_>,
        _entry: &AreaEntry,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }
}

type ModuleFactory = fn(Value) -> Result<Box<dyn DecisionModule>, RuntimeError>;

/// Named strategy registry, configured via `name?jsonArgs` spec strings.
/// Externally supplied strategies register themselves before the run starts.
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = ModuleRegistry::new();
        registry.register("max-speed", MaxSpeedModule::from_args);
        registry.register("noop", |_| Ok(Box::new(NoopModule)));
        registry
    }

    pub fn register(&mut self, name: &str, factory: ModuleFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Build a module from a `name?jsonArgs` spec string.
    pub fn build(&self, spec: &str) -> Result<Box<dyn DecisionModule>, RuntimeError> {
        let (name, args) = match spec.split_once('?') {
            Some((name, args)) => {
                let args: Value = serde_json::from_str(args).map_err(|e| {
                    RuntimeError::Config(format!("module args of {}: {}", name, e))
                })?;
                (name, args)
            }
            None => (spec, Value::Null),
        };
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RuntimeError::Config(format!("unknown decision module: {}", name)))?;
        factory(args)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        ModuleRegistry::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SimEvent;
    use crate::testutil::{test_areas, test_network, ScriptChannel};

    #[test]
    fn registry_parses_spec_strings() {
        let registry = ModuleRegistry::with_builtins();
        assert_eq!(registry.build("noop").unwrap().name(), "noop");
        assert_eq!(
            registry.build("max-speed?{\"min_gain\": 20}").unwrap().name(),
            "max-speed"
        );
        assert!(matches!(
            registry.build("no-such-module"),
            Err(RuntimeError::Config(_))
        ));
        assert!(matches!(
            registry.build("max-speed?not json"),
            Err(RuntimeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn max_speed_module_plans_against_slower_trains_ahead() {
        let network = test_network();
        let areas = test_areas(&network);
        let channel = ScriptChannel::new();
        let mut tracker = TrainTracker::new(&areas, &network, 10).unwrap();
        for (train, route) in &[("T1", "in-main"), ("T2", "in-side")] {
            tracker
                .handle_event(
                    &SimEvent::TrainCreated {
                        train: train.to_string(),
                        time: 0.0,
                    },
                    &*channel,
                )
                .await;
            tracker
                .handle_event(
                    &SimEvent::RouteEntry {
                        train: train.to_string(),
                        route: route.to_string(),
                        time: 0.0,
                    },
                    &*channel,
                )
                .await;
        }

        let area = areas.get("ovt-S2").unwrap().clone();
        let mut api = DecisionApi::new(&network, &tracker, &areas);
        let mut module = MaxSpeedModule { min_gain: 0.0 };
        let entry = AreaEntry {
            area: area.clone(),
            train: "T2".to_string(),
            entry_route: "in-side".to_string(),
            time: 5.0,
        };
        module.on_train_entered_area(&mut api, &entry).await.unwrap();

        let (planned, cancelled) = api.into_queues();
        assert!(cancelled.is_empty());
        assert_eq!(
            planned,
            vec![Decision {
                area: "ovt-S2".to_string(),
                overtaking: "T2".to_string(),
                waiting: "T1".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn delayed_arrival_adds_the_reported_delay() {
        let network = test_network();
        let areas = test_areas(&network);
        let channel = ScriptChannel::new();
        let mut tracker = TrainTracker::new(&areas, &network, 10).unwrap();
        tracker
            .handle_event(
                &SimEvent::TrainCreated {
                    train: "T1".to_string(),
                    time: 0.0,
                },
                &*channel,
            )
            .await;
        let mut report = crate::testutil::report("in-main", 100.0, 30.0);
        report.delay = 120.0;
        tracker
            .handle_event(
                &SimEvent::TrainPositionReport {
                    train: "T1".to_string(),
                    report,
                },
                &*channel,
            )
            .await;

        let api = DecisionApi::new(&network, &tracker, &areas);
        // T1 is planned into S2 at 08:20:00 = 30000s.
        assert_eq!(api.delayed_arrival("T1", "S2").unwrap(), Some(30120.0));
        assert_eq!(api.delayed_arrival("T1", "S9").unwrap(), None);
    }
}
