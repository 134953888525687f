use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::mpsc::Receiver;

use otcoord_common::Network;

use crate::area::AreaSet;
use crate::blocking::BlockQuery;
use crate::channel::{Command, PauseScope, SimChannel, SimEvent};
use crate::decision::{AreaEntry, Decision, DecisionApi, DecisionModule};
use crate::error::RuntimeError;
use crate::overtaking::TrainOvertaking;
use crate::tracker::{TrackEvent, TrainTracker};

/// Wires area entry/exit events to the decision module and commits its
/// decisions through [`TrainOvertaking`], one paused-clock batch per
/// decision. Owns the single tracker and ledger of the run; modules only
/// ever see the narrow [`DecisionApi`] surface.
pub struct Coordinator<C: SimChannel> {
    channel: Arc<C>,
    network: Arc<Network>,
    areas: AreaSet,
    tracker: TrainTracker,
    overtaking: TrainOvertaking,
    module: Box<dyn DecisionModule>,
}

impl<C: SimChannel> Coordinator<C> {
    pub fn new(
        channel: Arc<C>,
        network: Arc<Network>,
        areas: AreaSet,
        module: Box<dyn DecisionModule>,
        position_report_interval_secs: u32,
    ) -> Result<Self, RuntimeError> {
        let tracker = TrainTracker::new(&areas, &network, position_report_interval_secs)?;
        Ok(Coordinator {
            overtaking: TrainOvertaking::new(network.clone()),
            channel,
            network,
            areas,
            tracker,
            module,
        })
    }

    pub fn tracker(&self) -> &TrainTracker {
        &self.tracker
    }

    pub fn overtaking(&self) -> &TrainOvertaking {
        &self.overtaking
    }

    /// Consume the event stream until it closes or the simulator stops.
    pub async fn run(&mut self, events: &mut Receiver<SimEvent>) -> Result<(), RuntimeError> {
        while let Some(event) = events.recv().await {
            let stopped = matches!(event, SimEvent::SimStopped { .. });
            self.handle(&event).await;
            if stopped {
                info!("simulation stopped at t={}", event.time());
                break;
            }
        }
        Ok(())
    }

    /// Handle one telemetry event. Errors local to one area visit or module
    /// invocation are absorbed here; the run continues.
    pub async fn handle(&mut self, event: &SimEvent) {
        let derived = self.tracker.handle_event(event, &*self.channel).await;

        match event {
            SimEvent::TrainCreated { train, .. } => self.enable_assigned_routes(train).await,
            SimEvent::TrainDeleted { train, .. } => self.release_everywhere(train).await,
            _ => {}
        }

        for track_event in derived {
            match track_event {
                TrackEvent::EnteredArea { area, train, route, time } => {
                    if let Err(e) = self.decide(&area, &train, &route, time).await {
                        error!(
                            "decision for train {} entering {} via {} at t={} failed: {}",
                            train, area, route, time, e
                        );
                    }
                }
                TrackEvent::LeftArea { area, train, .. } => {
                    if let Err(e) = self.release(&area, &train).await {
                        error!("release for {} leaving {} failed: {}", train, area, e);
                    }
                }
                TrackEvent::ReservedRoute { .. } | TrackEvent::ReleasedRoute { .. } => {}
            }
        }
    }

    /// One area-visit decision: pause the clock, ask the module, commit its
    /// queues (cancellations before plans), resume. A failing module means
    /// "no decision this time", never a dead run.
    async fn decide(
        &mut self,
        area_name: &str,
        train: &str,
        entry_route: &str,
        time: f64,
    ) -> Result<(), RuntimeError> {
        let area = self.areas.get(area_name)?.clone();
        let channel = self.channel.clone();
        let scope = PauseScope::enter(&*channel).await?;

        let mut api = DecisionApi::new(&self.network, &self.tracker, &self.areas);
        let entry = AreaEntry {
            area,
            train: train.to_string(),
            entry_route: entry_route.to_string(),
            time,
        };
        let module_result = self.module.on_train_entered_area(&mut api, &entry).await;
        let (planned, cancelled) = api.into_queues();
        let committed = match module_result {
            Ok(()) => self.commit(cancelled, planned).await,
            Err(e) => {
                // Queued intents of a failed module are discarded.
                let failure = RuntimeError::Module {
                    module: self.module.name().to_string(),
                    message: e.to_string(),
                };
                error!(
                    "{} (train {} in area {}, route {}, t={}); treating as no decision",
                    failure, train, area_name, entry_route, time
                );
                Ok(())
            }
        };
        let resumed = scope.finish().await;
        committed?;
        resumed?;
        Ok(())
    }

    async fn commit(
        &mut self,
        cancelled: Vec<Decision>,
        planned: Vec<Decision>,
    ) -> Result<(), RuntimeError> {
        let channel = self.channel.clone();
        for decision in cancelled {
            let area = self.areas.get(&decision.area)?.clone();
            self.overtaking
                .cancel_overtaking(
                    &area,
                    &decision.overtaking,
                    &decision.waiting,
                    &self.tracker,
                    &*channel,
                )
                .await?;
        }
        for decision in planned {
            let area = self.areas.get(&decision.area)?.clone();
            self.overtaking
                .plan_overtaking(
                    &area,
                    &decision.overtaking,
                    &decision.waiting,
                    &self.tracker,
                    &*channel,
                )
                .await?;
        }
        Ok(())
    }

    /// Release everything `train` was blocking in `area`, inside a paused
    /// batch. Nothing is sent when the train blocked nobody.
    async fn release(&mut self, area_name: &str, train: &str) -> Result<(), RuntimeError> {
        let area = self.areas.get(area_name)?.clone();
        let held = self
            .overtaking
            .ledger()
            .is_blocked_query(&BlockQuery::place(&area.station).blocker(train));
        if !held {
            return Ok(());
        }
        let channel = self.channel.clone();
        let scope = PauseScope::enter(&*channel).await?;
        let released = self
            .overtaking
            .release_trains(&area, train, &*channel)
            .await;
        let resumed = scope.finish().await;
        released?;
        resumed?;
        Ok(())
    }

    /// A deleted train can no longer leave an area through a route exit, so
    /// its holds are released against every known area.
    async fn release_everywhere(&mut self, train: &str) {
        for name in self.areas.names() {
            if let Err(e) = self.release(&name, train).await {
                error!("release for deleted train {} in {} failed: {}", train, name, e);
            }
        }
    }

    /// A freshly created train starts with no route permissions; enable all
    /// of its assigned routes. Best-effort.
    async fn enable_assigned_routes(&self, train_id: &str) {
        let train = match self.network.train(train_id) {
            Ok(train) => train,
            Err(e) => {
                debug!("created train not in the model, skipping: {}", e);
                return;
            }
        };
        for route in &train.routes {
            let cmd = Command::AllowRoute {
                train: train_id.to_string(),
                route: route.clone(),
            };
            if let Err(e) = self.channel.send(&cmd).await {
                error!("cannot enable route {} for new train {}: {}", route, train_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::decision::ModuleRegistry;
    use crate::testutil::{test_areas, test_network, ScriptChannel};

    fn coordinator(module: &str) -> (Coordinator<ScriptChannel>, Arc<ScriptChannel>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let network = Arc::new(test_network());
        let areas = test_areas(&network);
        let channel = ScriptChannel::new();
        let module = ModuleRegistry::with_builtins().build(module).unwrap();
        let coordinator =
            Coordinator::new(channel.clone(), network, areas, module, 10).unwrap();
        (coordinator, channel)
    }

    fn route_entry(train: &str, route: &str, time: f64) -> SimEvent {
        SimEvent::RouteEntry {
            train: train.to_string(),
            route: route.to_string(),
            time,
        }
    }

    async fn create_trains(
        coordinator: &mut Coordinator<ScriptChannel>,
        channel: &ScriptChannel,
        trains: &[&str],
    ) {
        for train in trains {
            coordinator
                .handle(&SimEvent::TrainCreated {
                    train: train.to_string(),
                    time: 0.0,
                })
                .await;
        }
        channel.clear();
    }

    #[tokio::test]
    async fn created_trains_get_their_assigned_routes_enabled() {
        let (mut coordinator, channel) = coordinator("noop");
        coordinator
            .handle(&SimEvent::TrainCreated {
                train: "T1".to_string(),
                time: 0.0,
            })
            .await;
        assert_eq!(
            channel.sent_names(),
            vec!["setPositionReports", "allowRoute", "allowRoute"]
        );
    }

    #[tokio::test]
    async fn max_speed_scenario_plans_the_fast_train_over_the_slow_one() {
        let (mut coordinator, channel) = coordinator("max-speed");
        create_trains(&mut coordinator, &channel, &["T1", "T2"]).await;
        coordinator.handle(&route_entry("T1", "in-main", 10.0)).await;
        // T1 alone in the area: paused, no decision, resumed.
        assert_eq!(channel.sent_names(), vec!["pauseSimulation", "continueSimulation"]);

        channel.clear();
        coordinator.handle(&route_entry("T2", "in-side", 20.0)).await;
        assert_eq!(
            channel.sent_names(),
            vec![
                "pauseSimulation",
                "disallowRoute",
                "disallowRoute",
                "continueSimulation"
            ]
        );

        let entries: Vec<_> = coordinator.overtaking().ledger().entries().collect();
        assert_eq!(entries.len(), 1);
        let entry = entries[0];
        assert_eq!(
            (entry.place.as_str(), entry.blocker.as_str(), entry.blocked.as_str()),
            ("S2", "T2", "T1")
        );
    }

    #[tokio::test]
    async fn leaving_without_blocking_anyone_sends_nothing() {
        let (mut coordinator, channel) = coordinator("max-speed");
        create_trains(&mut coordinator, &channel, &["T1"]).await;
        coordinator.handle(&route_entry("T1", "in-main", 10.0)).await;
        channel.clear();

        coordinator
            .handle(&SimEvent::RouteExit {
                train: "T1".to_string(),
                route: "in-main".to_string(),
                time: 30.0,
            })
            .await;
        assert!(channel.sent().is_empty());
        assert!(coordinator.tracker().train("T1").map_or(true, |s| s.areas.is_empty()));
    }

    #[tokio::test]
    async fn deleting_the_blocker_releases_its_holds() {
        let (mut coordinator, channel) = coordinator("max-speed");
        create_trains(&mut coordinator, &channel, &["T1", "T2"]).await;
        coordinator.handle(&route_entry("T1", "in-main", 10.0)).await;
        coordinator.handle(&route_entry("T2", "in-side", 20.0)).await;
        assert!(coordinator.overtaking().ledger().is_blocked("T1"));

        channel.clear();
        coordinator
            .handle(&SimEvent::TrainDeleted {
                train: "T2".to_string(),
                time: 40.0,
            })
            .await;
        assert!(!coordinator.overtaking().ledger().is_blocked("T1"));
        let names = channel.sent_names();
        assert_eq!(names.first().map(String::as_str), Some("pauseSimulation"));
        assert_eq!(names.last().map(String::as_str), Some("continueSimulation"));
        assert!(names.iter().any(|n| n == "allowRoute"));
    }

    #[tokio::test]
    async fn clock_resumes_even_when_the_commit_fails_on_the_wire() {
        let (mut coordinator, channel) = coordinator("max-speed");
        create_trains(&mut coordinator, &channel, &["T1", "T2"]).await;
        coordinator.handle(&route_entry("T1", "in-main", 10.0)).await;
        channel.clear();

        channel.fail("disallowRoute", 1);
        coordinator.handle(&route_entry("T2", "in-side", 20.0)).await;
        // The batch aborted mid-way, but the simulator is not left paused.
        assert_eq!(
            channel.sent_names().last().map(String::as_str),
            Some("continueSimulation")
        );
    }

    struct ExplodingModule;

    #[async_trait]
    impl DecisionModule for ExplodingModule {
        fn name(&self) -> &str {
            "exploding"
        }

        async fn on_train_entered_area(
            &mut self,
            _api: &mut DecisionApi<'_>,
            _entry: &AreaEntry,
        ) -> Result<(), RuntimeError> {
            Err(RuntimeError::Bug("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn a_throwing_module_degrades_to_no_decision() {
        let network = Arc::new(test_network());
        let areas = test_areas(&network);
        let channel = ScriptChannel::new();
        let mut coordinator = Coordinator::new(
            channel.clone(),
            network,
            areas,
            Box::new(ExplodingModule),
            10,
        )
        .unwrap();

        create_trains(&mut coordinator, &channel, &["T1"]).await;
        coordinator.handle(&route_entry("T1", "in-main", 10.0)).await;
        // The failure is absorbed: clock resumed, no ledger mutation.
        assert_eq!(channel.sent_names(), vec!["pauseSimulation", "continueSimulation"]);
        assert_eq!(coordinator.overtaking().ledger().entries().count(), 0);

        // Subsequent events keep being processed.
        channel.clear();
        coordinator
            .handle(&SimEvent::TrainCreated {
                train: "T2".to_string(),
                time: 20.0,
            })
            .await;
        assert!(coordinator.tracker().train("T2").is_some());
        assert!(channel.sent_names().contains(&"setPositionReports".to_string()));
    }

    #[tokio::test]
    async fn run_loop_ends_on_sim_stopped() {
        let (mut coordinator, _channel) = coordinator("noop");
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        tx.send(SimEvent::SimStarted { time: 0.0 }).await.unwrap();
        tx.send(SimEvent::SimStopped { time: 100.0 }).await.unwrap();
        // Not dropping tx: run must return because of simStopped.
        coordinator.run(&mut rx).await.unwrap();
    }
}
