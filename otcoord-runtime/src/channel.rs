use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum_macros::{Display, EnumString};

use otcoord_common::{RouteId, StationId, TrainId};

use crate::error::ChannelError;

/// Periodic per-train telemetry sample.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PositionReport {
    pub route: RouteId,
    /// Offset along the route, metres from its start.
    pub offset: f64,
    /// Simulated seconds.
    pub time: f64,
    pub delay: f64,
    pub speed: f64,
    pub acceleration: f64,
}

impl PositionReport {
    pub fn is_standstill(&self) -> bool {
        self.speed == 0.0 && self.acceleration == 0.0
    }
}

/// Telemetry delivered by the simulator, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    TrainCreated { train: TrainId, time: f64 },
    TrainDeleted { train: TrainId, time: f64 },
    TrainPositionReport { train: TrainId, report: PositionReport },
    TrainArrival { train: TrainId, station: StationId, time: f64 },
    TrainDeparture { train: TrainId, station: StationId, time: f64 },
    TrainPass { train: TrainId, station: StationId, time: f64 },
    RouteEntry { train: TrainId, route: RouteId, time: f64 },
    RouteExit { train: TrainId, route: RouteId, time: f64 },
    RouteReserved { train: TrainId, route: RouteId, time: f64 },
    RouteReleased { train: TrainId, route: RouteId, time: f64 },
    SimStarted { time: f64 },
    SimStopped { time: f64 },
    SimPaused { time: f64 },
    SimContinued { time: f64 },
}

/// The subscribe-by-name event names of the wire protocol.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum EventKind {
    TrainCreated,
    TrainDeleted,
    TrainPositionReport,
    TrainArrival,
    TrainDeparture,
    TrainPass,
    RouteEntry,
    RouteExit,
    RouteReserved,
    RouteReleased,
    SimStarted,
    SimStopped,
    SimPaused,
    SimContinued,
}

impl SimEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SimEvent::TrainCreated { .. } => EventKind::TrainCreated,
            SimEvent::TrainDeleted { .. } => EventKind::TrainDeleted,
            SimEvent::TrainPositionReport { .. } => EventKind::TrainPositionReport,
            SimEvent::TrainArrival { .. } => EventKind::TrainArrival,
            SimEvent::TrainDeparture { .. } => EventKind::TrainDeparture,
            SimEvent::TrainPass { .. } => EventKind::TrainPass,
            SimEvent::RouteEntry { .. } => EventKind::RouteEntry,
            SimEvent::RouteExit { .. } => EventKind::RouteExit,
            SimEvent::RouteReserved { .. } => EventKind::RouteReserved,
            SimEvent::RouteReleased { .. } => EventKind::RouteReleased,
            SimEvent::SimStarted { .. } => EventKind::SimStarted,
            SimEvent::SimStopped { .. } => EventKind::SimStopped,
            SimEvent::SimPaused { .. } => EventKind::SimPaused,
            SimEvent::SimContinued { .. } => EventKind::SimContinued,
        }
    }

    pub fn time(&self) -> f64 {
        match self {
            SimEvent::TrainCreated { time, .. }
            | SimEvent::TrainDeleted { time, .. }
            | SimEvent::TrainArrival { time, .. }
            | SimEvent::TrainDeparture { time, .. }
            | SimEvent::TrainPass { time, .. }
            | SimEvent::RouteEntry { time, .. }
            | SimEvent::RouteExit { time, .. }
            | SimEvent::RouteReserved { time, .. }
            | SimEvent::RouteReleased { time, .. }
            | SimEvent::SimStarted { time }
            | SimEvent::SimStopped { time }
            | SimEvent::SimPaused { time }
            | SimEvent::SimContinued { time } => *time,
            SimEvent::TrainPositionReport { report, .. } => report.time,
        }
    }
}

/// Outbound commands. The variant name is the wire command name.
#[derive(Debug, Clone, Eq, PartialEq, Display)]
#[strum(serialize_all = "camelCase")]
pub enum Command {
    AllowRoute { train: TrainId, route: RouteId },
    DisallowRoute { train: TrainId, route: RouteId },
    SetPositionReports { train: TrainId, interval_secs: u32 },
    PauseSimulation,
    ContinueSimulation,
    StartSimulation,
    Ping,
}

impl Command {
    pub fn params(&self) -> Value {
        match self {
            Command::AllowRoute { train, route } | Command::DisallowRoute { train, route } => {
                json!({ "trainID": train, "routeID": route })
            }
            Command::SetPositionReports { train, interval_secs } => {
                json!({ "trainID": train, "interval": interval_secs })
            }
            Command::PauseSimulation
            | Command::ContinueSimulation
            | Command::StartSimulation
            | Command::Ping => json!({}),
        }
    }
}

/// Outbound half of the simulator connection. Immediate failures propagate
/// to the caller; retrying is a concern of the layers above.
#[async_trait]
pub trait SimChannel: Send + Sync {
    async fn send(&self, command: &Command) -> Result<(), ChannelError>;
}

/// Scoped "pause the clock, send a batch, resume" transaction. Everything
/// sent between [`PauseScope::enter`] and [`PauseScope::finish`] is atomic
/// with respect to simulated time.
///
/// The scope must be finished on every exit path; dropping it unfinished
/// leaves the simulator paused and is logged as a bug.
#[must_use]
pub struct PauseScope<'a, C: SimChannel + ?Sized> {
    channel: &'a C,
    finished: bool,
}

impl<'a, C: SimChannel + ?Sized> PauseScope<'a, C> {
    pub async fn enter(channel: &'a C) -> Result<PauseScope<'a, C>, ChannelError> {
        channel.send(&Command::PauseSimulation).await?;
        Ok(PauseScope {
            channel,
            finished: false,
        })
    }

    /// Resume the simulated clock.
    pub async fn finish(mut self) -> Result<(), ChannelError> {
        self.finished = true;
        self.channel.send(&Command::ContinueSimulation).await
    }
}

impl<'a, C: SimChannel + ?Sized> Drop for PauseScope<'a, C> {
    fn drop(&mut self) {
        if !self.finished {
            log::error!("BUG: pause scope dropped without resuming the simulator clock");
        }
    }
}
