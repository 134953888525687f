//! Overtaking coordination runtime.
//!
//! Consumes the simulator's telemetry stream, tracks trains through the
//! modeled network, and lets a pluggable decision module decide when a train
//! may overtake another at a designated area. Outbound blocking commands are
//! batched while the simulated clock is paused so they apply atomically
//! between simulated time steps.

pub mod area;
pub mod blocking;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod decision;
pub mod error;
pub mod overtaking;
pub mod retry;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;

use tokio::sync::mpsc::Receiver;

use otcoord_common::Network;

use crate::area::AreaSet;
use crate::channel::{Command, SimChannel, SimEvent};
use crate::config::RunConfig;
use crate::coordinator::Coordinator;
use crate::decision::ModuleRegistry;
use crate::error::RuntimeError;

/// One simulation run: wait for the simulator to answer, start the clock and
/// coordinate until the event stream reports `simStopped` or closes.
///
/// The caller owns the surrounding lifecycle (spawning the simulator, wiring
/// the transport, bounded per-run retries via [`retry::retry_run`]).
pub async fn run_once<C: SimChannel>(
    config: &RunConfig,
    network: Arc<Network>,
    channel: Arc<C>,
    events: &mut Receiver<SimEvent>,
) -> Result<(), RuntimeError> {
    let areas = AreaSet::build(&network)?;
    let module = ModuleRegistry::with_builtins().build(&config.module)?;
    let mut coordinator = Coordinator::new(
        channel.clone(),
        network,
        areas,
        module,
        config.position_report_interval_secs,
    )?;

    retry::await_simulator(&*channel, config.retry.cooldown()).await;
    channel.send(&Command::StartSimulation).await?;
    coordinator.run(events).await
}
