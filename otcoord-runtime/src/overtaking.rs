use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, info, warn};

use otcoord_common::{Network, RouteId, Train};

use crate::area::Area;
use crate::blocking::{BlockQuery, BlockingLedger};
use crate::channel::{Command, SimChannel};
use crate::error::RuntimeError;
use crate::tracker::TrainTracker;

/// Translates overtake/cancel/release intents into outbound route permission
/// commands, with the [`BlockingLedger`] as the single source of truth for
/// what the simulator has already been told.
///
/// Callers hold the pause scope: every command batch issued here goes out
/// while the simulated clock is paused.
pub struct TrainOvertaking {
    network: Arc<Network>,
    ledger: BlockingLedger,
}

impl TrainOvertaking {
    pub fn new(network: Arc<Network>) -> Self {
        TrainOvertaking {
            network,
            ledger: BlockingLedger::new(),
        }
    }

    pub fn ledger(&self) -> &BlockingLedger {
        &self.ledger
    }

    /// Hold `waiting` at the area's outflow station until `overtaking` has
    /// passed. Refusals (capacity, track length) are not errors: they log
    /// and change nothing.
    pub async fn plan_overtaking<C: SimChannel + ?Sized>(
        &mut self,
        area: &Area,
        overtaking: &str,
        waiting: &str,
        tracker: &TrainTracker,
        channel: &C,
    ) -> Result<(), RuntimeError> {
        let station = area.station.as_str();
        if self.ledger.is_blocked_exact(station, overtaking, waiting) {
            debug!(
                "{} already blocked by {} at {}, nothing to do",
                waiting, overtaking, station
            );
            return Ok(());
        }
        if self.ledger.is_blocked_exact(station, waiting, overtaking) {
            warn!(
                "deadlock overtaking at {}: {} and {} each want to overtake the other; \
                 cancelling the standing relation first",
                station, overtaking, waiting
            );
            self.cancel_overtaking(area, waiting, overtaking, tracker, channel)
                .await?;
        }

        let waiting_train = self.network.train(waiting)?;
        let already_held = self
            .ledger
            .is_blocked_query(&BlockQuery::place(station).blocked(waiting));
        if !already_held {
            let held = self.ledger.count_blocked_at(station);
            if held as u32 >= area.max_waiting {
                info!(
                    "not blocking {} at {}: {} trains already waiting (max {})",
                    waiting, station, held, area.max_waiting
                );
                return Ok(());
            }
            match shortest_waiting_track(area, waiting_train, &self.network)? {
                Some(track) if track < waiting_train.length => {
                    info!(
                        "not blocking {} at {}: shortest waiting track {}m is shorter \
                         than the train ({}m)",
                        waiting, station, track, waiting_train.length
                    );
                    return Ok(());
                }
                Some(_) => {}
                None => {
                    info!(
                        "not blocking {} at {}: no waiting route of the area is \
                         assigned to it",
                        waiting, station
                    );
                    return Ok(());
                }
            }
        }

        self.ledger.block(station, overtaking, waiting);
        info!(
            "blocking {} at {} until {} has passed",
            waiting, station, overtaking
        );
        let entry = tracker.entry_route_of(overtaking, &area.name).cloned();
        for route in blocked_routes(area, waiting_train, entry.as_ref()) {
            if tracker.has_reserved(waiting, &route) {
                warn!(
                    "route {} already reserved by {}, skipping disallow (already \
                     effectively blocked)",
                    route, waiting
                );
                continue;
            }
            channel
                .send(&Command::DisallowRoute {
                    train: waiting.to_string(),
                    route,
                })
                .await?;
        }
        Ok(())
    }

    /// Undo one planned overtake. Route permissions come back only once no
    /// other blocker holds the waiting train at this station.
    pub async fn cancel_overtaking<C: SimChannel + ?Sized>(
        &mut self,
        area: &Area,
        overtaking: &str,
        waiting: &str,
        tracker: &TrainTracker,
        channel: &C,
    ) -> Result<(), RuntimeError> {
        let station = area.station.as_str();
        if !self.ledger.unblock(station, overtaking, waiting) {
            debug!(
                "{} was not blocked by {} at {}, nothing to cancel",
                waiting, overtaking, station
            );
            return Ok(());
        }
        info!("cancelled overtake of {} by {} at {}", waiting, overtaking, station);
        if self
            .ledger
            .is_blocked_query(&BlockQuery::place(station).blocked(waiting))
        {
            return Ok(());
        }
        let waiting_train = self.network.train(waiting)?;
        let entry = tracker.entry_route_of(overtaking, &area.name).cloned();
        self.allow_routes(area, waiting_train, entry.as_ref(), channel)
            .await
    }

    /// Release everything `blocker` was holding at this area, called when it
    /// leaves the area or is deleted. A single release pass: the invariants
    /// hold without re-running it.
    pub async fn release_trains<C: SimChannel + ?Sized>(
        &mut self,
        area: &Area,
        blocker: &str,
        channel: &C,
    ) -> Result<(), RuntimeError> {
        let station = area.station.as_str();
        let removed = self
            .ledger
            .unblock_all(&BlockQuery::place(station).blocker(blocker));
        if removed.is_empty() {
            return Ok(());
        }
        info!(
            "{} left {}, releasing {} held relation(s)",
            blocker,
            area.name,
            removed.len()
        );
        let mut freed: BTreeSet<&str> = BTreeSet::new();
        for entry in &removed {
            freed.insert(&entry.blocked);
        }
        for train in freed {
            if self
                .ledger
                .is_blocked_query(&BlockQuery::place(station).blocked(train))
            {
                continue;
            }
            let waiting_train = self.network.train(train)?;
            self.allow_routes(area, waiting_train, None, channel).await?;
        }
        Ok(())
    }

    async fn allow_routes<C: SimChannel + ?Sized>(
        &self,
        area: &Area,
        waiting_train: &Train,
        entry: Option<&RouteId>,
        channel: &C,
    ) -> Result<(), RuntimeError> {
        for route in blocked_routes(area, waiting_train, entry) {
            channel
                .send(&Command::AllowRoute {
                    train: waiting_train.id.clone(),
                    route,
                })
                .await?;
        }
        Ok(())
    }
}

/// The routes a block withholds from the waiting train: the entry route the
/// overtaking train used plus the area's outflow routes assigned to the
/// waiting train. When the overtaking train's entry route is no longer known
/// (it already left), the area's entry routes assigned to the waiting train
/// stand in, so that a release can never leave a permission withdrawn.
fn blocked_routes(area: &Area, waiting_train: &Train, entry: Option<&RouteId>) -> Vec<RouteId> {
    let mut routes: BTreeSet<RouteId> = area
        .outflow_routes
        .iter()
        .filter(|r| waiting_train.is_assigned(r))
        .cloned()
        .collect();
    match entry {
        Some(route) => {
            routes.insert(route.clone());
        }
        None => {
            routes.extend(
                area.entry_routes
                    .iter()
                    .filter(|r| waiting_train.is_assigned(r))
                    .cloned(),
            );
        }
    }
    routes.into_iter().collect()
}

fn shortest_waiting_track(
    area: &Area,
    waiting_train: &Train,
    network: &Network,
) -> Result<Option<f64>, RuntimeError> {
    let mut shortest: Option<f64> = None;
    for route in &area.waiting_routes {
        if !waiting_train.is_assigned(route) {
            continue;
        }
        let length = network.route(route)?.length;
        shortest = Some(match shortest {
            Some(s) if s <= length => s,
            _ => length,
        });
    }
    Ok(shortest)
}
