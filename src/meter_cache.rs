//! The meter cache: one background task pulls readings from Home Assistant,
//! every protocol handler reads copies of the latest snapshot.

use crate::discovery::EntityDiscovery;
use crate::entities::{EntityMapping, PhaseEntities, PowerLayout};
use crate::home_assistant::ReadingSource;
use crate::meter_data::{MeterSnapshot, PhaseReading};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DISCOVERY_RETRY_INTERVAL: Duration = Duration::from_secs(30);
pub const REFRESH_CYCLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot slot shared between the refresh task and readers.
///
/// The lock is only held while copying a snapshot in or out.
#[derive(Clone, Default)]
struct SnapshotSlot(Arc<Mutex<MeterSnapshot>>);

impl SnapshotSlot {
    fn lock(&self) -> MutexGuard<'_, MeterSnapshot> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self) -> MeterSnapshot {
        self.lock().clone()
    }

    fn store(&self, snapshot: MeterSnapshot) {
        *self.lock() = snapshot;
    }
}

enum CacheState {
    Idle(Box<RefreshCycle>),
    Running {
        token: CancellationToken,
        handle: JoinHandle<RefreshCycle>,
    },
    /// The refresh task did not hand its state back when stopped
    Lost,
}

pub struct MeterCache {
    slot: SnapshotSlot,
    state: Mutex<CacheState>,
}

impl MeterCache {
    pub fn new(
        source: Arc<dyn ReadingSource>,
        entities: EntityMapping,
        discovery: Option<Arc<dyn EntityDiscovery>>,
        poll_interval: Duration,
    ) -> Self {
        let slot = SnapshotSlot::default();
        let cycle = RefreshCycle {
            source,
            entities,
            discovery,
            poll_interval,
            last_seen: HashMap::new(),
            discovery_attempted: false,
            slot: slot.clone(),
        };
        Self {
            slot,
            state: Mutex::new(CacheState::Idle(Box::new(cycle))),
        }
    }

    /// Independent copy of the current snapshot. Never waits on network I/O.
    pub fn get_snapshot(&self) -> MeterSnapshot {
        self.slot.load()
    }

    /// Publishes a snapshot directly, bypassing the refresh cycle.
    pub fn replace_snapshot(&self, snapshot: MeterSnapshot) {
        self.slot.store(snapshot);
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state(), CacheState::Running { .. })
    }

    /// Starts the periodic refresh task. Does nothing if already running.
    pub fn start(&self) {
        let mut state = self.state();
        let cycle = match std::mem::replace(&mut *state, CacheState::Lost) {
            CacheState::Idle(cycle) => cycle,
            other => {
                if matches!(other, CacheState::Lost) {
                    warn!("Meter cache cannot be restarted, refresh state was lost");
                }
                *state = other;
                return;
            }
        };
        let token = CancellationToken::new();
        let handle = tokio::spawn(cycle.run(token.clone()));
        *state = CacheState::Running { token, handle };
        info!("Meter cache started");
    }

    /// Signals the refresh task to stop and waits for it, bounded by [`STOP_TIMEOUT`].
    pub async fn stop(&self) {
        let (token, handle) = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, CacheState::Lost) {
                CacheState::Running { token, handle } => (token, handle),
                other => {
                    *state = other;
                    return;
                }
            }
        };
        token.cancel();
        let abort = handle.abort_handle();
        match timeout(STOP_TIMEOUT, handle).await {
            Ok(Ok(cycle)) => {
                *self.state() = CacheState::Idle(Box::new(cycle));
                info!("Meter cache stopped");
            }
            Ok(Err(e)) => error!(error = %e, "Meter cache task failed"),
            Err(_) => {
                abort.abort();
                warn!("Meter cache did not stop in time, task aborted");
            }
        }
    }
}

/// State private to the refresh task.
struct RefreshCycle {
    source: Arc<dyn ReadingSource>,
    entities: EntityMapping,
    discovery: Option<Arc<dyn EntityDiscovery>>,
    poll_interval: Duration,
    /// Last `last_updated` value seen per power entity
    last_seen: HashMap<String, Option<String>>,
    discovery_attempted: bool,
    slot: SnapshotSlot,
}

impl RefreshCycle {
    async fn run(mut self: Box<Self>, token: CancellationToken) -> RefreshCycle {
        info!(interval = ?self.poll_interval, "Starting meter refresh loop");
        let mut last_discovery: Option<Instant> = None;

        while !token.is_cancelled() {
            if self.needs_discovery()
                && last_discovery.map_or(true, |t| t.elapsed() >= DISCOVERY_RETRY_INTERVAL)
            {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = self.run_discovery() => {}
                }
                last_discovery = Some(Instant::now());
            }

            // A hung upstream must not hold up stop()
            tokio::select! {
                _ = token.cancelled() => break,
                res = timeout(REFRESH_CYCLE_TIMEOUT, self.refresh()) => {
                    if res.is_err() {
                        error!(timeout = ?REFRESH_CYCLE_TIMEOUT, "Meter refresh cycle timed out");
                        self.invalidate_if_stale();
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(self.poll_interval) => {}
            }
        }

        info!("Meter refresh loop exiting");
        *self
    }

    fn needs_discovery(&self) -> bool {
        self.discovery.is_some() && (!self.discovery_attempted || !self.entities.has_power_entity())
    }

    async fn run_discovery(&mut self) {
        let Some(discovery) = self.discovery.clone() else {
            return;
        };
        self.discovery_attempted = true;
        info!("Running DSMR entity auto-discovery");
        match discovery.discover().await {
            Ok(Some(mapping)) => {
                info!(three_phase = mapping.is_three_phase(), "Using discovered entities");
                self.entities = mapping;
                self.last_seen.clear();
            }
            Ok(None) => warn!("Auto-discovery found no power entities"),
            Err(e) => error!(error = %e, "Auto-discovery failed"),
        }
    }

    fn invalidate_if_stale(&self) {
        let mut snapshot = self.slot.lock();
        if snapshot.is_stale() {
            snapshot.is_valid = false;
        }
    }

    /// One refresh: read everything, derive, publish.
    async fn refresh(&mut self) {
        let mut next = MeterSnapshot {
            timestamp: Some(SystemTime::now()),
            ..Default::default()
        };
        let has_power_entities = self.entities.has_power_entity();
        let source = self.source.as_ref();

        let any_changed = match &self.entities.layout {
            PowerLayout::ThreePhase(three) => {
                let a = fetch_phase(source, &mut self.last_seen, &three.phase_a, &mut next.phase_a)
                    .await;
                let b = fetch_phase(source, &mut self.last_seen, &three.phase_b, &mut next.phase_b)
                    .await;
                let c = fetch_phase(source, &mut self.last_seen, &three.phase_c, &mut next.phase_c)
                    .await;
                a || b || c
            }
            PowerLayout::SinglePhase(single) => {
                let entities = PhaseEntities {
                    power: single.power.clone(),
                    power_returned: single.power_returned.clone(),
                    ..Default::default()
                };
                fetch_phase(source, &mut self.last_seen, &entities, &mut next.phase_a).await
            }
        };

        if !has_power_entities {
            warn!("No power entities configured, polling every cycle");
        } else if !any_changed && source.is_connected() {
            let mut current = self.slot.lock();
            if current.is_valid {
                // Meter has not reported a new sample; keep the data but stay fresh
                current.timestamp = next.timestamp;
                debug!("Skipping refresh, no power entity changed");
                return;
            }
        }

        let totals = &self.entities.totals;
        next.total_energy = source
            .read_value(&totals.energy_delivered)
            .await
            .unwrap_or(0.0);
        next.total_energy_returned = source
            .read_value(&totals.energy_returned)
            .await
            .unwrap_or(0.0);
        if next.total_energy == 0.0 {
            next.total_energy = sum_tariffs(
                source,
                &totals.energy_delivered_tariff_1,
                &totals.energy_delivered_tariff_2,
            )
            .await;
        }
        if next.total_energy_returned == 0.0 {
            next.total_energy_returned = sum_tariffs(
                source,
                &totals.energy_returned_tariff_1,
                &totals.energy_returned_tariff_2,
            )
            .await;
        }

        next.calculate_derived();
        next.is_valid = source.is_connected();

        debug!(
            total_power = next.total_power(),
            phase_a_power = next.phase_a.active_power(),
            phase_b_power = next.phase_b.active_power(),
            phase_c_power = next.phase_c.active_power(),
            valid = next.is_valid,
            "Meter data updated"
        );
        self.slot.store(next);
    }
}

async fn sum_tariffs(source: &dyn ReadingSource, tariff_1: &str, tariff_2: &str) -> f64 {
    source.read_value(tariff_1).await.unwrap_or(0.0) + source.read_value(tariff_2).await.unwrap_or(0.0)
}

/// Reads a power entity together with its timestamp.
/// Returns the value and whether the timestamp moved since the last cycle.
async fn fetch_power(
    source: &dyn ReadingSource,
    last_seen: &mut HashMap<String, Option<String>>,
    entity_id: &str,
) -> (Option<f64>, bool) {
    if entity_id.is_empty() {
        return (None, false);
    }
    let Some(reading) = source.read_entity(entity_id).await else {
        return (None, false);
    };
    let changed = last_seen.get(entity_id) != Some(&reading.last_updated);
    if changed {
        last_seen.insert(entity_id.to_string(), reading.last_updated);
    }
    (Some(reading.value), changed)
}

/// Fills one phase. Missing entities leave the defaults in place.
async fn fetch_phase(
    source: &dyn ReadingSource,
    last_seen: &mut HashMap<String, Option<String>>,
    entities: &PhaseEntities,
    phase: &mut PhaseReading,
) -> bool {
    if let Some(voltage) = source.read_value(&entities.voltage).await {
        phase.voltage = voltage;
    }
    if let Some(current) = source.read_value(&entities.current).await {
        phase.current = current;
    }

    let (power, mut changed) = fetch_power(source, last_seen, &entities.power).await;
    if let Some(power) = power {
        phase.set_net_power(power);
    }

    // A negative consumption reading already filled the export side
    if phase.power_returned == 0.0 {
        let (returned, returned_changed) =
            fetch_power(source, last_seen, &entities.power_returned).await;
        if let Some(returned) = returned {
            phase.power_returned = returned;
        }
        changed |= returned_changed;
    }
    changed
}
