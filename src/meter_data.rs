use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Age after which a snapshot is no longer trusted, regardless of validity.
pub const DATA_STALE_TIMEOUT: Duration = Duration::from_secs(120);

pub const DEFAULT_VOLTAGE: f64 = 230.0;
pub const DEFAULT_FREQUENCY: f64 = 50.0;

/// One of the three measurement channels of the meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    A,
    B,
    C,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::A, Phase::B, Phase::C];

    /// Lower case prefix used in the JSON status field names (`a_current`, ...)
    pub fn prefix(self) -> &'static str {
        match self {
            Phase::A => "a",
            Phase::B => "b",
            Phase::C => "c",
        }
    }
}

/// Instantaneous state of a single phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseReading {
    pub voltage: f64,
    pub current: f64,
    /// Consumption component, never negative
    pub power: f64,
    /// Export component, never negative
    pub power_returned: f64,
    /// Signed, follows the direction of the active power
    pub apparent_power: f64,
    pub power_factor: f64,
    pub frequency: f64,
    pub energy_total: f64,
    pub energy_returned_total: f64,
}

impl Default for PhaseReading {
    fn default() -> Self {
        Self {
            voltage: DEFAULT_VOLTAGE,
            current: 0.0,
            power: 0.0,
            power_returned: 0.0,
            apparent_power: 0.0,
            power_factor: 1.0,
            frequency: DEFAULT_FREQUENCY,
            energy_total: 0.0,
            energy_returned_total: 0.0,
        }
    }
}

impl PhaseReading {
    /// Net power: positive while consuming, negative while exporting.
    pub fn active_power(&self) -> f64 {
        self.power - self.power_returned
    }

    /// Fills in apparent power and power factor from the primary readings.
    ///
    /// An apparent power that was already populated (from an upstream sensor)
    /// is left alone. Calling this twice on the same inputs gives the same result.
    pub fn calculate_derived(&mut self) {
        let active = self.active_power();
        if self.apparent_power == 0.0 && self.voltage > 0.0 {
            let magnitude = self.voltage * self.current.abs();
            self.apparent_power = if active < 0.0 { -magnitude } else { magnitude };
        }

        if self.apparent_power != 0.0 {
            self.power_factor = (active.abs() / self.apparent_power.abs()).min(1.0);
        }
    }

    /// Splits a signed net power reading into its consumption and export parts.
    pub fn set_net_power(&mut self, power: f64) {
        if power >= 0.0 {
            self.power = power;
        } else {
            self.power_returned = power.abs();
        }
    }
}

/// Complete state of the meter at one instant.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeterSnapshot {
    pub phase_a: PhaseReading,
    pub phase_b: PhaseReading,
    pub phase_c: PhaseReading,
    /// Wh
    pub total_energy: f64,
    /// Wh
    pub total_energy_returned: f64,
    pub timestamp: Option<SystemTime>,
    /// Whether the refresh that produced this snapshot reached the upstream source
    pub is_valid: bool,
}

impl MeterSnapshot {
    pub fn phase(&self, phase: Phase) -> &PhaseReading {
        match phase {
            Phase::A => &self.phase_a,
            Phase::B => &self.phase_b,
            Phase::C => &self.phase_c,
        }
    }

    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseReading {
        match phase {
            Phase::A => &mut self.phase_a,
            Phase::B => &mut self.phase_b,
            Phase::C => &mut self.phase_c,
        }
    }

    pub fn phases(&self) -> [&PhaseReading; 3] {
        [&self.phase_a, &self.phase_b, &self.phase_c]
    }

    pub fn total_power(&self) -> f64 {
        self.phases().iter().map(|p| p.active_power()).sum()
    }

    pub fn total_current(&self) -> f64 {
        self.phases().iter().map(|p| p.current).sum()
    }

    /// Signed sum, export phases reduce the total.
    pub fn total_apparent_power(&self) -> f64 {
        self.phases().iter().map(|p| p.apparent_power).sum()
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_after(DATA_STALE_TIMEOUT)
    }

    pub fn is_stale_after(&self, timeout: Duration) -> bool {
        match self.timestamp {
            Some(ts) => SystemTime::now()
                .duration_since(ts)
                .map(|age| age > timeout)
                .unwrap_or(false),
            None => false,
        }
    }

    /// True when the data may be shown to consumers.
    pub fn is_usable(&self) -> bool {
        self.is_valid && !self.is_stale()
    }

    pub fn calculate_derived(&mut self) {
        self.phase_a.calculate_derived();
        self.phase_b.calculate_derived();
        self.phase_c.calculate_derived();
    }

    /// Capture time in whole unix seconds, or the current time when unset.
    pub fn unix_timestamp(&self) -> u32 {
        unix_seconds(self.timestamp.unwrap_or_else(SystemTime::now))
    }
}

pub fn unix_seconds(time: SystemTime) -> u32 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_defaults() {
        let phase = PhaseReading::default();
        assert_eq!(phase.voltage, 230.0);
        assert_eq!(phase.current, 0.0);
        assert_eq!(phase.power_factor, 1.0);
        assert_eq!(phase.frequency, 50.0);
        assert_eq!(phase.active_power(), 0.0);
    }

    #[test]
    fn test_active_power_consumption_only() {
        let phase = PhaseReading {
            power: 1500.0,
            ..Default::default()
        };
        assert_eq!(phase.active_power(), 1500.0);
    }

    #[test]
    fn test_active_power_export_only() {
        let phase = PhaseReading {
            power_returned: 750.0,
            ..Default::default()
        };
        assert_eq!(phase.active_power(), -750.0);
    }

    #[test]
    fn test_calculate_derived_apparent_power() {
        let mut phase = PhaseReading {
            voltage: 230.0,
            current: 5.0,
            power: 1000.0,
            ..Default::default()
        };
        phase.calculate_derived();
        assert_eq!(phase.apparent_power, 1150.0);
        assert!((phase.power_factor - 1000.0 / 1150.0).abs() < 1e-9);
    }

    #[test]
    fn test_calculate_derived_apparent_power_follows_export_sign() {
        let mut phase = PhaseReading {
            voltage: 230.0,
            current: -2.0,
            power_returned: 400.0,
            ..Default::default()
        };
        phase.calculate_derived();
        assert_eq!(phase.apparent_power, -460.0);
        assert!((phase.power_factor - 400.0 / 460.0).abs() < 1e-9);
    }

    #[test]
    fn test_calculate_derived_keeps_upstream_apparent_power() {
        let mut phase = PhaseReading {
            voltage: 230.0,
            current: 5.0,
            power: 1000.0,
            apparent_power: 1100.0,
            ..Default::default()
        };
        phase.calculate_derived();
        assert_eq!(phase.apparent_power, 1100.0);
    }

    #[test]
    fn test_calculate_derived_is_idempotent() {
        let mut phase = PhaseReading {
            current: 3.0,
            power: 600.0,
            ..Default::default()
        };
        phase.calculate_derived();
        let first = phase.clone();
        phase.calculate_derived();
        assert_eq!(phase, first);
    }

    #[test]
    fn test_power_factor_is_capped() {
        let mut phase = PhaseReading {
            voltage: 230.0,
            current: 1.0,
            power: 1000.0,
            ..Default::default()
        };
        phase.calculate_derived();
        assert_eq!(phase.power_factor, 1.0);
    }

    #[test]
    fn test_zero_apparent_power_keeps_power_factor() {
        let mut phase = PhaseReading {
            voltage: 0.0,
            power: 100.0,
            ..Default::default()
        };
        phase.calculate_derived();
        assert_eq!(phase.apparent_power, 0.0);
        assert_eq!(phase.power_factor, 1.0);
    }

    #[test]
    fn test_set_net_power_splits_by_sign() {
        let mut phase = PhaseReading::default();
        phase.set_net_power(-320.0);
        assert_eq!(phase.power, 0.0);
        assert_eq!(phase.power_returned, 320.0);

        let mut phase = PhaseReading::default();
        phase.set_net_power(0.0);
        assert_eq!(phase.power, 0.0);
        assert_eq!(phase.power_returned, 0.0);
    }

    #[test]
    fn test_snapshot_totals() {
        let mut snapshot = MeterSnapshot::default();
        snapshot.phase_a.power = 1000.0;
        snapshot.phase_b.power = 800.0;
        snapshot.phase_c.power = 600.0;
        snapshot.phase_c.power_returned = 200.0;
        snapshot.phase_a.current = 4.0;
        snapshot.phase_b.current = 3.5;
        snapshot.phase_c.current = 1.5;
        assert_eq!(snapshot.total_power(), 2200.0);
        assert_eq!(snapshot.total_current(), 9.0);
    }

    #[test]
    fn test_total_apparent_power_is_signed_sum() {
        let mut snapshot = MeterSnapshot::default();
        snapshot.phase_a.apparent_power = 1000.0;
        snapshot.phase_b.apparent_power = -400.0;
        snapshot.phase_c.apparent_power = 100.0;
        assert_eq!(snapshot.total_apparent_power(), 700.0);
    }

    #[test]
    fn test_staleness() {
        let mut snapshot = MeterSnapshot::default();
        assert!(!snapshot.is_stale(), "unset timestamp is never stale");

        snapshot.timestamp = Some(SystemTime::now());
        assert!(!snapshot.is_stale());

        snapshot.timestamp = Some(SystemTime::now() - Duration::from_secs(121));
        assert!(snapshot.is_stale());
        assert!(!snapshot.is_stale_after(Duration::from_secs(300)));
    }

    #[test]
    fn test_validity_and_staleness_are_independent() {
        let snapshot = MeterSnapshot {
            is_valid: true,
            timestamp: Some(SystemTime::now() - Duration::from_secs(600)),
            ..Default::default()
        };
        assert!(snapshot.is_valid);
        assert!(snapshot.is_stale());
        assert!(!snapshot.is_usable());

        let snapshot = MeterSnapshot {
            is_valid: false,
            timestamp: Some(SystemTime::now()),
            ..Default::default()
        };
        assert!(!snapshot.is_stale());
        assert!(!snapshot.is_usable());
    }
}
