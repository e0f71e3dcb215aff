use serde_derive::{Deserialize, Serialize};

/// Upstream entity ids feeding one phase. Empty strings mean "not available".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseEntities {
    pub voltage: String,
    pub current: String,
    pub power: String,
    pub power_returned: String,
}

impl PhaseEntities {
    pub fn has_power(&self) -> bool {
        !self.power.is_empty() || !self.power_returned.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinglePhaseEntities {
    pub power: String,
    pub power_returned: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreePhaseEntities {
    pub phase_a: PhaseEntities,
    pub phase_b: PhaseEntities,
    pub phase_c: PhaseEntities,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TotalsEntities {
    pub energy_delivered: String,
    pub energy_returned: String,
    pub energy_delivered_tariff_1: String,
    pub energy_delivered_tariff_2: String,
    pub energy_returned_tariff_1: String,
    pub energy_returned_tariff_2: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PowerLayout {
    /// One signed net power reading, reported on phase A
    SinglePhase(SinglePhaseEntities),
    ThreePhase(ThreePhaseEntities),
}

/// Fully resolved set of entity ids the refresh cycle reads.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMapping {
    pub layout: PowerLayout,
    pub totals: TotalsEntities,
}

impl Default for EntityMapping {
    fn default() -> Self {
        Self {
            layout: PowerLayout::SinglePhase(SinglePhaseEntities::default()),
            totals: TotalsEntities::default(),
        }
    }
}

impl EntityMapping {
    pub fn is_three_phase(&self) -> bool {
        matches!(self.layout, PowerLayout::ThreePhase(_))
    }

    /// Whether at least one power-bearing entity is configured.
    pub fn has_power_entity(&self) -> bool {
        match &self.layout {
            PowerLayout::SinglePhase(single) => {
                !single.power.is_empty() || !single.power_returned.is_empty()
            }
            PowerLayout::ThreePhase(three) => {
                three.phase_a.has_power() || three.phase_b.has_power() || three.phase_c.has_power()
            }
        }
    }
}
