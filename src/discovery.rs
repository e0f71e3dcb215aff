//! Guessing which Home Assistant sensors belong to the DSMR smart meter.
//!
//! Entity ids are matched against naming patterns used by the Home Assistant
//! DSMR integration (NL, BE and LU meters). For every logical quantity the
//! patterns are tried in order and the first one matching any sensor wins.

use crate::entities::{
    EntityMapping, PhaseEntities, PowerLayout, SinglePhaseEntities, ThreePhaseEntities,
    TotalsEntities,
};
use crate::error::Result;
use crate::home_assistant::HomeAssistantAPI;
use async_trait::async_trait;
use regex::RegexBuilder;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[async_trait]
pub trait EntityDiscovery: Send + Sync {
    /// Returns `None` when no power entity could be identified.
    async fn discover(&self) -> Result<Option<EntityMapping>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Quantity {
    PowerConsumption,
    PowerProduction,
    PowerConsumptionL1,
    PowerConsumptionL2,
    PowerConsumptionL3,
    PowerProductionL1,
    PowerProductionL2,
    PowerProductionL3,
    VoltageL1,
    VoltageL2,
    VoltageL3,
    CurrentL1,
    CurrentL2,
    CurrentL3,
    EnergyConsumptionTotal,
    EnergyProductionTotal,
    EnergyConsumptionTariff1,
    EnergyConsumptionTariff2,
    EnergyProductionTariff1,
    EnergyProductionTariff2,
}

const PATTERNS: &[(Quantity, &[&str])] = &[
    (
        Quantity::PowerConsumption,
        &[
            r"sensor\..*power_consumption$",
            r"sensor\..*electricity.*power_consumption$",
            r"sensor\..*current_electricity_usage$",
            r"sensor\..*power_delivered$",
            r"sensor\.dsmr.*power$",
            r"sensor\..*elektriciteit.*vermogen$",
            r"sensor\..*fluvius.*consumption$",
            r"sensor\..*electricite.*puissance$",
        ],
    ),
    (
        Quantity::PowerProduction,
        &[
            r"sensor\..*power_production$",
            r"sensor\..*electricity.*power_production$",
            r"sensor\..*current_electricity_delivery$",
            r"sensor\..*power_returned$",
            r"sensor\..*teruglevering$",
            r"sensor\..*fluvius.*production$",
            r"sensor\..*electricite.*injection$",
        ],
    ),
    (
        Quantity::PowerConsumptionL1,
        &[
            r"sensor\..*power.*l1_positive$",
            r"sensor\..*instantaneous_active_power_l1_positive$",
            r"sensor\..*power_delivered_l1$",
            r"sensor\..*power_consumption.*l1$",
            r"sensor\..*active_power_l1$",
            r"sensor\..*vermogen.*l1$",
        ],
    ),
    (
        Quantity::PowerConsumptionL2,
        &[
            r"sensor\..*power.*l2_positive$",
            r"sensor\..*instantaneous_active_power_l2_positive$",
            r"sensor\..*power_delivered_l2$",
            r"sensor\..*power_consumption.*l2$",
            r"sensor\..*active_power_l2$",
            r"sensor\..*vermogen.*l2$",
        ],
    ),
    (
        Quantity::PowerConsumptionL3,
        &[
            r"sensor\..*power.*l3_positive$",
            r"sensor\..*instantaneous_active_power_l3_positive$",
            r"sensor\..*power_delivered_l3$",
            r"sensor\..*power_consumption.*l3$",
            r"sensor\..*active_power_l3$",
            r"sensor\..*vermogen.*l3$",
        ],
    ),
    (
        Quantity::PowerProductionL1,
        &[
            r"sensor\..*power.*l1_negative$",
            r"sensor\..*instantaneous_active_power_l1_negative$",
            r"sensor\..*power_returned_l1$",
            r"sensor\..*power_production.*l1$",
            r"sensor\..*teruglevering.*l1$",
        ],
    ),
    (
        Quantity::PowerProductionL2,
        &[
            r"sensor\..*power.*l2_negative$",
            r"sensor\..*instantaneous_active_power_l2_negative$",
            r"sensor\..*power_returned_l2$",
            r"sensor\..*power_production.*l2$",
            r"sensor\..*teruglevering.*l2$",
        ],
    ),
    (
        Quantity::PowerProductionL3,
        &[
            r"sensor\..*power.*l3_negative$",
            r"sensor\..*instantaneous_active_power_l3_negative$",
            r"sensor\..*power_returned_l3$",
            r"sensor\..*power_production.*l3$",
            r"sensor\..*teruglevering.*l3$",
        ],
    ),
    (
        Quantity::VoltageL1,
        &[
            r"sensor\..*voltage.*l1$",
            r"sensor\..*instantaneous_voltage_l1$",
            r"sensor\..*spanning.*l1$",
        ],
    ),
    (
        Quantity::VoltageL2,
        &[
            r"sensor\..*voltage.*l2$",
            r"sensor\..*instantaneous_voltage_l2$",
            r"sensor\..*spanning.*l2$",
        ],
    ),
    (
        Quantity::VoltageL3,
        &[
            r"sensor\..*voltage.*l3$",
            r"sensor\..*instantaneous_voltage_l3$",
            r"sensor\..*spanning.*l3$",
        ],
    ),
    (
        Quantity::CurrentL1,
        &[
            r"sensor\..*current.*l1$",
            r"sensor\..*instantaneous_current_l1$",
            r"sensor\..*stroom.*l1$",
            r"sensor\..*courant.*l1$",
        ],
    ),
    (
        Quantity::CurrentL2,
        &[
            r"sensor\..*current.*l2$",
            r"sensor\..*instantaneous_current_l2$",
            r"sensor\..*stroom.*l2$",
            r"sensor\..*courant.*l2$",
        ],
    ),
    (
        Quantity::CurrentL3,
        &[
            r"sensor\..*current.*l3$",
            r"sensor\..*instantaneous_current_l3$",
            r"sensor\..*stroom.*l3$",
            r"sensor\..*courant.*l3$",
        ],
    ),
    (
        Quantity::EnergyConsumptionTotal,
        &[
            r"sensor\..*energy_consumption.*total$",
            r"sensor\..*total.*energy.*consumption$",
            r"sensor\..*total_energy_import$",
            r"sensor\..*energie.*verbruik.*totaal$",
        ],
    ),
    (
        Quantity::EnergyProductionTotal,
        &[
            r"sensor\..*energy_production.*total$",
            r"sensor\..*energy_returned.*total$",
            r"sensor\..*total.*energy.*returned$",
            r"sensor\..*total_energy_export$",
            r"sensor\..*energie.*teruglevering.*totaal$",
        ],
    ),
    (
        Quantity::EnergyConsumptionTariff1,
        &[
            r"sensor\..*energy_consumption.*tariff.*1$",
            r"sensor\..*electricity_used_tariff_1$",
            r"sensor\..*electricity.*tariff_1$",
            r"sensor\..*energy_delivered.*tariff.*1$",
            r"sensor\..*energie.*dal$",
            r"sensor\..*energie.*tarief.*1$",
        ],
    ),
    (
        Quantity::EnergyConsumptionTariff2,
        &[
            r"sensor\..*energy_consumption.*tariff.*2$",
            r"sensor\..*electricity_used_tariff_2$",
            r"sensor\..*electricity.*tariff_2$",
            r"sensor\..*energy_delivered.*tariff.*2$",
            r"sensor\..*energie.*piek$",
            r"sensor\..*energie.*tarief.*2$",
        ],
    ),
    (
        Quantity::EnergyProductionTariff1,
        &[
            r"sensor\..*energy_production.*tariff.*1$",
            r"sensor\..*electricity_delivered_tariff_1$",
            r"sensor\..*energy_returned.*tariff.*1$",
            r"sensor\..*teruglevering.*dal$",
            r"sensor\..*teruglevering.*tarief.*1$",
        ],
    ),
    (
        Quantity::EnergyProductionTariff2,
        &[
            r"sensor\..*energy_production.*tariff.*2$",
            r"sensor\..*electricity_delivered_tariff_2$",
            r"sensor\..*energy_returned.*tariff.*2$",
            r"sensor\..*teruglevering.*piek$",
            r"sensor\..*teruglevering.*tarief.*2$",
        ],
    ),
];

fn match_entities(entity_ids: &[&str]) -> HashMap<Quantity, String> {
    let mut matched = HashMap::new();
    for (quantity, patterns) in PATTERNS {
        for pattern in patterns.iter() {
            let regex = match RegexBuilder::new(&format!("^{pattern}"))
                .case_insensitive(true)
                .build()
            {
                Ok(regex) => regex,
                Err(e) => {
                    warn!(pattern, error = %e, "Skipping invalid discovery pattern");
                    continue;
                }
            };
            if let Some(entity_id) = entity_ids.iter().find(|id| regex.is_match(id)) {
                matched.insert(*quantity, entity_id.to_string());
                break;
            }
        }
    }
    matched
}

/// Builds an entity mapping from a list of sensor ids.
pub fn mapping_from_entity_ids(entity_ids: &[&str]) -> Option<EntityMapping> {
    let sensors: Vec<&str> = entity_ids
        .iter()
        .copied()
        .filter(|id| id.starts_with("sensor."))
        .collect();
    let matched = match_entities(&sensors);
    for (quantity, entity_id) in &matched {
        debug!(?quantity, entity_id, "Discovered entity");
    }
    let get = |q: Quantity| matched.get(&q).cloned().unwrap_or_default();

    let phase = |voltage, current, power, power_returned| PhaseEntities {
        voltage: get(voltage),
        current: get(current),
        power: get(power),
        power_returned: get(power_returned),
    };
    let three = ThreePhaseEntities {
        phase_a: phase(
            Quantity::VoltageL1,
            Quantity::CurrentL1,
            Quantity::PowerConsumptionL1,
            Quantity::PowerProductionL1,
        ),
        phase_b: phase(
            Quantity::VoltageL2,
            Quantity::CurrentL2,
            Quantity::PowerConsumptionL2,
            Quantity::PowerProductionL2,
        ),
        phase_c: phase(
            Quantity::VoltageL3,
            Quantity::CurrentL3,
            Quantity::PowerConsumptionL3,
            Quantity::PowerProductionL3,
        ),
    };
    let is_three_phase =
        three.phase_a.has_power() || three.phase_b.has_power() || three.phase_c.has_power();

    let layout = if is_three_phase {
        PowerLayout::ThreePhase(three)
    } else {
        PowerLayout::SinglePhase(SinglePhaseEntities {
            power: get(Quantity::PowerConsumption),
            power_returned: get(Quantity::PowerProduction),
        })
    };

    let mapping = EntityMapping {
        layout,
        totals: TotalsEntities {
            energy_delivered: get(Quantity::EnergyConsumptionTotal),
            energy_returned: get(Quantity::EnergyProductionTotal),
            energy_delivered_tariff_1: get(Quantity::EnergyConsumptionTariff1),
            energy_delivered_tariff_2: get(Quantity::EnergyConsumptionTariff2),
            energy_returned_tariff_1: get(Quantity::EnergyProductionTariff1),
            energy_returned_tariff_2: get(Quantity::EnergyProductionTariff2),
        },
    };

    let has_power = match &mapping.layout {
        PowerLayout::SinglePhase(single) => !single.power.is_empty(),
        PowerLayout::ThreePhase(three) => {
            !three.phase_a.power.is_empty()
                || !three.phase_b.power.is_empty()
                || !three.phase_c.power.is_empty()
        }
    };
    if !has_power {
        warn!(
            sensors = sensors.len(),
            "No DSMR power entities discovered, check the Home Assistant DSMR integration"
        );
        return None;
    }
    info!(
        matched = matched.len(),
        three_phase = mapping.is_three_phase(),
        "DSMR entities discovered"
    );
    Some(mapping)
}

/// Discovery against a live Home Assistant instance.
pub struct DsmrDiscovery {
    api: Arc<HomeAssistantAPI>,
}

impl DsmrDiscovery {
    pub fn new(api: Arc<HomeAssistantAPI>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl EntityDiscovery for DsmrDiscovery {
    async fn discover(&self) -> Result<Option<EntityMapping>> {
        let states = self.api.read_all_states().await?;
        let ids: Vec<&str> = states.iter().map(|s| s.entity_id.as_str()).collect();
        info!(entities = ids.len(), "Fetched Home Assistant entity list");
        Ok(mapping_from_entity_ids(&ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HomeAssistantConfig;

    #[test]
    fn test_three_phase_discovery() {
        let ids = [
            "sensor.dsmr_reading_power_delivered_l1",
            "sensor.dsmr_reading_power_delivered_l2",
            "sensor.dsmr_reading_power_delivered_l3",
            "sensor.dsmr_reading_power_returned_l1",
            "sensor.dsmr_reading_current_phase_l2",
            "sensor.dsmr_reading_voltage_phase_l3",
            "sensor.electricity_used_tariff_1",
            "sensor.electricity_used_tariff_2",
            "sensor.electricity_delivered_tariff_1",
            "light.kitchen",
        ];
        let mapping = mapping_from_entity_ids(&ids).unwrap();
        let PowerLayout::ThreePhase(three) = &mapping.layout else {
            panic!("Expected three phase layout");
        };
        assert_eq!(three.phase_a.power, "sensor.dsmr_reading_power_delivered_l1");
        assert_eq!(
            three.phase_a.power_returned,
            "sensor.dsmr_reading_power_returned_l1"
        );
        assert_eq!(three.phase_b.current, "sensor.dsmr_reading_current_phase_l2");
        assert_eq!(three.phase_c.voltage, "sensor.dsmr_reading_voltage_phase_l3");
        assert_eq!(
            mapping.totals.energy_delivered_tariff_1,
            "sensor.electricity_used_tariff_1"
        );
        assert_eq!(
            mapping.totals.energy_returned_tariff_1,
            "sensor.electricity_delivered_tariff_1"
        );
        assert!(mapping.totals.energy_delivered.is_empty());
    }

    #[test]
    fn test_single_phase_discovery() {
        let ids = ["sensor.Power_Consumption", "sensor.power_production"];
        let mapping = mapping_from_entity_ids(&ids).unwrap();
        assert_eq!(
            mapping.layout,
            PowerLayout::SinglePhase(SinglePhaseEntities {
                power: "sensor.Power_Consumption".to_string(),
                power_returned: "sensor.power_production".to_string(),
            })
        );
    }

    #[test]
    fn test_no_power_entities() {
        let ids = ["sensor.outdoor_temperature", "switch.power_consumption"];
        assert!(mapping_from_entity_ids(&ids).is_none());
    }

    #[test]
    fn test_all_patterns_compile() {
        for (_, patterns) in PATTERNS {
            for pattern in patterns.iter() {
                assert!(regex::Regex::new(pattern).is_ok(), "{pattern}");
            }
        }
    }

    #[tokio::test]
    async fn test_discovery_over_http() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/states")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[
                    {"entity_id": "sensor.power_consumption", "state": "120"},
                    {"entity_id": "sensor.energy_consumption_total", "state": "1234.5"}
                ]"#,
            )
            .create_async()
            .await;

        let api = HomeAssistantAPI::new(&HomeAssistantConfig {
            url: server.url(),
            ..Default::default()
        })
        .unwrap();
        let discovery = DsmrDiscovery::new(Arc::new(api));
        let mapping = discovery.discover().await.unwrap().unwrap();
        assert!(!mapping.is_three_phase());
        assert_eq!(
            mapping.totals.energy_delivered,
            "sensor.energy_consumption_total"
        );
    }
}
