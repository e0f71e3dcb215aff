//! Status documents shared by the UDP and HTTP surfaces.
//!
//! Both surfaces render the same snapshot through these builders so the
//! fail-safe handling lives in one place: an invalid or stale snapshot is
//! reported as all zeros plus a `power_meter_failure` error.

use crate::meter_data::{MeterSnapshot, Phase};
use serde_json::{json, Map, Value};

pub const POWER_METER_FAILURE: &str = "power_meter_failure";

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// `EM.GetStatus` result for component `em_id`.
pub fn build_em_status(snapshot: &MeterSnapshot, em_id: i64) -> Value {
    let usable = snapshot.is_usable();
    let shown = |value: f64, decimals: i32| {
        if usable {
            round_to(value, decimals)
        } else {
            0.0
        }
    };

    let mut status = Map::new();
    status.insert("id".into(), json!(em_id));
    for phase in Phase::ALL {
        let reading = snapshot.phase(phase);
        let x = phase.prefix();
        status.insert(format!("{x}_current"), json!(shown(reading.current, 3)));
        status.insert(format!("{x}_voltage"), json!(shown(reading.voltage, 1)));
        status.insert(format!("{x}_act_power"), json!(shown(reading.active_power(), 1)));
        status.insert(format!("{x}_aprt_power"), json!(shown(reading.apparent_power, 1)));
        status.insert(format!("{x}_pf"), json!(shown(reading.power_factor, 2)));
        status.insert(format!("{x}_freq"), json!(shown(reading.frequency, 1)));
        status.insert(format!("{x}_errors"), json!([]));
    }
    status.insert("n_current".into(), Value::Null);
    status.insert("n_errors".into(), json!([]));
    status.insert("total_current".into(), json!(shown(snapshot.total_current(), 3)));
    status.insert("total_act_power".into(), json!(shown(snapshot.total_power(), 1)));
    status.insert(
        "total_aprt_power".into(),
        json!(shown(snapshot.total_apparent_power(), 1)),
    );
    status.insert("user_calibrated_phase".into(), json!([]));
    let errors: Vec<&str> = if usable {
        vec![]
    } else {
        vec![POWER_METER_FAILURE]
    };
    status.insert("errors".into(), json!(errors));
    Value::Object(status)
}

/// `EMData.GetStatus` result, energies in Wh.
pub fn build_emdata_status(snapshot: &MeterSnapshot, em_id: i64) -> Value {
    let usable = snapshot.is_usable();
    let shown = |value: f64| if usable { round_to(value, 2) } else { 0.0 };

    let mut status = Map::new();
    status.insert("id".into(), json!(em_id));
    for phase in Phase::ALL {
        let reading = snapshot.phase(phase);
        let x = phase.prefix();
        status.insert(
            format!("{x}_total_act_energy"),
            json!(shown(reading.energy_total)),
        );
        status.insert(
            format!("{x}_total_act_ret_energy"),
            json!(shown(reading.energy_returned_total)),
        );
    }
    status.insert("total_act".into(), json!(shown(snapshot.total_energy)));
    status.insert(
        "total_act_ret".into(),
        json!(shown(snapshot.total_energy_returned)),
    );
    Value::Object(status)
}
