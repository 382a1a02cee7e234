use serde::{Deserialize, Serialize};

use crate::{
    inverter::{Inverter, InverterSnapshot},
    prelude::*,
    quantity::{Quantity, power::Kilowatts},
};

/// Cross-inverter balancing thresholds. The balancer only ever zeroes one
/// side's rate register; the next executor tick restores nominal rates, so
/// every write here is transient by construction.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceSettings {
    pub charge: bool,
    pub discharge: bool,
    pub crosscharge: bool,

    /// Percent state-of-charge spread before balancing a charge.
    pub threshold_charge: f64,

    /// Percent state-of-charge spread before balancing a discharge.
    pub threshold_discharge: f64,
}

impl Default for BalanceSettings {
    fn default() -> Self {
        Self {
            charge: true,
            discharge: true,
            crosscharge: true,
            threshold_charge: 1.0,
            threshold_discharge: 1.0,
        }
    }
}

/// Headroom the donor inverter must keep over its reserve, in percent.
const RESERVE_HEADROOM_PERCENT: f64 = 4.0;

/// Battery power below this is noise, not worth balancing.
const POWER_SIGNIFICANT: Kilowatts = Quantity(0.05);

/// Slack subtracted when judging whether the remaining inverters can carry
/// the house load alone.
const HOUSE_MARGIN: Kilowatts = Quantity(0.2);

/// One balancing pass. Runs between planning ticks, never concurrently with
/// the executor on the same inverter.
#[allow(clippy::too_many_lines)]
pub async fn balance_inverters(
    inverters: &mut [&mut dyn Inverter],
    settings: &BalanceSettings,
) -> u32 {
    if inverters.len() < 2 {
        return 0;
    }
    if inverters.iter().any(|inverter| inverter.in_calibration()) {
        info!("an inverter is calibrating, not balancing");
        return 0;
    }

    let snapshots: Vec<InverterSnapshot> =
        inverters.iter().map(|inverter| inverter.snapshot()).collect();

    let out_of_balance =
        snapshots.iter().any(|snapshot| snapshot.soc_percent != snapshots[0].soc_percent);

    let total_battery_power: Kilowatts =
        snapshots.iter().map(|snapshot| snapshot.battery_power).sum();
    let total_pv_power: Kilowatts = snapshots.iter().map(|snapshot| snapshot.pv_power).sum();
    let total_charge_rates: Kilowatts =
        snapshots.iter().map(|snapshot| snapshot.charge_rate_now).sum();
    let total_discharge_rates: Kilowatts =
        snapshots.iter().map(|snapshot| snapshot.discharge_rate_now).sum();

    let during_discharge = total_battery_power >= Kilowatts::ZERO;
    let during_charge = !during_discharge;

    let soc_floor =
        snapshots.iter().map(|snapshot| snapshot.soc_percent).fold(f64::INFINITY, f64::min);
    let soc_ceiling =
        snapshots.iter().map(|snapshot| snapshot.soc_percent).fold(f64::NEG_INFINITY, f64::max);

    let soc_low: Vec<bool> = snapshots
        .iter()
        .map(|snapshot| {
            snapshot.soc_percent < soc_ceiling
                && (soc_ceiling - snapshot.soc_percent) >= settings.threshold_discharge
        })
        .collect();
    let soc_high: Vec<bool> = snapshots
        .iter()
        .map(|snapshot| {
            snapshot.soc_percent > soc_floor
                && (snapshot.soc_percent - soc_floor) >= settings.threshold_charge
        })
        .collect();
    let above_reserve: Vec<bool> = snapshots
        .iter()
        .map(|snapshot| {
            (snapshot.soc_percent - snapshot.reserve_current_percent) >= RESERVE_HEADROOM_PERCENT
        })
        .collect();
    let below_full: Vec<bool> =
        snapshots.iter().map(|snapshot| snapshot.soc_percent < 100.0).collect();
    let can_power_house: Vec<bool> = snapshots
        .iter()
        .map(|snapshot| {
            (total_discharge_rates - snapshot.discharge_rate_now - HOUSE_MARGIN)
                >= total_battery_power
        })
        .collect();
    let can_store_pv: Vec<bool> = snapshots
        .iter()
        .map(|snapshot| total_pv_power <= (total_charge_rates - snapshot.charge_rate_now))
        .collect();
    let power_enough_discharge: Vec<bool> =
        snapshots.iter().map(|snapshot| snapshot.battery_power >= POWER_SIGNIFICANT).collect();
    let power_enough_charge: Vec<bool> =
        snapshots.iter().map(|snapshot| snapshot.battery_power <= -POWER_SIGNIFICANT).collect();

    let count = inverters.len();
    let mut held_discharge = vec![false; count];
    let mut held_charge = vec![false; count];
    let mut failures = 0;

    for this in 0..count {
        let other = (this + 1) % count;
        let snapshot = &snapshots[this];
        if settings.discharge
            && total_discharge_rates > Kilowatts::ZERO
            && out_of_balance
            && during_discharge
            && soc_low[this]
            && above_reserve[other]
            && can_power_house[this]
            && (power_enough_discharge[this] || snapshot.discharge_rate_now == Kilowatts::ZERO)
        {
            info!(id = inverters[this].id(), "low during discharge, holding its discharge");
            held_discharge[this] = true;
            note(&mut failures, inverters[this].adjust_discharge_rate(0).await);
        } else if settings.charge
            && total_charge_rates > Kilowatts::ZERO
            && out_of_balance
            && during_charge
            && soc_high[this]
            && below_full[other]
            && can_store_pv[this]
            && (power_enough_charge[this] || snapshot.charge_rate_now == Kilowatts::ZERO)
        {
            info!(id = inverters[this].id(), "high during charge, holding its charge");
            held_charge[this] = true;
            note(&mut failures, inverters[this].adjust_charge_rate(0).await);
        } else if settings.crosscharge
            && during_discharge
            && total_discharge_rates > Kilowatts::ZERO
            && power_enough_charge[this]
        {
            info!(id = inverters[this].id(), "cross-charging during discharge");
            if soc_low[this] && can_power_house[other] {
                held_discharge[this] = true;
                note(&mut failures, inverters[this].adjust_discharge_rate(0).await);
            } else {
                held_charge[this] = true;
                note(&mut failures, inverters[this].adjust_charge_rate(0).await);
            }
        } else if settings.crosscharge
            && during_charge
            && total_charge_rates > Kilowatts::ZERO
            && power_enough_discharge[this]
        {
            info!(id = inverters[this].id(), "cross-discharging during charge");
            held_discharge[this] = true;
            note(&mut failures, inverters[this].adjust_discharge_rate(0).await);
        }
    }

    // Balance restored: bring any zeroed register back to nominal.
    for index in 0..count {
        let snapshot = &snapshots[index];
        if !held_charge[index]
            && total_charge_rates != Kilowatts::ZERO
            && snapshot.charge_rate_now == Kilowatts::ZERO
        {
            note(
                &mut failures,
                inverters[index].adjust_charge_rate(snapshot.rate_max_charge.into_watts()).await,
            );
        }
        if !held_discharge[index]
            && total_discharge_rates != Kilowatts::ZERO
            && snapshot.discharge_rate_now == Kilowatts::ZERO
        {
            note(
                &mut failures,
                inverters[index]
                    .adjust_discharge_rate(snapshot.rate_max_discharge.into_watts())
                    .await,
            );
        }
    }

    let writes: u32 = inverters.iter_mut().map(|inverter| inverter.take_register_writes()).sum();
    debug!(writes, failures, "balance pass complete");
    writes
}

fn note(failures: &mut u32, result: Result<(), crate::core::error::InverterError>) {
    if let Err(error) = result {
        warn!(%error, "inverter call failed during balancing");
        *failures += 1;
    }
}
