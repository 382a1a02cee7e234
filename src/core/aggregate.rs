use crate::{
    inverter::InverterSnapshot,
    quantity::{Quantity, energy::KilowattHours, power::Kilowatts},
};

/// The virtual battery the planner reasons about: the sum of every
/// inverter's capabilities. The executor translates targets back into the
/// per-inverter frame with [`split_target`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Aggregate {
    pub soc: KilowattHours,
    pub soc_max: KilowattHours,
    pub reserve: KilowattHours,
    pub rate_max_charge: Kilowatts,
    pub rate_max_discharge: Kilowatts,
    pub rate_min: Kilowatts,
    pub inverter_limit: Kilowatts,
    pub export_limit: Kilowatts,
    pub charge_rate_now: Kilowatts,
    pub discharge_rate_now: Kilowatts,
    pub battery_power: Kilowatts,
    pub pv_power: Kilowatts,
    pub load_power: Kilowatts,
}

impl Aggregate {
    pub fn collect<'a>(snapshots: impl IntoIterator<Item = &'a InverterSnapshot>) -> Self {
        let mut total = Self::default();
        for snapshot in snapshots {
            total.soc += snapshot.soc;
            total.soc_max += snapshot.soc_max;
            total.reserve += snapshot.reserve;
            total.rate_max_charge += snapshot.rate_max_charge;
            total.rate_max_discharge += snapshot.rate_max_discharge;
            total.rate_min += snapshot.rate_min;
            total.inverter_limit += snapshot.inverter_limit;
            total.export_limit += snapshot.export_limit;
            total.charge_rate_now += snapshot.charge_rate_now;
            total.discharge_rate_now += snapshot.discharge_rate_now;
            total.battery_power += snapshot.battery_power;
            total.pv_power += snapshot.pv_power;
            total.load_power += snapshot.load_power;
        }
        total
    }

    pub fn soc_percent(&self) -> f64 {
        self.soc.percent_of(self.soc_max)
    }

    pub fn reserve_percent(&self) -> f64 {
        self.reserve.percent_of(self.soc_max)
    }
}

/// Split an aggregate-frame target percent into this inverter's own target.
/// The energy still to add is shared in proportion to charge rate, clamped
/// to `[reserve, soc_max]`. Full, empty, and freeze targets pass through.
pub fn split_target(
    aggregate: &Aggregate,
    inverter: &InverterSnapshot,
    target_percent: f64,
    freeze: bool,
) -> f64 {
    if freeze {
        return target_percent;
    }
    if target_percent >= 100.0 {
        return 100.0;
    }
    if target_percent <= 0.0 {
        return 0.0;
    }
    let target_kwh = aggregate.soc_max * (target_percent / 100.0);
    let add_kwh = target_kwh - aggregate.soc;
    let share = if aggregate.rate_max_charge.0 > 0.0 {
        inverter.rate_max_charge.0 / aggregate.rate_max_charge.0
    } else {
        0.0
    };
    let new_soc = (inverter.soc + add_kwh * share).min(inverter.soc_max).max(inverter.reserve);
    new_soc.percent_of(inverter.soc_max)
}
