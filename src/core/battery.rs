use serde::{Deserialize, Serialize};

use crate::{
    core::{
        curve::{PowerCurve, TemperatureCurve, derated_rate},
        window::Window,
    },
    quantity::{Quantity, energy::KilowattHours, power::Kilowatts, time::Hours},
};

/// Where PV enters the system relative to the battery inverter. This decides
/// where the inverter conversion loss applies.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coupling {
    /// PV has its own inverter and arrives as AC.
    #[default]
    Ac,

    /// DC-coupled PV can reach the battery without crossing the AC boundary.
    Hybrid,
}

/// Static battery and inverter properties shared by the simulator and the
/// executor. Immutable once built.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryParameters {
    pub soc_max: KilowattHours,
    pub reserve: KilowattHours,

    /// Steady-state rate caps.
    pub rate_max_charge: Kilowatts,
    pub rate_max_discharge: Kilowatts,

    /// Trickle floor: registers never go below this while "off".
    pub rate_min: Kilowatts,

    pub rate_scaling_charge: f64,
    pub rate_scaling_discharge: f64,

    pub charge_power_curve: PowerCurve,
    pub discharge_power_curve: PowerCurve,
    pub temperature_charge_curve: TemperatureCurve,
    pub temperature_discharge_curve: TemperatureCurve,

    /// Charge efficiency: one external kWh stores this many internal kWh.
    pub loss_charge: f64,

    /// Discharge efficiency: one internal kWh yields this many external kWh.
    pub loss_discharge: f64,

    /// Conversion efficiency of the AC inverter boundary.
    pub inverter_loss: f64,

    /// AC-side hard cap of the inverter.
    pub inverter_limit: Kilowatts,

    /// Grid-export cap.
    pub export_limit: Kilowatts,

    pub coupling: Coupling,
}

impl Default for BatteryParameters {
    fn default() -> Self {
        Self {
            soc_max: Quantity(10.0),
            reserve: Quantity(0.0),
            rate_max_charge: Quantity(2.6),
            rate_max_discharge: Quantity(2.6),
            rate_min: Kilowatts::ZERO,
            rate_scaling_charge: 1.0,
            rate_scaling_discharge: 1.0,
            charge_power_curve: PowerCurve::default(),
            discharge_power_curve: PowerCurve::default(),
            temperature_charge_curve: TemperatureCurve::default(),
            temperature_discharge_curve: TemperatureCurve::default(),
            loss_charge: 1.0,
            loss_discharge: 1.0,
            inverter_loss: 1.0,
            inverter_limit: Quantity(7.5),
            export_limit: Quantity(10.0),
            coupling: Coupling::Ac,
        }
    }
}

impl BatteryParameters {
    pub fn is_hybrid(&self) -> bool {
        self.coupling == Coupling::Hybrid
    }

    pub fn soc_percent(&self, soc: KilowattHours) -> f64 {
        soc.percent_of(self.soc_max)
    }

    /// Sustainable charge rate at the given state, §4.1.
    pub fn charge_rate(
        &self,
        soc: KilowattHours,
        requested: Kilowatts,
        temperature: f64,
    ) -> Kilowatts {
        derated_rate(
            requested,
            self.rate_max_charge,
            self.soc_percent(soc),
            &self.charge_power_curve,
            temperature,
            &self.temperature_charge_curve,
            self.rate_scaling_charge,
            self.rate_min,
        )
    }

    /// Sustainable discharge rate at the given state.
    pub fn discharge_rate(
        &self,
        soc: KilowattHours,
        requested: Kilowatts,
        temperature: f64,
    ) -> Kilowatts {
        derated_rate(
            requested,
            self.rate_max_discharge,
            self.soc_percent(soc),
            &self.discharge_power_curve,
            temperature,
            &self.temperature_discharge_curve,
            self.rate_scaling_discharge,
            self.rate_min,
        )
    }

    /// Charge rate to program for a window in progress. In low-power mode
    /// this is the slowest rate that still tops the battery up to `limit`
    /// by `margin_minutes` before the window closes; charging slower runs
    /// the cells cooler and cheaper. Falls back to the full derated rate.
    pub fn plan_charge_rate(
        &self,
        minutes_now: i32,
        window: Window,
        limit: KilowattHours,
        soc: KilowattHours,
        temperature: f64,
        low_power: bool,
        margin_minutes: i32,
    ) -> Kilowatts {
        let full = self.charge_rate(soc, self.rate_max_charge, temperature);
        if !low_power {
            return full;
        }
        let deficit = (limit - soc).max(KilowattHours::ZERO) / self.loss_charge;
        let remaining = window.end - minutes_now - margin_minutes;
        if deficit <= KilowattHours::ZERO || remaining <= 0 {
            return full;
        }
        // Walk candidate rates up from the floor; the first one that finishes
        // in time is the slowest acceptable.
        let mut candidate = self.rate_min.max(Quantity(0.1));
        while candidate < full {
            if self.charge_completes(candidate, soc, limit, temperature, remaining) {
                return candidate;
            }
            candidate = candidate + Quantity(0.1);
        }
        full
    }

    fn charge_completes(
        &self,
        rate: Kilowatts,
        mut soc: KilowattHours,
        limit: KilowattHours,
        temperature: f64,
        remaining_minutes: i32,
    ) -> bool {
        let step = Hours::from_minutes(crate::core::STEP_MINUTES);
        let mut minute = 0;
        while minute < remaining_minutes {
            let effective = self.charge_rate(soc, rate, temperature);
            soc = (soc + effective * step * self.loss_charge).min(self.soc_max);
            if soc >= limit {
                return true;
            }
            minute += crate::core::STEP_MINUTES;
        }
        false
    }
}

/// AC-side energy balance for one step: positive means the house pulls from
/// the grid, negative means it spills to the grid. A positive battery
/// balance (discharging, or DC PV flowing out) loses energy crossing the
/// inverter; a negative one (charging from AC) needs more AC than it stores.
pub fn ac_diff(
    battery_draw: KilowattHours,
    pv_dc: KilowattHours,
    pv_ac: KilowattHours,
    load: KilowattHours,
    inverter_loss: f64,
) -> KilowattHours {
    let balance = battery_draw + pv_dc;
    let balance =
        if balance.is_positive() { balance * inverter_loss } else { balance / inverter_loss };
    load - balance - pv_ac
}

/// Energy crossing the inverter boundary in one step, compared against the
/// inverter limit by the clipping cascade.
pub fn total_inverted(
    battery_draw: KilowattHours,
    pv_dc: KilowattHours,
    pv_ac: KilowattHours,
    inverter_loss: f64,
    coupling: Coupling,
) -> KilowattHours {
    let balance = battery_draw + pv_dc;
    let mut total = if balance.is_positive() { balance } else { balance.abs() / inverter_loss };
    if coupling == Coupling::Hybrid {
        total = total + pv_ac / inverter_loss;
    }
    total
}
