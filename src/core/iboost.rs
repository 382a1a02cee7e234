use serde::{Deserialize, Serialize};

use crate::{
    core::{MINUTES_PER_DAY, plan::EnergyWindow},
    quantity::{Quantity, energy::KilowattHours, power::Kilowatts, rate::KilowattHourRate, time::Hours},
};

/// Immersion-diverter (iBoost) settings. The diverter heats a resistive
/// load from planned slots, cheap-rate charging, or surplus solar, capped
/// per step and per day.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IBoostParameters {
    pub enable: bool,

    /// Divert surplus solar.
    pub solar: bool,

    /// Divert while the battery force-charges at an acceptable rate.
    pub charging: bool,

    /// Suppress when heating by gas is cheaper than importing.
    pub gas: bool,

    /// Suppress when exporting pays more than gas heating costs.
    pub gas_export: bool,

    /// Allow diversion inside export windows.
    pub on_export: bool,

    /// Hold battery discharge while the diverter draws.
    pub prevent_discharge: bool,

    pub gas_scale: f64,
    pub max_power: Kilowatts,
    pub min_power: Kilowatts,
    pub max_energy_per_day: KilowattHours,
    pub min_soc_percent: f64,
    pub rate_threshold: KilowattHourRate,
    pub rate_threshold_export: KilowattHourRate,

    #[serde(skip)]
    pub plan: Vec<EnergyWindow>,
}

impl Default for IBoostParameters {
    fn default() -> Self {
        Self {
            enable: false,
            solar: true,
            charging: false,
            gas: false,
            gas_export: false,
            on_export: false,
            prevent_discharge: false,
            gas_scale: 1.0,
            max_power: Quantity(2.4),
            min_power: Quantity(0.5),
            max_energy_per_day: Quantity(3.0),
            min_soc_percent: 0.0,
            rate_threshold: Quantity(f64::MAX),
            rate_threshold_export: Quantity(f64::MAX),
            plan: Vec::new(),
        }
    }
}

/// Per-simulation (or per-day, for the executor) diverter state.
#[derive(Clone, Copy, Debug, Default)]
pub struct IBoostState {
    /// Energy diverted since local midnight.
    pub today: KilowattHours,

    /// Set when the first simulated step diverts anything.
    pub running: bool,

    /// Set when the first simulated step diverts solar surplus.
    pub running_solar: bool,

    /// Set when the first simulated step draws at the planned/charging rate.
    pub running_full: bool,
}

impl IBoostParameters {
    /// Do the current energy rates allow heating electrically at all?
    pub fn rate_allows(
        &self,
        import_rate: KilowattHourRate,
        export_rate: KilowattHourRate,
        gas_rate: Option<KilowattHourRate>,
    ) -> bool {
        if import_rate > self.rate_threshold {
            return false;
        }
        if export_rate > self.rate_threshold_export {
            return false;
        }
        if let Some(gas_rate) = gas_rate {
            let gas_rate = gas_rate * self.gas_scale;
            if self.gas && import_rate > gas_rate {
                return false;
            }
            if self.gas_export && export_rate > gas_rate {
                return false;
            }
        }
        true
    }

    /// Planned draw for this minute in kW, zero outside any slot.
    fn planned_rate(&self, minute_absolute: i32) -> Kilowatts {
        self.plan
            .iter()
            .find(|slot| slot.window.contains(minute_absolute))
            .map_or(Kilowatts::ZERO, |slot| Quantity(slot.rate_kw()))
    }

    /// Diverter load added before the battery regime is resolved: planned
    /// slots, and the charge-triggered boost.
    #[allow(clippy::fn_params_excessive_bools)]
    pub fn demand_before_battery(
        &self,
        state: &IBoostState,
        minute_absolute: i32,
        step: Hours,
        in_charge_window: bool,
        in_export_window: bool,
        rate_ok: bool,
    ) -> KilowattHours {
        let mut amount = KilowattHours::ZERO;
        let headroom = (self.max_energy_per_day - state.today).max(KilowattHours::ZERO);
        if !self.plan.is_empty() && (self.on_export || !in_export_window) {
            let planned = self.planned_rate(minute_absolute) * step;
            amount = planned.min(self.max_power * step).min(headroom);
        }
        if self.charging && rate_ok && in_charge_window && state.today < self.max_energy_per_day {
            amount = (self.max_power * step).min(headroom);
        }
        amount
    }

    /// Surplus-solar diversion after the battery has taken its share. The
    /// returned amount has already been removed from `pv_ac`.
    pub fn divert_solar(
        &self,
        state: &IBoostState,
        already: KilowattHours,
        pv_ac: &mut KilowattHours,
        step: Hours,
        soc_percent: f64,
        in_export_window: bool,
        rate_ok: bool,
    ) -> KilowattHours {
        if !self.solar
            || !rate_ok
            || state.today >= self.max_energy_per_day
            || *pv_ac <= self.min_power * step
            || soc_percent < self.min_soc_percent
            || (in_export_window && !self.on_export)
        {
            return KilowattHours::ZERO;
        }
        let amount = (*pv_ac)
            .min((self.max_power * step - already).max(KilowattHours::ZERO))
            .min((self.max_energy_per_day - state.today - already).max(KilowattHours::ZERO));
        *pv_ac = *pv_ac - amount;
        amount
    }
}

impl IBoostState {
    /// Accumulate this step's diversion, then reset at the step spanning
    /// local midnight — the step whose half-open interval contains minute
    /// `k * 1440`, i.e. `minute % 1440 >= 1440 - step`.
    pub fn accumulate(&mut self, amount: KilowattHours, minute_absolute: i32, step_minutes: i32) {
        self.today += amount;
        if minute_absolute.rem_euclid(MINUTES_PER_DAY) >= MINUTES_PER_DAY - step_minutes {
            self.today = KilowattHours::ZERO;
        }
    }
}
