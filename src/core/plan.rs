use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{
    core::{
        battery::BatteryParameters,
        error::PlanError,
        window::{Window, remove_intersections},
    },
    quantity::{Quantity, energy::KilowattHours, power::Kilowatts},
};

/// Export-limit percent with its sentinel encodings: `100` is inactive,
/// an integer part of `99` freezes export, anything lower forces export
/// down to that percent of capacity. A fractional part encodes low-power
/// export: the rate is scaled by `1 − frac`.
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct ExportLimit(pub f64);

impl ExportLimit {
    pub const INACTIVE: Self = Self(100.0);
    pub const FREEZE: Self = Self(99.0);

    pub fn is_active(self) -> bool {
        self.0 < 100.0
    }

    pub fn is_freeze(self) -> bool {
        (self.0 - 99.0).abs() < f64::EPSILON
    }

    /// Forced export applies below this; `99` only freezes.
    pub fn forces_export(self) -> bool {
        self.0 < 99.0
    }

    pub fn percent(self) -> f64 {
        self.0
    }

    /// Low-power export scaling: `50.4` means export at 60% rate down to 50%.
    pub fn rate_scaling(self) -> f64 {
        1.0 - self.0.fract()
    }

    /// The state of charge this export window drains down to.
    pub fn floor(self, soc_max: KilowattHours) -> KilowattHours {
        soc_max * (self.0.trunc() / 100.0)
    }
}

/// A window with an energy amount, as used by car-charging and immersion
/// plans.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnergyWindow {
    #[serde(flatten)]
    pub window: Window,
    pub kwh: KilowattHours,
}

impl EnergyWindow {
    /// Average draw while the slot is active, in kWh per hour.
    pub fn rate_kw(&self) -> f64 {
        (self.kwh.0 / self.window.hours().0).abs()
    }
}

/// One car: its plan slots plus the battery state needed to model it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CarPlan {
    pub slots: Vec<EnergyWindow>,
    pub soc: KilowattHours,
    pub capacity: KilowattHours,
    pub limit: KilowattHours,
    /// Charger efficiency: energy drawn is `kwh / loss`.
    pub loss: f64,
}

impl Default for CarPlan {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            soc: KilowattHours::ZERO,
            capacity: Quantity(75.0),
            limit: Quantity(75.0),
            loss: 1.0,
        }
    }
}

impl CarPlan {
    /// Charger draw for this minute, zero outside any slot.
    pub fn rate_at(&self, minute_absolute: i32) -> Kilowatts {
        self.slots
            .iter()
            .find(|slot| slot.window.contains(minute_absolute))
            .map_or(Kilowatts::ZERO, |slot| Quantity(slot.rate_kw()))
    }
}

/// A charge window with its target in the aggregate frame.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChargeWindow {
    #[serde(flatten)]
    pub window: Window,
    pub target_soc_percent: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportWindow {
    #[serde(flatten)]
    pub window: Window,
    pub limit: ExportLimit,
}

/// The chosen operating plan: what the executor applies and the inspection
/// surface serialises. Immutable between planner invocations.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    /// The midnight anchor all window minutes count from.
    #[serde_as(as = "serde_with::TimestampSeconds<i64>")]
    #[serde(default = "default_origin")]
    pub horizon_origin: DateTime<Utc>,

    #[serde(default)]
    pub charge_windows: Vec<ChargeWindow>,

    #[serde(default)]
    pub export_windows: Vec<ExportWindow>,

    /// Car charging slots, one list per car.
    #[serde(default)]
    pub car_windows: Vec<Vec<EnergyWindow>>,

    #[serde(default)]
    pub iboost_windows: Vec<EnergyWindow>,

    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub status_extra: String,
}

fn default_origin() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            horizon_origin: default_origin(),
            charge_windows: Vec::new(),
            export_windows: Vec::new(),
            car_windows: Vec::new(),
            iboost_windows: Vec::new(),
            status: String::new(),
            status_extra: String::new(),
        }
    }
}

impl Plan {
    /// Charge targets converted into the simulator's kWh frame.
    pub fn charge_limits_kwh(&self, battery: &BatteryParameters) -> Vec<KilowattHours> {
        self.charge_windows
            .iter()
            .map(|slot| battery.soc_max * (slot.target_soc_percent / 100.0))
            .collect()
    }

    pub fn export_limits(&self) -> Vec<ExportLimit> {
        self.export_windows.iter().map(|slot| slot.limit).collect()
    }

    /// Normalised charge set: slots cropped or dropped wherever an active
    /// export window claims the time. Export wins.
    pub fn normalised_charge_slots(
        &self,
        battery: &BatteryParameters,
    ) -> (Vec<Window>, Vec<KilowattHours>) {
        let windows: Vec<Window> = self.charge_windows.iter().map(|slot| slot.window).collect();
        let limits = self.charge_limits_kwh(battery);
        let blockers: Vec<Window> = self
            .export_windows
            .iter()
            .filter(|slot| slot.limit.is_active())
            .map(|slot| slot.window)
            .collect();
        remove_intersections(&windows, &limits, &blockers)
    }

    /// Check the invariants the executor relies on; a failure here is fatal
    /// for the tick and nothing must be written to the inverter.
    pub fn verify(&self, battery: &BatteryParameters) -> Result<(), PlanError> {
        for pair in self.charge_windows.windows(2) {
            if pair[1].window.start < pair[0].window.end {
                return Err(PlanError::UnorderedWindows { first: pair[0].window, second: pair[1].window });
            }
        }
        for pair in self.export_windows.windows(2) {
            if pair[1].window.start < pair[0].window.end {
                return Err(PlanError::UnorderedWindows { first: pair[0].window, second: pair[1].window });
            }
        }
        let (normalised, _) = self.normalised_charge_slots(battery);
        for window in &normalised {
            for export in self.export_windows.iter().filter(|slot| slot.limit.is_active()) {
                if window.overlaps(export.window) {
                    return Err(PlanError::OverlappingWindows {
                        charge: *window,
                        export: export.window,
                    });
                }
            }
        }
        for slot in &self.charge_windows {
            if slot.target_soc_percent > 100.0 {
                return Err(PlanError::TargetAboveCapacity { percent: slot.target_soc_percent });
            }
        }
        for slot in &self.export_windows {
            if !(0.0..=100.0).contains(&slot.limit.percent()) {
                return Err(PlanError::ExportLimitOutOfRange { percent: slot.limit.percent() });
            }
        }
        Ok(())
    }
}
