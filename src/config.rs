use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    core::{
        balance::BalanceSettings,
        battery::BatteryParameters,
        executor::ExecutorFlags,
        iboost::IBoostParameters,
        plan::CarPlan,
        sim::{KeepSettings, SimFlags},
    },
    inverter::simulated::SimulatedInverterConfig,
    prelude::*,
};

/// The full TOML configuration. Everything defaults, so a minimal file only
/// has to describe the battery.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub battery: BatteryParameters,
    pub flags: SimFlags,
    pub executor: ExecutorFlags,
    pub keep: KeepSettings,
    pub iboost: Option<IBoostParameters>,
    pub balance: Option<BalanceSettings>,
    pub inverters: Vec<SimulatedInverterConfig>,

    /// Car battery states; charging slots come from the plan.
    pub cars: Vec<CarPlan>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("malformed configuration {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [battery]
            soc_max = 9.5
            reserve = 0.4
            rate_max_charge = 2.6
            rate_max_discharge = 2.6
            loss_charge = 0.97
            loss_discharge = 0.97
            inverter_loss = 0.96
            coupling = "hybrid"

            [battery.charge_power_curve]
            99 = 0.4
            100 = 0.15

            [[inverters]]
            soc = 4.0
            soc_max = 9.5
            "#,
        )
        .unwrap();
        assert!(config.battery.is_hybrid());
        assert_eq!(config.battery.soc_max.0, 9.5);
        assert_eq!(config.battery.charge_power_curve.factor(100.0), 0.15);
        assert_eq!(config.inverters.len(), 1);
        assert!(config.flags.set_charge_window);
    }

    #[test]
    fn test_empty_config_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.iboost.is_none());
        assert!(config.inverters.is_empty());
        assert_eq!(config.executor.set_window_minutes, 30);
    }
}
