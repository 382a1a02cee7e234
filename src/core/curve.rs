use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::quantity::{Quantity, power::Kilowatts};

/// Manufacturer power curve: maximum-rate derating factor keyed by whole
/// state-of-charge percent. Percents absent from the table carry no
/// derating; an empty table means the battery sustains its full rate
/// everywhere.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct PowerCurve(BTreeMap<u8, f64>);

impl PowerCurve {
    pub fn factor(&self, soc_percent: f64) -> f64 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let percent = soc_percent.round().clamp(0.0, 100.0) as u8;
        self.0.get(&percent).copied().unwrap_or(1.0)
    }
}

impl TryFrom<BTreeMap<String, f64>> for PowerCurve {
    type Error = anyhow::Error;

    fn try_from(table: BTreeMap<String, f64>) -> Result<Self, Self::Error> {
        table
            .into_iter()
            .map(|(percent, factor)| {
                anyhow::ensure!(
                    (0.0..=1.0).contains(&factor),
                    "derating factor {factor} at {percent}% is out of (0, 1]",
                );
                Ok((percent.parse::<u8>()?, factor))
            })
            .collect::<Result<_, _>>()
            .map(Self)
    }
}

impl From<PowerCurve> for BTreeMap<String, f64> {
    fn from(curve: PowerCurve) -> Self {
        curve.0.into_iter().map(|(percent, factor)| (percent.to_string(), factor)).collect()
    }
}

/// Temperature derating: factor keyed by degrees Celsius. Lookup is a step
/// function over the table, clamped to the table's endpoints rather than
/// extrapolated.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct TemperatureCurve(BTreeMap<OrderedFloat<f64>, f64>);

impl TemperatureCurve {
    pub fn factor(&self, temperature: f64) -> f64 {
        if self.0.is_empty() {
            return 1.0;
        }
        self.0
            .range(..=OrderedFloat(temperature))
            .next_back()
            .or_else(|| self.0.iter().next())
            .map_or(1.0, |(_, factor)| *factor)
    }
}

impl TryFrom<BTreeMap<String, f64>> for TemperatureCurve {
    type Error = anyhow::Error;

    fn try_from(table: BTreeMap<String, f64>) -> Result<Self, Self::Error> {
        table
            .into_iter()
            .map(|(temperature, factor)| {
                anyhow::ensure!(
                    (0.0..=1.0).contains(&factor),
                    "derating factor {factor} at {temperature}°C is out of [0, 1]",
                );
                Ok((OrderedFloat(temperature.parse::<f64>()?), factor))
            })
            .collect::<Result<_, _>>()
            .map(Self)
    }
}

impl From<TemperatureCurve> for BTreeMap<String, f64> {
    fn from(curve: TemperatureCurve) -> Self {
        curve.0.into_iter().map(|(temperature, factor)| (temperature.to_string(), factor)).collect()
    }
}

/// The rate the battery will actually sustain this step: the requested rate
/// capped by the derated maximum, never below the trickle floor.
pub fn derated_rate(
    requested: Kilowatts,
    rate_max: Kilowatts,
    soc_percent: f64,
    power_curve: &PowerCurve,
    temperature: f64,
    temperature_curve: &TemperatureCurve,
    scaling: f64,
    floor: Kilowatts,
) -> Kilowatts {
    let derated = rate_max * power_curve.factor(soc_percent) * temperature_curve.factor(temperature);
    (requested.min(derated) * scaling).max(floor)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn taper() -> PowerCurve {
        PowerCurve([(98, 0.6), (99, 0.4), (100, 0.15)].into_iter().collect())
    }

    fn cold() -> TemperatureCurve {
        TemperatureCurve(
            [(OrderedFloat(0.0), 0.3), (OrderedFloat(10.0), 0.8), (OrderedFloat(20.0), 1.0)]
                .into_iter()
                .collect(),
        )
    }

    #[test]
    fn test_power_curve_tapers_near_full() {
        let curve = taper();
        assert_abs_diff_eq!(curve.factor(50.0), 1.0);
        assert_abs_diff_eq!(curve.factor(99.0), 0.4);
        assert_abs_diff_eq!(curve.factor(99.6), 0.15);
    }

    #[test]
    fn test_temperature_curve_clamps_to_endpoints() {
        let curve = cold();
        assert_abs_diff_eq!(curve.factor(-5.0), 0.3);
        assert_abs_diff_eq!(curve.factor(12.5), 0.8);
        assert_abs_diff_eq!(curve.factor(35.0), 1.0);
    }

    #[test]
    fn test_derated_rate_never_below_floor() {
        let rate = derated_rate(
            Quantity(2.6),
            Quantity(2.6),
            100.0,
            &taper(),
            0.0,
            &cold(),
            1.0,
            Quantity(0.1),
        );
        // 2.6 × 0.15 × 0.3 would be ~0.117, the floor does not bite.
        assert_abs_diff_eq!(rate.0, 2.6 * 0.15 * 0.3, epsilon = 1e-9);
        let floored = derated_rate(
            Quantity(2.6),
            Quantity(2.6),
            100.0,
            &taper(),
            0.0,
            &cold(),
            0.5,
            Quantity(0.1),
        );
        assert_abs_diff_eq!(floored.0, 0.1);
    }

    #[test]
    fn test_derated_rate_respects_request() {
        let rate = derated_rate(
            Quantity(1.0),
            Quantity(2.6),
            50.0,
            &taper(),
            20.0,
            &cold(),
            1.0,
            Quantity(0.0),
        );
        assert_abs_diff_eq!(rate.0, 1.0);
    }
}
