use std::ops::{Div, Mul};

use crate::quantity::{Quantity, cost::Cost, power::Kilowatts, rate::KilowattHourRate, time::Hours};

pub type KilowattHours = Quantity<f64, 1, 1, 0>;

impl KilowattHours {
    /// State-of-charge percent of the given capacity, rounded to the nearest
    /// whole percent and clamped to `[0, 100]`, as inverter registers hold it.
    pub fn percent_of(self, capacity: KilowattHours) -> f64 {
        if capacity.0 <= 0.0 {
            return 0.0;
        }
        (self.0 / capacity.0 * 100.0).round().clamp(0.0, 100.0)
    }
}

impl Mul<KilowattHourRate> for KilowattHours {
    type Output = Cost;

    fn mul(self, rhs: KilowattHourRate) -> Self::Output {
        Quantity(self.0 * rhs.0)
    }
}

impl Div<Kilowatts> for KilowattHours {
    type Output = Hours;

    fn div(self, rhs: Kilowatts) -> Self::Output {
        Quantity(self.0 / rhs.0)
    }
}

impl Div<Hours> for KilowattHours {
    type Output = Kilowatts;

    fn div(self, rhs: Hours) -> Self::Output {
        Quantity(self.0 / rhs.0)
    }
}
