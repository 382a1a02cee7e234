use crate::quantity::Quantity;

/// Pence per kilowatt-hour.
pub type KilowattHourRate = Quantity<f64, -1, -1, 1>;
