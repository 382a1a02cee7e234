use crate::quantity::Quantity;

/// Pence (or any minor currency unit).
pub type Cost = Quantity<f64, 0, 0, 1>;
