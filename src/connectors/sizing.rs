//! Order quantity rounding against venue lot-size rules

use rust_decimal::prelude::*;

/// Quantity constraints of one contract
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LotSize {
    /// Quantity increment
    pub step: Decimal,
    /// Smallest accepted quantity
    pub min_qty: Decimal,
}

impl LotSize {
    /// Parse the string pair venues publish, e.g. `("0.001", "0.001")`
    pub fn parse(step: &str, min_qty: &str) -> Option<Self> {
        let step = Decimal::from_str(step).ok()?;
        let min_qty = Decimal::from_str(min_qty).ok()?;
        if step <= Decimal::ZERO {
            return None;
        }
        Some(Self { step, min_qty })
    }

    /// Base quantity for `size_usd` at `price`, floored to the step.
    ///
    /// `None` when the result is below the minimum quantity.
    pub fn quantity_for(&self, size_usd: f64, price: f64) -> Option<Decimal> {
        if !(size_usd > 0.0 && price > 0.0) {
            return None;
        }
        self.round(Decimal::from_f64(size_usd / price)?)
    }

    /// Floor `quantity` to the step; `None` below the minimum
    pub fn round(&self, quantity: Decimal) -> Option<Decimal> {
        let floored = ((quantity / self.step).floor() * self.step).normalize();
        if floored <= Decimal::ZERO || floored < self.min_qty {
            None
        } else {
            Some(floored)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_quantity_floors_to_step() {
        let lot = LotSize::parse("0.001", "0.001").unwrap();
        let qty = lot.quantity_for(100.0, 50_000.0).unwrap();
        assert_eq!(qty, Decimal::from_str("0.002").unwrap());
        assert_eq!(qty.to_string(), "0.002");

        let qty = lot.quantity_for(130.0, 50_000.0).unwrap();
        assert_eq!(qty.to_string(), "0.002");
    }

    #[test]
    fn test_below_minimum_is_rejected() {
        let lot = LotSize::parse("0.001", "0.001").unwrap();
        assert!(lot.quantity_for(10.0, 50_000.0).is_none());
        assert!(lot.quantity_for(0.0, 50_000.0).is_none());
        assert!(lot.quantity_for(100.0, 0.0).is_none());
    }

    #[test]
    fn test_integer_steps() {
        let lot = LotSize::parse("1", "1").unwrap();
        assert_eq!(lot.quantity_for(25.5, 0.5).unwrap().to_string(), "51");
    }

    #[test]
    fn test_parse_rejects_zero_step() {
        assert!(LotSize::parse("0", "0.001").is_none());
        assert!(LotSize::parse("abc", "0.001").is_none());
    }
}
