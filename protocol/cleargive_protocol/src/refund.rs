//! Refund arithmetic for executed approvals.

use crate::types::Amount;
use crate::{Error, Result};

/// Remainder of an approval once its released milestones are paid.
///
/// `released_sum` must already be the total of the approval's milestones in
/// `Released` status. A remainder of zero or less means nothing is left to
/// return.
pub fn calculate_refund(total: Amount, released_sum: Amount) -> Result<Amount> {
    let remainder = total.signed_sub(released_sum);
    if remainder <= 0 {
        return Err(Error::Validation(
            "No funds available for refund".to_string(),
        ));
    }
    // remainder <= total, so it fits back into an Amount
    Amount::from_stroops(remainder as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remainder_after_partial_release() {
        let refund = calculate_refund(Amount::units(100), Amount::units(40)).unwrap();
        assert_eq!(refund, Amount::units(60));
    }

    #[test]
    fn nothing_released_refunds_everything() {
        assert_eq!(
            calculate_refund(Amount::units(25), Amount::ZERO).unwrap(),
            Amount::units(25)
        );
    }

    #[test]
    fn fully_or_over_released_is_rejected() {
        assert!(matches!(
            calculate_refund(Amount::units(100), Amount::units(100)),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            calculate_refund(Amount::units(100), Amount::units(130)),
            Err(Error::Validation(_))
        ));
    }
}
