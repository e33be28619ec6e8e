//! Power-of-two amount splitting, used to build swap output denominations.
//! Adapted from the bit-decomposition idiom mints/wallets in this
//! ecosystem use to split a value into individually-spendable proofs.

/// Splits `amount` into parts that are each a power of two, descending.
pub fn split(amount: u64) -> Vec<u64> {
    (0_u64..64)
        .rev()
        .filter_map(|bit| {
            let part = 1u64 << bit;
            ((amount & part) == part).then_some(part)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_into_powers_of_two_summing_to_amount() {
        for amount in [0u64, 1, 2, 3, 20, 63, 12345] {
            let parts = split(amount);
            assert_eq!(parts.iter().sum::<u64>(), amount);
            for p in parts {
                assert_eq!(p & (p - 1), 0, "{p} is not a power of two");
            }
        }
    }

    #[test]
    fn zero_splits_to_empty() {
        assert!(split(0).is_empty());
    }
}
