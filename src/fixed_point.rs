//! 17.14 signed fixed-point arithmetic, used only by the MLFQS scheduler for
//! `load_avg` and `recent_cpu` (see spec.md §4.1 / §4.3).
//!
//! P.Q format with P=17, Q=14, so `F = 1 << 14` is one unit. All operations
//! mirror the reference `fixed-point.h` one-for-one; names describe exactly
//! what they return.

const Q: i32 = 14;
const F: i64 = 1 << Q;

/// A 17.14 signed fixed-point number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Fixed(i64);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);

    /// `TO_FIXED_POINT`.
    pub fn from_int(n: i32) -> Fixed {
        Fixed(n as i64 * F)
    }

    /// `TO_INT_ROUND_ZERO`.
    pub fn to_int_round_zero(self) -> i32 {
        (self.0 / F) as i32
    }

    /// `TO_INT_ROUND_TO_NEAREST`.
    pub fn to_int_round_nearest(self) -> i32 {
        if self.0 >= 0 {
            ((self.0 + F / 2) / F) as i32
        } else {
            ((self.0 - F / 2) / F) as i32
        }
    }

    pub fn add(self, other: Fixed) -> Fixed {
        Fixed(self.0 + other.0)
    }

    pub fn sub(self, other: Fixed) -> Fixed {
        Fixed(self.0 - other.0)
    }

    pub fn add_int(self, n: i32) -> Fixed {
        Fixed(self.0 + n as i64 * F)
    }

    pub fn sub_int(self, n: i32) -> Fixed {
        Fixed(self.0 - n as i64 * F)
    }

    pub fn mul(self, other: Fixed) -> Fixed {
        Fixed((self.0 * other.0) / F)
    }

    pub fn mul_int(self, n: i32) -> Fixed {
        Fixed(self.0 * n as i64)
    }

    pub fn div(self, other: Fixed) -> Fixed {
        Fixed((self.0 * F) / other.0)
    }

    pub fn div_int(self, n: i32) -> Fixed {
        Fixed(self.0 / n as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_small_ints() {
        for n in [-100, -1, 0, 1, 42, 1000] {
            assert_eq!(Fixed::from_int(n).to_int_round_zero(), n);
        }
    }

    #[test]
    fn nearest_rounds_half_up_for_positive() {
        let half = Fixed::from_int(1).div_int(2);
        assert_eq!(half.to_int_round_nearest(), 1);
        assert_eq!(half.to_int_round_zero(), 0);
    }

    #[test]
    fn arithmetic_matches_expected_ratio() {
        let x = Fixed::from_int(10);
        let y = Fixed::from_int(4);
        let q = x.div(y);
        assert_eq!(q.to_int_round_nearest(), 3);
        let m = x.mul(y);
        assert_eq!(m.to_int_round_zero(), 40);
    }

    #[test]
    fn load_avg_formula_is_monotone_toward_one_ready_thread() {
        // load_avg = (59/60)*load_avg + (1/60)*ready_threads, ready_threads == 1 steady-state.
        let fifty_nine_sixtieths = Fixed::from_int(59).div_int(60);
        let one_sixtieth = Fixed::from_int(1).div_int(60);
        let mut load_avg = Fixed::ZERO;
        for _ in 0..60 * 60 {
            load_avg = fifty_nine_sixtieths.mul(load_avg).add(one_sixtieth.mul_int(1));
        }
        // After many seconds worth of ticks it should have converged close to 1.
        let percent = load_avg.mul_int(100).to_int_round_nearest();
        assert!(percent > 90, "load_avg*100 = {}", percent);
    }
}
