//! Paired significance and distribution-shift tests

use num::bigint::BigInt;
use num::rational::BigRational;
use num::traits::{One, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};

/// Exact binomial coefficient C(n, k)
pub fn binomial(n: u64, k: u64) -> BigInt {
    if k > n {
        return BigInt::zero();
    }
    let k = k.min(n - k);
    let mut result = BigInt::one();
    for i in 0..k {
        result *= BigInt::from(n - i);
        result /= BigInt::from(i + 1);
    }
    result
}

/// Exact two-sided McNemar p-value
///
/// `p = min(1, 2 · Σ_{i ≤ min(b,c)} C(n, i) / 2ⁿ)` with `n = b + c`;
/// `n = 0` gives 1.
pub fn mcnemar_exact(b: u64, c: u64) -> f64 {
    let n = b + c;
    if n == 0 {
        return 1.0;
    }
    let k = b.min(c);
    let mut tail = BigInt::zero();
    for i in 0..=k {
        tail += binomial(n, i);
    }
    let numerator = tail * BigInt::from(2u8);
    let denominator = BigInt::one() << (n as usize);
    let p = BigRational::new(numerator, denominator)
        .to_f64()
        .unwrap_or(1.0);
    p.min(1.0)
}

/// ln Γ(x) for x > 0 (Lanczos, g = 7)
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFICIENTS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        // Reflection: Γ(x)Γ(1−x) = π / sin(πx)
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut sum = COEFFICIENTS[0];
    for (i, coefficient) in COEFFICIENTS.iter().enumerate().skip(1) {
        sum += coefficient / (x + i as f64);
    }
    let t = x + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + sum.ln()
}

const GAMMA_EPS: f64 = 1e-14;
const GAMMA_MAX_ITER: usize = 500;

/// Regularized upper incomplete gamma Q(a, x)
pub fn regularized_gamma_q(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    if x < a + 1.0 {
        (1.0 - gamma_p_series(a, x)).clamp(0.0, 1.0)
    } else {
        gamma_q_continued_fraction(a, x).clamp(0.0, 1.0)
    }
}

fn gamma_p_series(a: f64, x: f64) -> f64 {
    let mut term = 1.0 / a;
    let mut sum = term;
    let mut ap = a;
    for _ in 0..GAMMA_MAX_ITER {
        ap += 1.0;
        term *= x / ap;
        sum += term;
        if term.abs() < sum.abs() * GAMMA_EPS {
            break;
        }
    }
    sum * (-x + a * x.ln() - ln_gamma(a)).exp()
}

fn gamma_q_continued_fraction(a: f64, x: f64) -> f64 {
    // Modified Lentz
    let tiny = 1e-300;
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / tiny;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..=GAMMA_MAX_ITER {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < tiny {
            d = tiny;
        }
        c = b + an / c;
        if c.abs() < tiny {
            c = tiny;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < GAMMA_EPS {
            break;
        }
    }
    (-x + a * x.ln() - ln_gamma(a)).exp() * h
}

/// Upper tail of the chi-square distribution
pub fn chi_square_sf(statistic: f64, df: u64) -> f64 {
    if df == 0 {
        return 1.0;
    }
    regularized_gamma_q(df as f64 / 2.0, statistic / 2.0)
}

/// Chi-square test of independence on a 2×k table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChiSquareTest {
    pub statistic: f64,
    pub df: u64,
    pub p_value: f64,
    /// Indices of the columns that entered the test (all-zero columns dropped)
    pub columns_used: Vec<usize>,
}

pub fn chi_square_independence<const K: usize>(table: &[[u64; K]; 2]) -> ChiSquareTest {
    let columns_used: Vec<usize> = (0..K).filter(|&j| table[0][j] + table[1][j] > 0).collect();
    let row_totals = [
        columns_used.iter().map(|&j| table[0][j]).sum::<u64>(),
        columns_used.iter().map(|&j| table[1][j]).sum::<u64>(),
    ];
    let grand_total = row_totals[0] + row_totals[1];

    if columns_used.len() < 2 || row_totals.contains(&0) {
        return ChiSquareTest {
            statistic: 0.0,
            df: 0,
            p_value: 1.0,
            columns_used,
        };
    }

    let mut statistic = 0.0;
    for &j in &columns_used {
        let column_total = (table[0][j] + table[1][j]) as f64;
        for (row, row_total) in row_totals.iter().enumerate() {
            let expected = *row_total as f64 * column_total / grand_total as f64;
            let diff = table[row][j] as f64 - expected;
            statistic += diff * diff / expected;
        }
    }
    let df = (columns_used.len() - 1) as u64;
    ChiSquareTest {
        statistic,
        df,
        p_value: chi_square_sf(statistic, df),
        columns_used,
    }
}
