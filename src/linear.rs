//! Exact rational linear algebra for invariant fitting.
//!
//! The observation matrix is reduced to row echelon form over arbitrary
//! precision rationals; its null-space basis yields the coefficient vectors
//! of candidate equations. Vectors are rescaled to the smallest integer
//! vector with gcd 1 and a positive leading coefficient, so the emitted
//! equations are canonical.

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, Signed, Zero};

/// The outer vector holds the rows.
pub type Matrix<T> = Vec<Vec<T>>;

pub fn is_zero_row(row: &[BigRational]) -> bool {
    row.iter().all(|v| v.is_zero())
}

/// In-place reduced row echelon form.
pub fn reduced_row_echelon_form(m: &mut Matrix<BigRational>) {
    let rows = m.len();
    if rows == 0 {
        return;
    }
    let cols = m[0].len();
    let mut pivot_row = 0;
    for col in 0..cols {
        if pivot_row >= rows {
            break;
        }
        let Some(nonzero) = (pivot_row..rows).find(|&r| !m[r][col].is_zero()) else {
            continue;
        };
        m.swap(pivot_row, nonzero);
        let pivot = m[pivot_row][col].clone();
        for v in &mut m[pivot_row] {
            *v /= pivot.clone();
        }
        for r in 0..rows {
            if r != pivot_row && !m[r][col].is_zero() {
                let factor = m[r][col].clone();
                for c in 0..cols {
                    let sub = &m[pivot_row][c] * &factor;
                    m[r][c] -= sub;
                }
            }
        }
        pivot_row += 1;
    }
}

/// A basis of the null space of `m`, one vector per free column.
pub fn null_space(m: &Matrix<BigRational>) -> Vec<Vec<BigRational>> {
    if m.is_empty() {
        return Vec::new();
    }
    let cols = m[0].len();
    let mut reduced = m.clone();
    reduced_row_echelon_form(&mut reduced);
    reduced.retain(|row| !is_zero_row(row));

    // Pivot column of each remaining row.
    let mut pivot_cols = Vec::new();
    for row in &reduced {
        let col = row.iter().position(|v| !v.is_zero()).unwrap();
        pivot_cols.push(col);
    }

    let mut basis = Vec::new();
    for free_col in (0..cols).filter(|c| !pivot_cols.contains(c)) {
        let mut vec = vec![BigRational::zero(); cols];
        vec[free_col] = BigRational::one();
        for (row, &pivot_col) in reduced.iter().zip(pivot_cols.iter()) {
            vec[pivot_col] = -row[free_col].clone();
        }
        basis.push(vec);
    }
    basis
}

fn gcd(a: BigInt, b: BigInt) -> BigInt {
    let mut a = a.abs();
    let mut b = b.abs();
    while !b.is_zero() {
        let r = &a % &b;
        a = b;
        b = r;
    }
    a
}

fn lcm(a: BigInt, b: BigInt) -> BigInt {
    if a.is_zero() || b.is_zero() {
        return BigInt::one();
    }
    let g = gcd(a.clone(), b.clone());
    (a / g) * b
}

/// Scale a rational vector to the minimal integer vector with gcd 1 and a
/// positive leading (first non-zero) coefficient.
pub fn rat_to_int(vec: &[BigRational]) -> Vec<BigInt> {
    let denominator_lcm = vec
        .iter()
        .fold(BigInt::one(), |acc, v| lcm(acc, v.denom().clone()));
    let mut ints: Vec<BigInt> = vec
        .iter()
        .map(|v| v.numer() * (&denominator_lcm / v.denom()))
        .collect();
    let common = ints
        .iter()
        .fold(BigInt::zero(), |acc, v| gcd(acc, v.clone()));
    if !common.is_zero() && !common.is_one() {
        for v in &mut ints {
            *v = &*v / &common;
        }
    }
    if let Some(first) = ints.iter().find(|v| !v.is_zero()) {
        if first.is_negative() {
            for v in &mut ints {
                *v = -v.clone();
            }
        }
    }
    ints
}

/// Matrix-vector product, used to check fitted equations against
/// observations.
pub fn matrix_times_vector(m: &Matrix<BigRational>, vec: &[BigRational]) -> Vec<BigRational> {
    m.iter()
        .map(|row| {
            row.iter()
                .zip(vec.iter())
                .map(|(a, b)| a * b)
                .fold(BigRational::zero(), |acc, v| acc + v)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rat(n: i64) -> BigRational {
        BigRational::from(BigInt::from(n))
    }

    #[test]
    fn rref_of_identity_is_identity() {
        let mut m = vec![vec![rat(2), rat(0)], vec![rat(0), rat(3)]];
        reduced_row_echelon_form(&mut m);
        assert_eq!(m, vec![vec![rat(1), rat(0)], vec![rat(0), rat(1)]]);
    }

    #[test]
    fn null_space_vectors_annihilate_the_matrix() {
        // x + y - z = 0 observations: rows are (x, y, z) samples of the
        // plane z = x + y.
        let m: Matrix<BigRational> = vec![
            vec![rat(1), rat(0), rat(1)],
            vec![rat(0), rat(1), rat(1)],
            vec![rat(2), rat(3), rat(5)],
        ];
        let basis = null_space(&m);
        assert_eq!(basis.len(), 1);
        for v in &basis {
            let product = matrix_times_vector(&m, v);
            assert!(product.iter().all(|x| x.is_zero()));
        }
    }

    #[test]
    fn rat_to_int_normalises_sign_and_gcd() {
        let vec = vec![
            BigRational::new(BigInt::from(-2), BigInt::from(4)),
            BigRational::new(BigInt::from(1), BigInt::from(1)),
            BigRational::zero(),
        ];
        assert_eq!(
            rat_to_int(&vec),
            vec![BigInt::from(1), BigInt::from(-2), BigInt::from(0)]
        );
    }

    #[test]
    fn full_rank_matrix_has_empty_null_space() {
        let m: Matrix<BigRational> = vec![vec![rat(1), rat(0)], vec![rat(0), rat(1)]];
        assert!(null_space(&m).is_empty());
    }
}
