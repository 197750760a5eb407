//! Mixed-integer outer approximation of SO(3) over the nine entries of a rotation matrix.
//!
//! Every entry `x ∈ [-1, 1]` is written as a convex combination of the breakpoints
//! `φ_k = -1 + k / N`, `k = 0..2N`, with SOS2 weights `λ` (at most two adjacent weights non-zero,
//! enforced with binaries). The same weights give `w = Σ λ_k φ_k²`, the secant overestimate of `x²`
//! on the active interval, so `Σ w ≥ 1` over a row or column is a valid piecewise linear cut for
//! the unit length of that row or column. Finer intervals give a smaller secant and a tighter cut.
//! Unit length upper bounds and the orthogonality of row and column pairs are added as norm bounds,
//! either as Lorentz cones or as their polyhedral outer approximations.

use std::f64::consts::SQRT_2;

use nalgebra::{DVector, Matrix3};

use crate::error::IkResult;
use crate::global_inverse_kinematics::{IntervalBinning, Options};
use crate::mathematical_program::{LinearExpression, MathematicalProgram, Variable};

/// Breakpoints `-1, -1 + 1/N, ..., 1` for `N` intervals per half axis.
pub fn breakpoints(num_intervals_per_half_axis: usize) -> Vec<f64> {
    let n = num_intervals_per_half_axis as f64;
    (0..=2 * num_intervals_per_half_axis).map(|k| -1.0 + k as f64 / n).collect()
}

pub fn gray_code(index: usize) -> usize {
    index ^ (index >> 1)
}

/// Bits needed to give every interval its own code.
pub fn num_code_bits(num_intervals: usize) -> usize {
    let mut bits = 1;
    while (1 << bits) < num_intervals {
        bits += 1;
    }
    bits
}

/// Unit directions of `{-1, 0, 1}^dim` without zero. `dᵀe <= r` over all of them contains the ball.
fn polyhedral_directions(dim: usize) -> Vec<DVector<f64>> {
    let count = 3usize.pow(dim as u32);
    (0..count)
        .filter_map(|mut code| {
            let mut d = DVector::zeros(dim);
            for i in 0..dim {
                d[i] = (code % 3) as f64 - 1.0;
                code /= 3;
            }
            let norm = d.norm();
            (norm > 0.0).then(|| d / norm)
        })
        .collect()
}

/// `|expressions| <= radius`, as a Lorentz cone or a polyhedral outer approximation.
pub fn add_norm_bound(
    prog: &mut MathematicalProgram,
    expressions: Vec<LinearExpression>,
    radius: f64,
    polyhedral: bool,
) -> IkResult<()> {
    if !polyhedral {
        let mut rows = Vec::with_capacity(expressions.len() + 1);
        rows.push(LinearExpression::constant(radius));
        rows.extend(expressions);
        return prog.add_lorentz_cone_constraint(rows);
    }
    for d in polyhedral_directions(expressions.len()) {
        let projection = expressions
            .iter()
            .zip(d.iter())
            .filter(|(_, c)| **c != 0.0)
            .fold(LinearExpression::new(), |sum, (e, c)| sum + e.clone() * *c);
        prog.add_linear_constraint(projection, f64::NEG_INFINITY, radius)?;
    }
    Ok(())
}

/// SOS2 weights and binaries of one matrix entry.
#[derive(Clone, Debug)]
struct EntryBinning {
    lambda: Vec<Variable>,
    binaries: Vec<Variable>,
}

/// Relaxation variables of one rotation matrix, entries in row major order.
#[derive(Clone, Debug)]
pub struct RotationRelaxation {
    entries: Vec<EntryBinning>,
    num_intervals_per_half_axis: usize,
    interval_binning: IntervalBinning,
}

impl RotationRelaxation {
    /// Adds the relaxation of `R` (entries already bounded to [-1, 1]) to `prog`.
    pub fn add(prog: &mut MathematicalProgram, R: &Matrix3<Variable>, options: &Options, name: &str) -> IkResult<Self> {
        let N = options.num_intervals_per_half_axis;
        let phi = breakpoints(N);
        let polyhedral = options.is_polyhedral();
        let mut entries = Vec::with_capacity(9);
        let mut w = Matrix3::from_element(LinearExpression::new());
        for i in 0..3 {
            for j in 0..3 {
                let entry_name = format!("{}({},{})", name, i, j);
                let (entry, w_ij) = add_entry(prog, R[(i, j)], &phi, options.interval_binning, &entry_name)?;
                entries.push(entry);
                w[(i, j)] = w_ij;
            }
        }

        for i in 0..3 {
            let row_sum = (0..3).fold(LinearExpression::new(), |sum, j| sum + w[(i, j)].clone());
            prog.add_linear_constraint(row_sum, 1.0, f64::INFINITY)?;
            let column_sum = (0..3).fold(LinearExpression::new(), |sum, j| sum + w[(j, i)].clone());
            prog.add_linear_constraint(column_sum, 1.0, f64::INFINITY)?;

            add_norm_bound(prog, row(R, i), 1.0, polyhedral)?;
            add_norm_bound(prog, column(R, i), 1.0, polyhedral)?;
        }

        // Orthonormal u, v have |u + v| = |u - v| = √2.
        for (a, b) in [(0, 1), (0, 2), (1, 2)] {
            for sign in [1.0, -1.0] {
                let rows = combine(&row(R, a), &row(R, b), sign);
                add_norm_bound(prog, rows, SQRT_2, polyhedral)?;
                let columns = combine(&column(R, a), &column(R, b), sign);
                add_norm_bound(prog, columns, SQRT_2, polyhedral)?;
            }
        }

        Ok(RotationRelaxation { entries, num_intervals_per_half_axis: N, interval_binning: options.interval_binning })
    }

    /// Values of the weights and binaries consistent with the entries of `R`.
    pub fn initial_guess(&self, R: &Matrix3<f64>) -> Vec<(Variable, f64)> {
        let N = self.num_intervals_per_half_axis;
        let phi = breakpoints(N);
        let mut guess = Vec::new();
        for (e, entry) in self.entries.iter().enumerate() {
            let x = R[(e / 3, e % 3)].clamp(-1.0, 1.0);
            let interval = (((x + 1.0) * N as f64).floor() as usize).min(2 * N - 1);
            let lambda_low = (phi[interval + 1] - x) * N as f64;
            for (k, v) in entry.lambda.iter().enumerate() {
                let value = if k == interval {
                    lambda_low
                } else if k == interval + 1 {
                    1.0 - lambda_low
                } else {
                    0.0
                };
                guess.push((*v, value));
            }
            match self.interval_binning {
                IntervalBinning::Linear => {
                    for (k, v) in entry.binaries.iter().enumerate() {
                        guess.push((*v, if k == interval { 1.0 } else { 0.0 }));
                    }
                }
                IntervalBinning::Logarithmic => {
                    let code = gray_code(interval);
                    for (bit, v) in entry.binaries.iter().enumerate() {
                        guess.push((*v, ((code >> bit) & 1) as f64));
                    }
                }
            }
        }
        guess
    }

    pub fn num_binaries(&self) -> usize {
        self.entries.iter().map(|e| e.binaries.len()).sum()
    }
}

fn row(R: &Matrix3<Variable>, i: usize) -> Vec<LinearExpression> {
    (0..3).map(|j| LinearExpression::from(R[(i, j)])).collect()
}

fn column(R: &Matrix3<Variable>, j: usize) -> Vec<LinearExpression> {
    (0..3).map(|i| LinearExpression::from(R[(i, j)])).collect()
}

fn combine(u: &[LinearExpression], v: &[LinearExpression], sign: f64) -> Vec<LinearExpression> {
    u.iter().zip(v).map(|(a, b)| a.clone() + b.clone() * sign).collect()
}

/// SOS2 weights of `x` over `phi`. Returns the binning and the expression of `w`.
fn add_entry(
    prog: &mut MathematicalProgram,
    x: Variable,
    phi: &[f64],
    interval_binning: IntervalBinning,
    name: &str,
) -> IkResult<(EntryBinning, LinearExpression)> {
    let num_intervals = phi.len() - 1;
    let lambda = prog.new_continuous_variables(phi.len(), &format!("lambda_{}", name));
    prog.add_bounding_box_constraint(&DVector::zeros(phi.len()), &DVector::from_element(phi.len(), 1.0), &lambda)?;
    prog.add_linear_equality_constraint(LinearExpression::sum(lambda.iter().map(|l| (*l, 1.0))), 1.0)?;
    let interpolated = LinearExpression::sum(lambda.iter().zip(phi).map(|(l, p)| (*l, *p)));
    prog.add_linear_equality_constraint(LinearExpression::from(x) - interpolated, 0.0)?;
    let w = LinearExpression::sum(lambda.iter().zip(phi).map(|(l, p)| (*l, p * p)));

    let binaries = match interval_binning {
        IntervalBinning::Linear => {
            let z = prog.new_binary_variables(num_intervals, &format!("z_{}", name));
            prog.add_linear_equality_constraint(LinearExpression::sum(z.iter().map(|v| (*v, 1.0))), 1.0)?;
            for (k, l) in lambda.iter().enumerate() {
                // λ_k may be positive only if one of its adjacent intervals is active.
                let mut expression = LinearExpression::from(*l);
                if k > 0 {
                    expression.add_term(z[k - 1], -1.0);
                }
                if k < num_intervals {
                    expression.add_term(z[k], -1.0);
                }
                prog.add_linear_constraint(expression, f64::NEG_INFINITY, 0.0)?;
            }
            z
        }
        IntervalBinning::Logarithmic => {
            let bits = num_code_bits(num_intervals);
            let y = prog.new_binary_variables(bits, &format!("y_{}", name));
            for (bit, y_bit) in y.iter().enumerate() {
                let bit_of = |interval: usize| (gray_code(interval) >> bit) & 1;
                let mut ones = LinearExpression::new();
                let mut zeros = LinearExpression::new();
                for (k, l) in lambda.iter().enumerate() {
                    let adjacent: Vec<usize> = [k.checked_sub(1), (k < num_intervals).then_some(k)]
                        .into_iter()
                        .flatten()
                        .collect();
                    if adjacent.iter().all(|j| bit_of(*j) == 1) {
                        ones.add_term(*l, 1.0);
                    }
                    if adjacent.iter().all(|j| bit_of(*j) == 0) {
                        zeros.add_term(*l, 1.0);
                    }
                }
                // Σ_{all adjacent codes have the bit} λ <= y, Σ_{none has it} λ <= 1 - y
                prog.add_linear_constraint(ones.term(*y_bit, -1.0), f64::NEG_INFINITY, 0.0)?;
                prog.add_linear_constraint(zeros.term(*y_bit, 1.0), f64::NEG_INFINITY, 1.0)?;
            }
            for unused in num_intervals..(1 << bits) {
                let code = gray_code(unused);
                // At least one bit must differ from the unused code.
                let mut differs = LinearExpression::new();
                for (bit, y_bit) in y.iter().enumerate() {
                    if (code >> bit) & 1 == 1 {
                        differs.add_term(*y_bit, -1.0);
                        differs.add_constant(1.0);
                    } else {
                        differs.add_term(*y_bit, 1.0);
                    }
                }
                prog.add_linear_constraint(differs, 1.0, f64::INFINITY)?;
            }
            y
        }
    };
    Ok((EntryBinning { lambda, binaries }, w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_inverse_kinematics::RelaxationApproach;
    use nalgebra::{Rotation3, Vector3};

    #[test]
    fn test_breakpoints_and_codes() {
        assert_eq!(breakpoints(2), vec![-1.0, -0.5, 0.0, 0.5, 1.0]);
        assert_eq!(num_code_bits(2), 1);
        assert_eq!(num_code_bits(4), 2);
        assert_eq!(num_code_bits(6), 3);
        // Adjacent Gray codes differ in one bit.
        for j in 0..7 {
            assert_eq!((gray_code(j) ^ gray_code(j + 1)).count_ones(), 1);
        }
        assert_eq!(polyhedral_directions(3).len(), 26);
    }

    fn relaxed_program(options: &Options) -> (MathematicalProgram, Matrix3<Variable>, RotationRelaxation) {
        let mut prog = MathematicalProgram::new();
        let vars = prog.new_continuous_variables(9, "R");
        let R = Matrix3::from_fn(|i, j| vars[3 * i + j]);
        prog.add_bounding_box_constraint(&DVector::from_element(9, -1.0), &DVector::from_element(9, 1.0), &vars).unwrap();
        let relaxation = RotationRelaxation::add(&mut prog, &R, options, "R").unwrap();
        (prog, R, relaxation)
    }

    fn guess_vector(prog: &MathematicalProgram, R_vars: &Matrix3<Variable>, relaxation: &RotationRelaxation, R: &Matrix3<f64>) -> DVector<f64> {
        let mut x = DVector::zeros(prog.num_vars());
        for i in 0..3 {
            for j in 0..3 {
                x[R_vars[(i, j)].index()] = R[(i, j)];
            }
        }
        for (v, value) in relaxation.initial_guess(R) {
            x[v.index()] = value;
        }
        x
    }

    #[test]
    fn test_rotations_are_feasible() {
        let rotations = [
            Rotation3::identity(),
            Rotation3::from_euler_angles(0.3, -1.1, 2.0),
            Rotation3::from_axis_angle(&Vector3::x_axis(), std::f64::consts::FRAC_PI_2),
        ];
        for binning in [IntervalBinning::Linear, IntervalBinning::Logarithmic] {
            for N in [1, 2, 3] {
                let options = Options { num_intervals_per_half_axis: N, interval_binning: binning, ..Options::default() };
                let (prog, R_vars, relaxation) = relaxed_program(&options);
                for rotation in &rotations {
                    let x = guess_vector(&prog, &R_vars, &relaxation, rotation.matrix());
                    let violation = prog.max_violation(&x).unwrap();
                    assert!(violation < 1e-9, "{:?} N = {}: violation {}", binning, N, violation);
                }
            }
        }
    }

    #[test]
    fn test_shrunken_matrix_is_cut_off() {
        // 0.5 I satisfies the norm bounds but not the unit length cut of any binning.
        let options = Options { approach: RelaxationApproach::Linear, ..Options::default() };
        let (prog, R_vars, relaxation) = relaxed_program(&options);
        let x = guess_vector(&prog, &R_vars, &relaxation, &(Matrix3::identity() * 0.5));
        assert!(prog.max_violation(&x).unwrap() > 0.1);
    }
}
