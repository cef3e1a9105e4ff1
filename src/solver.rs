// TDOA position solver: weighted nonlinear least squares over arrival-time
// differences in the canonical timebase, Levenberg-Marquardt in ECEF.

use std::time::Instant;

use nalgebra::{DMatrix, DVector, Matrix3};

use crate::constants::{
    ALTITUDE_CONSTRAINT_VAR, C_AIR, GEOMETRY_MAX_COND, GEOMETRY_MAX_DOP, MAX_ALT, MIN_ALT,
    SOLVER_LAMBDA0, SOLVER_MAX_CHI2_DOF, SOLVER_MAX_HORIZ_ERR, SOLVER_MAX_ITER,
    SOLVER_STEP_TOL, SOLVER_WALL_BUDGET,
};
use crate::errors::{CoreError, Result};
use crate::geodesy;

/// One receiver's contribution to a closed group, in the canonical timebase.
#[derive(Debug, Clone)]
pub struct SolverMeasurement {
    pub receiver: usize,
    pub position: [f64; 3],
    /// Arrival time (s, canonical timebase).
    pub t: f64,
    /// Timing variance (s^2): translation variance plus receiver noise.
    pub variance: f64,
    /// Raw session tick, carried through to the output record.
    pub tick: u64,
}

/// Per-receiver residual in the accepted fix.
#[derive(Debug, Clone, Copy)]
pub struct Contribution {
    pub receiver: usize,
    pub tick: u64,
    /// Timing residual (s): measured minus modelled arrival difference.
    pub residual: f64,
}

/// An accepted position fix.
#[derive(Debug, Clone)]
pub struct Fix {
    pub icao24: u32,
    pub position: [f64; 3],
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    /// ECEF position covariance (m^2).
    pub covariance: [[f64; 3]; 3],
    pub chi2_dof: f64,
    /// Estimated transmission time (s, canonical timebase).
    pub t0: f64,
    /// Wall-clock estimate of the transmission.
    pub wall: f64,
    pub contributions: Vec<Contribution>,
}

/// Solve a closed group for the transmitter position.
///
/// The unknown transmission time is eliminated by differencing against the
/// reference receiver (the one with the smallest timing variance), leaving
/// M-1 TDOA equations plus an optional altitude equality constraint.
pub fn solve(
    icao24: u32,
    measurements: &[SolverMeasurement],
    altitude: Option<f64>,
    initial_guess: Option<[f64; 3]>,
    wall: f64,
) -> Result<Fix> {
    let m = measurements.len();
    let n_res = m - 1 + usize::from(altitude.is_some());
    if m < 3 || n_res < 3 {
        return Err(CoreError::PoorGeometry { cond: f64::INFINITY });
    }

    let reference = measurements
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.variance.partial_cmp(&b.1.variance).unwrap())
        .map(|(i, _)| i)
        .unwrap();

    check_baselines(measurements, reference)?;

    let mut x = match initial_guess {
        Some(g) => g,
        None => centroid_on_ellipsoid(measurements, altitude),
    };

    check_dop(measurements, reference, altitude.is_some(), x)?;

    let started = Instant::now();
    let mut lambda = SOLVER_LAMBDA0;
    let mut iterations = 0;

    let (mut res, mut jac) = residuals_and_jacobian(measurements, reference, altitude, x);
    let mut cost = res.norm_squared();

    for iter in 0..SOLVER_MAX_ITER {
        iterations = iter + 1;
        if started.elapsed().as_secs_f64() > SOLVER_WALL_BUDGET {
            return Err(CoreError::NotConverged { iterations });
        }

        let jt = jac.transpose();
        let jtj = &jt * &jac;
        let jtr = &jt * &res;

        let mut stepped = false;
        let mut converged = false;
        for _ in 0..10 {
            let mut damped = jtj.clone();
            for d in 0..3 {
                damped[(d, d)] += lambda * jtj[(d, d)].max(1e-12);
            }
            let Some(inv) = damped.try_inverse() else {
                lambda *= 10.0;
                continue;
            };
            let step = -(inv * &jtr);

            if step.norm() < SOLVER_STEP_TOL {
                // Already at the optimum to within tolerance.
                stepped = true;
                converged = true;
                break;
            }

            let trial = [x[0] + step[0], x[1] + step[1], x[2] + step[2]];
            let (trial_res, trial_jac) =
                residuals_and_jacobian(measurements, reference, altitude, trial);
            let trial_cost = trial_res.norm_squared();

            if trial_cost < cost {
                x = trial;
                res = trial_res;
                jac = trial_jac;
                cost = trial_cost;
                lambda = (lambda / 10.0).max(1e-12);
                stepped = true;
                break;
            }
            lambda *= 10.0;
            if lambda > 1e10 {
                return Err(CoreError::NotConverged { iterations });
            }
        }

        if !stepped {
            return Err(CoreError::NotConverged { iterations });
        }
        if converged {
            break;
        }
        if iterations == SOLVER_MAX_ITER {
            return Err(CoreError::NotConverged { iterations });
        }
    }

    let (lat, lon, alt) = geodesy::ecef_to_llh(x);
    if altitude.is_none() && !(MIN_ALT..=MAX_ALT).contains(&alt) {
        return Err(CoreError::OutOfBounds { what: "altitude" });
    }

    let dof = n_res.saturating_sub(3).max(1);
    let chi2_dof = cost / dof as f64;
    if chi2_dof > SOLVER_MAX_CHI2_DOF {
        return Err(CoreError::HighResidual { chi2_dof });
    }

    // Covariance of the weighted problem; residuals are already sigma-scaled.
    let jtj = jac.transpose() * &jac;
    let cov = jtj
        .try_inverse()
        .ok_or(CoreError::PoorGeometry { cond: f64::INFINITY })?;
    check_horizontal_error(&cov, x)?;

    let mut covariance = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            covariance[i][j] = cov[(i, j)];
        }
    }

    let ref_m = &measurements[reference];
    let d_ref = geodesy::distance(x, ref_m.position);
    let t0 = ref_m.t - d_ref / C_AIR;

    let contributions = measurements
        .iter()
        .map(|meas| Contribution {
            receiver: meas.receiver,
            tick: meas.tick,
            residual: (meas.t - ref_m.t)
                - (geodesy::distance(x, meas.position) - d_ref) / C_AIR,
        })
        .collect();

    Ok(Fix {
        icao24,
        position: x,
        lat,
        lon,
        alt,
        covariance,
        chi2_dof,
        t0,
        wall,
        contributions,
    })
}

/// Sigma-normalized residual vector and its Jacobian at `x`.
fn residuals_and_jacobian(
    measurements: &[SolverMeasurement],
    reference: usize,
    altitude: Option<f64>,
    x: [f64; 3],
) -> (DVector<f64>, DMatrix<f64>) {
    let m = measurements.len();
    let n_res = m - 1 + usize::from(altitude.is_some());
    let mut res = DVector::zeros(n_res);
    let mut jac = DMatrix::zeros(n_res, 3);

    let ref_m = &measurements[reference];
    let d_ref = geodesy::distance(x, ref_m.position);
    let u_ref = unit_from(ref_m.position, x);

    let mut row = 0;
    for (i, meas) in measurements.iter().enumerate() {
        if i == reference {
            continue;
        }
        let d_i = geodesy::distance(x, meas.position);
        let u_i = unit_from(meas.position, x);

        let sigma = C_AIR * (meas.variance + ref_m.variance).sqrt();
        res[row] = (C_AIR * (meas.t - ref_m.t) - (d_i - d_ref)) / sigma;
        for d in 0..3 {
            jac[(row, d)] = -(u_i[d] - u_ref[d]) / sigma;
        }
        row += 1;
    }

    if let Some(h) = altitude {
        let sigma = ALTITUDE_CONSTRAINT_VAR.sqrt();
        res[row] = (h - geodesy::ellipsoid_height(x)) / sigma;
        let up = geodesy::up_vector(x);
        for d in 0..3 {
            jac[(row, d)] = -up[d] / sigma;
        }
    }

    (res, jac)
}

/// Reject degenerate receiver geometry before iterating: the baseline
/// matrix of a collinear layout is rank deficient and its condition number
/// explodes.
fn check_baselines(measurements: &[SolverMeasurement], reference: usize) -> Result<()> {
    let ref_pos = measurements[reference].position;
    let mut btb = Matrix3::<f64>::zeros();
    for (i, meas) in measurements.iter().enumerate() {
        if i == reference {
            continue;
        }
        let b = [
            meas.position[0] - ref_pos[0],
            meas.position[1] - ref_pos[1],
            meas.position[2] - ref_pos[2],
        ];
        for r in 0..3 {
            for c in 0..3 {
                btb[(r, c)] += b[r] * b[c];
            }
        }
    }

    // Collinearity is a rank-1 condition, so compare the two largest
    // singular values. Ground arrays are always close to coplanar; a
    // plane of receivers is fine, a line is not.
    let mut eig: Vec<f64> = btb.symmetric_eigenvalues().iter().copied().collect();
    eig.sort_by(|a, b| b.partial_cmp(a).unwrap());
    let cond = if eig[1] > 0.0 {
        (eig[0] / eig[1]).sqrt()
    } else {
        f64::INFINITY
    };
    if cond > GEOMETRY_MAX_COND {
        return Err(CoreError::PoorGeometry { cond });
    }
    Ok(())
}

/// Dilution of precision from the linearized geometry at the initial guess.
fn check_dop(
    measurements: &[SolverMeasurement],
    reference: usize,
    with_altitude: bool,
    x: [f64; 3],
) -> Result<()> {
    let u_ref = unit_from(measurements[reference].position, x);
    let mut gtg = Matrix3::<f64>::zeros();
    for (i, meas) in measurements.iter().enumerate() {
        if i == reference {
            continue;
        }
        let u = unit_from(meas.position, x);
        let g = [u[0] - u_ref[0], u[1] - u_ref[1], u[2] - u_ref[2]];
        for r in 0..3 {
            for c in 0..3 {
                gtg[(r, c)] += g[r] * g[c];
            }
        }
    }
    if with_altitude {
        let up = geodesy::up_vector(x);
        for r in 0..3 {
            for c in 0..3 {
                gtg[(r, c)] += up[r] * up[c];
            }
        }
    }

    let dop = match gtg.try_inverse() {
        Some(inv) => inv.trace().max(0.0).sqrt(),
        None => f64::INFINITY,
    };
    if dop > GEOMETRY_MAX_DOP {
        return Err(CoreError::PoorGeometry { cond: dop });
    }
    Ok(())
}

fn check_horizontal_error(cov: &DMatrix<f64>, x: [f64; 3]) -> Result<()> {
    let (east, north) = geodesy::horizontal_basis(x);
    let project = |a: &[f64; 3], b: &[f64; 3]| -> f64 {
        let mut acc = 0.0;
        for r in 0..3 {
            for c in 0..3 {
                acc += a[r] * cov[(r, c)] * b[c];
            }
        }
        acc
    };
    let ee = project(&east, &east);
    let nn = project(&north, &north);
    let en = project(&east, &north);

    // Larger eigenvalue of the 2x2 horizontal covariance.
    let mean = 0.5 * (ee + nn);
    let det = ee * nn - en * en;
    let semi_major_sq = mean + (mean * mean - det).max(0.0).sqrt();
    if semi_major_sq.max(0.0).sqrt() > SOLVER_MAX_HORIZ_ERR {
        return Err(CoreError::OutOfBounds { what: "horizontal covariance" });
    }
    Ok(())
}

fn centroid_on_ellipsoid(measurements: &[SolverMeasurement], altitude: Option<f64>) -> [f64; 3] {
    let mut c = [0.0; 3];
    for meas in measurements {
        for d in 0..3 {
            c[d] += meas.position[d];
        }
    }
    for d in &mut c {
        *d /= measurements.len() as f64;
    }
    let (lat, lon, _) = geodesy::ecef_to_llh(c);
    // Without an altitude hint, start well above the receiver plane: a
    // guess inside it has no vertical sensitivity to iterate out of.
    geodesy::llh_to_ecef(lat, lon, altitude.unwrap_or(8000.0))
}

#[inline]
fn unit_from(from: [f64; 3], to: [f64; 3]) -> [f64; 3] {
    let d = [to[0] - from[0], to[1] - from[1], to[2] - from[2]];
    let n = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt().max(1e-9);
    [d[0] / n, d[1] / n, d[2] / n]
}

#[cfg(test)]
mod tests {
    use super::*;

    const REF_LAT: f64 = 47.0;
    const REF_LON: f64 = 8.0;

    fn receiver_at(enu: [f64; 3]) -> [f64; 3] {
        geodesy::enu_to_ecef(REF_LAT, REF_LON, 0.0, enu)
    }

    fn measurements_for(
        tx: [f64; 3],
        receivers: &[[f64; 3]],
        variance: f64,
    ) -> Vec<SolverMeasurement> {
        receivers
            .iter()
            .enumerate()
            .map(|(i, &p)| SolverMeasurement {
                receiver: i + 1,
                position: p,
                t: geodesy::distance(tx, p) / C_AIR,
                variance,
                tick: (i as u64 + 1) * 1000,
            })
            .collect()
    }

    fn square_layout() -> Vec<[f64; 3]> {
        vec![
            receiver_at([0.0, 0.0, 0.0]),
            receiver_at([30_000.0, 0.0, 0.0]),
            receiver_at([0.0, 30_000.0, 0.0]),
            receiver_at([15_000.0, 15_000.0, 0.0]),
        ]
    }

    #[test]
    fn recovers_position_from_exact_times() {
        let tx = geodesy::enu_to_ecef(REF_LAT, REF_LON, 0.0, [10_000.0, 10_000.0, 3_000.0]);
        let meas = measurements_for(tx, &square_layout(), 1e-15);

        let fix = solve(0xabcdef, &meas, None, None, 0.0).unwrap();
        assert!(
            geodesy::distance(fix.position, tx) < 50.0,
            "error {} m",
            geodesy::distance(fix.position, tx)
        );
        assert_eq!(fix.contributions.len(), 4);
        // t0 was 0 by construction.
        assert!(fix.t0.abs() < 1e-6, "t0 {}", fix.t0);
    }

    #[test]
    fn altitude_constraint_allows_three_receivers() {
        let tx = geodesy::enu_to_ecef(REF_LAT, REF_LON, 0.0, [10_000.0, 12_000.0, 5_000.0]);
        let receivers = vec![
            receiver_at([0.0, 0.0, 0.0]),
            receiver_at([30_000.0, 0.0, 150.0]),
            receiver_at([0.0, 30_000.0, 80.0]),
        ];
        let meas = measurements_for(tx, &receivers, 1e-15);
        let alt = geodesy::ellipsoid_height(tx);

        let fix = solve(0x123456, &meas, Some(alt), None, 0.0).unwrap();
        assert!(
            geodesy::distance(fix.position, tx) < 100.0,
            "error {} m",
            geodesy::distance(fix.position, tx)
        );
    }

    #[test]
    fn three_receivers_without_altitude_is_underdetermined() {
        let tx = geodesy::enu_to_ecef(REF_LAT, REF_LON, 0.0, [10_000.0, 12_000.0, 5_000.0]);
        let receivers = vec![
            receiver_at([0.0, 0.0, 0.0]),
            receiver_at([30_000.0, 0.0, 0.0]),
            receiver_at([0.0, 30_000.0, 0.0]),
        ];
        let meas = measurements_for(tx, &receivers, 1e-15);
        assert!(matches!(
            solve(1, &meas, None, None, 0.0),
            Err(CoreError::PoorGeometry { .. })
        ));
    }

    #[test]
    fn collinear_receivers_are_rejected() {
        let tx = geodesy::enu_to_ecef(REF_LAT, REF_LON, 0.0, [10_000.0, 8_000.0, 5_000.0]);
        let receivers = vec![
            receiver_at([0.0, 0.0, 0.0]),
            receiver_at([10_000.0, 0.0, 0.0]),
            receiver_at([20_000.0, 0.0, 0.0]),
            receiver_at([30_000.0, 0.0, 0.0]),
        ];
        let meas = measurements_for(tx, &receivers, 1e-15);
        assert!(matches!(
            solve(1, &meas, None, None, 0.0),
            Err(CoreError::PoorGeometry { .. })
        ));
    }

    #[test]
    fn solver_is_idempotent_on_its_own_output() {
        let tx = geodesy::enu_to_ecef(REF_LAT, REF_LON, 0.0, [10_000.0, 10_000.0, 3_000.0]);
        let meas = measurements_for(tx, &square_layout(), 1e-15);

        let first = solve(1, &meas, None, None, 0.0).unwrap();
        let second = solve(1, &meas, None, Some(first.position), 0.0).unwrap();
        assert!(
            geodesy::distance(first.position, second.position) < 0.01,
            "moved {} m",
            geodesy::distance(first.position, second.position)
        );
    }

    #[test]
    fn corrupt_timing_raises_residual() {
        let tx = geodesy::enu_to_ecef(REF_LAT, REF_LON, 0.0, [10_000.0, 10_000.0, 3_000.0]);
        let mut meas = measurements_for(tx, &square_layout(), 1e-14);
        meas.push(SolverMeasurement {
            receiver: 9,
            position: receiver_at([25_000.0, 5_000.0, 0.0]),
            t: geodesy::distance(tx, receiver_at([25_000.0, 5_000.0, 0.0])) / C_AIR + 5e-6,
            variance: 1e-14,
            tick: 9000,
        });
        assert!(matches!(
            solve(1, &meas, None, Some(tx), 0.0),
            Err(CoreError::HighResidual { .. })
        ));
    }

    #[test]
    fn implausible_altitude_is_out_of_bounds() {
        // A transmitter at 25 km is above anything we track.
        let tx = geodesy::enu_to_ecef(REF_LAT, REF_LON, 0.0, [10_000.0, 10_000.0, 25_000.0]);
        let meas = measurements_for(tx, &square_layout(), 1e-15);
        assert!(matches!(
            solve(1, &meas, None, Some(tx), 0.0),
            Err(CoreError::OutOfBounds { what: "altitude" })
        ));
    }

    #[test]
    fn residual_stays_flat_with_extra_consistent_receiver() {
        let tx = geodesy::enu_to_ecef(REF_LAT, REF_LON, 0.0, [10_000.0, 10_000.0, 3_000.0]);
        let mut receivers = square_layout();
        let base = solve(1, &measurements_for(tx, &receivers, 1e-14), None, None, 0.0).unwrap();

        // A more distant receiver with consistent timing must not blow up
        // the goodness of fit.
        receivers.push(receiver_at([60_000.0, -20_000.0, 200.0]));
        let more = solve(1, &measurements_for(tx, &receivers, 1e-14), None, None, 0.0).unwrap();
        assert!(more.chi2_dof <= base.chi2_dof + 1.0, "chi2 {} -> {}", base.chi2_dof, more.chi2_dof);
    }
}
