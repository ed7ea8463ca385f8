//! Optimal-estimation retrieval.
//!
//! Levenberg-Marquardt damped Gauss-Newton iteration of the forward model
//! against measured radiances, with an a priori covariance regularization
//! and a posterior error and information-content analysis.

use std::fs;
use std::io::{BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use log::{info, warn};
use nalgebra::{Cholesky, DMatrix, DVector};

use crate::atmosphere::{write_atm, AtmFormat, Atmosphere};
use crate::config::{Config, RetrievalConfig};
use crate::errors::{LimbraError, Result};
use crate::forward::{formod_with, ForwardEngine};
use crate::geo::geo2cart;
use crate::jacobian::kernel;
use crate::matrix::{invert_sym, weighted_normal, write_matrix, Axis, Sort};
use crate::observations::{write_obs, ObsFormat, Observations};
use crate::statevec::{atm2x, layout, obs2y, x2atm, Quantity, StateSlot};
use crate::tables::TableStore;
use crate::timing::Timers;

/// Posterior analysis products.
pub struct Analysis {
    /// Posterior covariance S_x.
    pub cov: DMatrix<f64>,
    /// Correlation matrix of S_x.
    pub corr: DMatrix<f64>,
    /// Gain matrix G = S_x K^T S_eps^-1.
    pub gain: DMatrix<f64>,
    /// Averaging kernel A = G K.
    pub avk: DMatrix<f64>,
    /// Total degrees of freedom for signal, trace(A).
    pub dof_total: f64,
    /// Degrees of freedom per quantity.
    pub dof: Vec<(Quantity, f64)>,
    /// Vertical resolution per state element [km] (NaN for scalars).
    pub vres: Vec<f64>,
    /// Posterior standard deviation per state element.
    pub std_total: DVector<f64>,
    /// Contribution of instrument noise.
    pub std_noise: DVector<f64>,
    /// Contribution of forward-model error.
    pub std_formod: DVector<f64>,
}

/// Result of one retrieval.
pub struct RetrievalResult {
    /// Final atmospheric state.
    pub atm: Atmosphere,
    /// Final forward-model radiances.
    pub obs: Observations,
    /// Normalized cost chi^2/m per accepted iterate (index 0 = a priori).
    pub chi2_history: Vec<f64>,
    /// Number of outer iterations carried out.
    pub iterations: usize,
    /// Whether the step-size test converged within the iteration budget.
    pub converged: bool,
    /// Posterior analysis, when enabled.
    pub analysis: Option<Analysis>,
}

/// Cost function chi^2/m.
fn cost_function(
    dx: &DVector<f64>,
    dy: &DVector<f64>,
    s_a_inv: &DMatrix<f64>,
    sig_eps_inv: &[f64],
) -> f64 {
    let chisq_meas: f64 = dy
        .iter()
        .zip(sig_eps_inv)
        .map(|(d, w)| (d * w) * (d * w))
        .sum();
    let chisq_apr = (dx.transpose() * s_a_inv * dx)[(0, 0)];
    (chisq_meas + chisq_apr) / dy.len() as f64
}

/// A priori standard deviation of one state element.
fn sigma_apr(ret: &RetrievalConfig, slot: &StateSlot, apr_value: f64) -> f64 {
    let sigma = match slot.0 {
        Quantity::Pressure => ret.err_p / 100.0 * apr_value.abs(),
        Quantity::Temperature => ret.err_t,
        Quantity::Vmr(ig) => ret.err_q[ig] / 100.0 * apr_value.abs(),
        Quantity::Extinction(iw) => ret.err_k[iw],
        Quantity::CloudTop => ret.err_clz,
        Quantity::CloudDepth => ret.err_cldz,
        Quantity::CloudExt(icl) => ret.err_clk[icl],
        Quantity::SurfaceTemp => ret.err_sft,
        Quantity::SurfaceEps(isf) => ret.err_sfeps[isf],
    };
    // Keep the covariance positive definite for quantities with vanishing
    // a priori values.
    sigma.max(1e-30)
}

/// Correlation lengths (vertical [km], horizontal [km]) of one quantity.
fn corr_lengths(ret: &RetrievalConfig, quantity: Quantity) -> (f64, f64) {
    match quantity {
        Quantity::Pressure => (ret.err_p_cz, ret.err_p_ch),
        Quantity::Temperature => (ret.err_t_cz, ret.err_t_ch),
        Quantity::Vmr(ig) => (ret.err_q_cz[ig], ret.err_q_ch[ig]),
        Quantity::Extinction(iw) => (ret.err_k_cz[iw], ret.err_k_ch[iw]),
        _ => (-999.0, -999.0),
    }
}

/// Build the a priori covariance S_a: block diagonal per quantity with
/// exponential vertical and horizontal correlations.
fn set_cov_apr(
    ret: &RetrievalConfig,
    atm_apr: &Atmosphere,
    slots: &[StateSlot],
    x_apr: &DVector<f64>,
) -> DMatrix<f64> {
    let n = slots.len();
    let mut s_a = DMatrix::zeros(n, n);

    for i in 0..n {
        let si = sigma_apr(ret, &slots[i], x_apr[i]);
        s_a[(i, i)] = si * si;
    }

    for i in 0..n {
        let (Some(ip_i), (cz, ch)) = (slots[i].1, corr_lengths(ret, slots[i].0)) else {
            continue;
        };
        if cz <= 0.0 {
            continue;
        }
        for j in i + 1..n {
            if slots[j].0 != slots[i].0 {
                continue;
            }
            let Some(ip_j) = slots[j].1 else { continue };

            let mut rho = (-(atm_apr.z[ip_i] - atm_apr.z[ip_j]).abs() / cz).exp();
            if ch > 0.0 {
                let xi = geo2cart(0.0, atm_apr.lon[ip_i], atm_apr.lat[ip_i]);
                let xj = geo2cart(0.0, atm_apr.lon[ip_j], atm_apr.lat[ip_j]);
                rho *= (-(xi - xj).norm() / ch).exp();
            }
            let cov = (s_a[(i, i)] * s_a[(j, j)]).sqrt() * rho;
            s_a[(i, j)] = cov;
            s_a[(j, i)] = cov;
        }
    }
    s_a
}

/// Measurement error components: absolute noise, relative forward-model
/// error, and the inverse total sigma per measurement element.
fn set_cov_meas(
    ret: &RetrievalConfig,
    y_meas: &DVector<f64>,
    ida: &[usize],
) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>)> {
    let mut sig_noise = Vec::with_capacity(y_meas.len());
    let mut sig_formod = Vec::with_capacity(y_meas.len());
    let mut sig_eps_inv = Vec::with_capacity(y_meas.len());
    for (i, &id) in ida.iter().enumerate() {
        let noise = ret.err_noise[id];
        let formod = ret.err_formod[id] / 100.0 * y_meas[i].abs();
        let var = noise * noise + formod * formod;
        if var <= 0.0 {
            return Err(LimbraError::Config {
                key: format!("ERR_NOISE[{id}]"),
                reason: "zero total measurement error".to_string(),
            });
        }
        sig_noise.push(noise);
        sig_formod.push(formod);
        sig_eps_inv.push(1.0 / var.sqrt());
    }
    Ok((sig_noise, sig_formod, sig_eps_inv))
}

/// Carry out the optimal-estimation retrieval in one working directory.
///
/// Reads nothing; the caller provides the a priori atmosphere and measured
/// radiances. Writes `costs.tab`, `atm_final.tab`, `obs_final.tab` and, with
/// `write_matrix` set, the kernel and analysis matrices into `dir`.
#[allow(clippy::too_many_arguments)]
pub fn optimal_estimation(
    cfg: &Config,
    ret: &RetrievalConfig,
    tbl: &TableStore,
    dir: &Utf8Path,
    obs_meas: &Observations,
    atm_apr: &Atmosphere,
    engine: Option<&dyn ForwardEngine>,
    timers: &mut Timers,
) -> Result<RetrievalResult> {
    timers.start("retrieval");

    let slots = layout(cfg, atm_apr);
    let n = slots.len();
    let m = obs_meas.nr() * cfg.nd();
    if n == 0 || m == 0 {
        return Err(LimbraError::Config {
            key: "RET".to_string(),
            reason: format!("check problem definition (m = {m}, n = {n})"),
        });
    }
    info!("Problem size: m = {m} / n = {n}");

    // Initial state: forward model at the a priori.
    let mut atm_i = atm_apr.clone();
    let mut obs_i = obs_meas.clone();
    formod_with(cfg, tbl, &atm_i, &mut obs_i, engine)?;

    let x_a = atm2x(atm_apr, &slots);
    let mut x_i = atm2x(&atm_i, &slots);
    let (y_m, ida, _) = obs2y(cfg, obs_meas);
    let (mut y_i, _, _) = obs2y(cfg, &obs_i);

    // Inverse a priori covariance.
    let mut s_a_inv = set_cov_apr(ret, atm_apr, &slots, &x_a);
    if cfg.write_matrix {
        write_matrix(
            &dir.join("matrix_cov_apr.tab"),
            cfg,
            &s_a_inv,
            &atm_i,
            &obs_i,
            &slots,
            Axis::X,
            Axis::X,
            Sort::RowMajor,
        )?;
    }
    invert_sym(&mut s_a_inv, "a priori covariance")?;

    // Measurement errors.
    let (sig_noise, sig_formod, sig_eps_inv) = set_cov_meas(ret, &y_m, &ida)?;

    // Cost function file.
    let mut costs = BufWriter::new(fs::File::create(dir.join("costs.tab"))?);
    writeln!(
        costs,
        "# $1 = iteration number\n\
         # $2 = normalized cost function\n\
         # $3 = number of measurements\n\
         # $4 = number of state vector elements\n"
    )?;

    let mut dx = &x_i - &x_a;
    let mut dy = &y_m - &y_i;
    let mut chisq = cost_function(&dx, &dy, &s_a_inv, &sig_eps_inv);
    let mut chi2_history = vec![chisq];
    info!("it = 0 / chi^2/m = {chisq:.6e}");
    writeln!(costs, "0 {chisq} {m} {n}")?;

    // Initial kernel.
    timers.start("kernel");
    let mut k_i = kernel(cfg, tbl, &atm_i, &mut obs_i, engine)?;
    timers.stop("kernel");
    let mut g = weighted_normal(&k_i, &sig_eps_inv);

    let mut lmpar = 1e-3;
    let mut converged = false;
    let mut iterations = 0;

    for it in 1..=ret.conv_itmax {
        iterations = it;
        let chisq_old = chisq;

        // Recompute the kernel periodically.
        if it > 1 && it % ret.kernel_recomp == 0 {
            timers.start("kernel");
            k_i = kernel(cfg, tbl, &atm_i, &mut obs_i, engine)?;
            timers.stop("kernel");
        }
        if it == 1 || it % ret.kernel_recomp == 0 {
            g = weighted_normal(&k_i, &sig_eps_inv);
        }

        // b = K^T S_eps^-1 dy - S_a^-1 dx.
        let y_aux = DVector::from_iterator(
            m,
            dy.iter().zip(&sig_eps_inv).map(|(d, w)| d * w * w),
        );
        let b = k_i.transpose() * y_aux - &s_a_inv * &dx;

        // Inner loop: damped steps until the cost decreases.
        let mut x_step = DVector::zeros(n);
        let mut accepted = false;
        for _ in 0..20 {
            // A = (1 + lambda) S_a^-1 + K^T S_eps^-1 K.
            let a = &s_a_inv * (1.0 + lmpar) + &g;
            let Some(chol) = Cholesky::new(a) else {
                // Badly scaled normal equations: damp harder and retry.
                lmpar *= 10.0;
                continue;
            };
            x_step = chol.solve(&b);

            x_i += &x_step;
            atm_i = atm_apr.clone();
            x2atm(&x_i, &slots, &mut atm_i);
            atm_i.clamp(cfg);

            obs_i = obs_meas.clone();
            formod_with(cfg, tbl, &atm_i, &mut obs_i, engine)?;
            (y_i, _, _) = obs2y(cfg, &obs_i);

            dx = &x_i - &x_a;
            dy = &y_m - &y_i;
            chisq = cost_function(&dx, &dy, &s_a_inv, &sig_eps_inv);

            if chisq > chisq_old {
                lmpar *= 10.0;
                x_i -= &x_step;
            } else {
                lmpar /= 10.0;
                accepted = true;
                break;
            }
        }

        if !accepted {
            // Re-synchronize state and radiances with the reverted x_i.
            atm_i = atm_apr.clone();
            x2atm(&x_i, &slots, &mut atm_i);
            atm_i.clamp(cfg);
            obs_i = obs_meas.clone();
            formod_with(cfg, tbl, &atm_i, &mut obs_i, engine)?;
            (y_i, _, _) = obs2y(cfg, &obs_i);
            dx = &x_i - &x_a;
            dy = &y_m - &y_i;
            chisq = chisq_old;
        }

        info!("it = {it} / chi^2/m = {chisq:.6e}");
        writeln!(costs, "{it} {chisq} {m} {n}")?;
        chi2_history.push(chisq);

        // Normalized step size in state space.
        let disq = x_step.dot(&b) / n as f64;

        if (it == 1 || it % ret.kernel_recomp == 0) && disq < ret.conv_dmin {
            converged = true;
            break;
        }
    }
    drop(costs);

    if !converged {
        warn!(
            "Retrieval did not converge within {} iterations (chi^2/m = {chisq:.6e})",
            ret.conv_itmax
        );
    }

    // Store results.
    write_atm(&dir.join("atm_final.tab"), cfg, &atm_i, AtmFormat::Ascii)?;
    write_obs(&dir.join("obs_final.tab"), cfg, &obs_i, ObsFormat::Ascii)?;
    if cfg.write_matrix {
        write_matrix(
            &dir.join("matrix_kernel.tab"),
            cfg,
            &k_i,
            &atm_i,
            &obs_i,
            &slots,
            Axis::Y,
            Axis::X,
            Sort::RowMajor,
        )?;
    }

    let analysis = if ret.err_ana {
        Some(analyze(
            cfg, ret, dir, &atm_i, &obs_i, &slots, &k_i, &s_a_inv, &sig_eps_inv, &sig_noise,
            &sig_formod,
        )?)
    } else {
        None
    };

    timers.stop("retrieval");
    Ok(RetrievalResult {
        atm: atm_i,
        obs: obs_i,
        chi2_history,
        iterations,
        converged,
        analysis,
    })
}

/// Posterior error and information-content analysis.
#[allow(clippy::too_many_arguments)]
fn analyze(
    cfg: &Config,
    ret: &RetrievalConfig,
    dir: &Utf8Path,
    atm_i: &Atmosphere,
    obs_i: &Observations,
    slots: &[StateSlot],
    k_i: &DMatrix<f64>,
    s_a_inv: &DMatrix<f64>,
    sig_eps_inv: &[f64],
    sig_noise: &[f64],
    sig_formod: &[f64],
) -> Result<Analysis> {
    let n = slots.len();
    let m = sig_eps_inv.len();

    // Posterior covariance: (S_a^-1 + K^T S_eps^-1 K)^-1.
    let mut cov = weighted_normal(k_i, sig_eps_inv) + s_a_inv;
    invert_sym(&mut cov, "posterior covariance")?;

    let std_total = DVector::from_iterator(n, (0..n).map(|i| cov[(i, i)].sqrt()));
    write_stddev(dir, "total", cfg, atm_i, slots, &std_total)?;

    // Correlation matrix.
    let mut corr = DMatrix::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            corr[(i, j)] = cov[(i, j)] / (cov[(i, i)] * cov[(j, j)]).sqrt();
        }
    }

    // Gain matrix G = S_x K^T S_eps^-1.
    let mut aux = DMatrix::zeros(n, m);
    for i in 0..n {
        for j in 0..m {
            aux[(i, j)] = k_i[(j, i)] * sig_eps_inv[j] * sig_eps_inv[j];
        }
    }
    let gain = &cov * aux;

    // Error budgets per source.
    let budget = |sig: &[f64]| {
        DVector::from_iterator(
            n,
            (0..n).map(|i| {
                (0..m)
                    .map(|j| gain[(i, j)] * gain[(i, j)] * sig[j] * sig[j])
                    .sum::<f64>()
                    .sqrt()
            }),
        )
    };
    let std_noise = budget(sig_noise);
    let std_formod = budget(sig_formod);
    write_stddev(dir, "noise", cfg, atm_i, slots, &std_noise)?;
    write_stddev(dir, "formod", cfg, atm_i, slots, &std_formod)?;

    // Averaging kernel and degrees of freedom.
    let avk = &gain * k_i;
    let dof_total = avk.trace();

    let mut dof: Vec<(Quantity, f64)> = Vec::new();
    for (i, slot) in slots.iter().enumerate() {
        match dof.iter_mut().find(|(q, _)| *q == slot.0) {
            Some((_, sum)) => *sum += avk[(i, i)],
            None => dof.push((slot.0, avk[(i, i)])),
        }
    }

    let vres = (0..n)
        .map(|i| vertical_resolution(&avk, slots, atm_i, i))
        .collect();

    if cfg.write_matrix {
        write_matrix(
            &dir.join("matrix_cov_ret.tab"),
            cfg,
            &cov,
            atm_i,
            obs_i,
            slots,
            Axis::X,
            Axis::X,
            Sort::RowMajor,
        )?;
        write_matrix(
            &dir.join("matrix_corr.tab"),
            cfg,
            &corr,
            atm_i,
            obs_i,
            slots,
            Axis::X,
            Axis::X,
            Sort::RowMajor,
        )?;
        write_matrix(
            &dir.join("matrix_gain.tab"),
            cfg,
            &gain,
            atm_i,
            obs_i,
            slots,
            Axis::X,
            Axis::Y,
            Sort::ColumnMajor,
        )?;
        write_matrix(
            &dir.join("matrix_avk.tab"),
            cfg,
            &avk,
            atm_i,
            obs_i,
            slots,
            Axis::X,
            Axis::X,
            Sort::RowMajor,
        )?;
    }

    for (q, d) in &dof {
        info!("DOF ({}) = {d:.3}", q.name(cfg));
    }
    info!("DOF (total) = {dof_total:.3}");

    Ok(Analysis {
        cov,
        corr,
        gain,
        avk,
        dof_total,
        dof,
        vres,
        std_total,
        std_noise,
        std_formod,
    })
}

/// Vertical resolution of one averaging-kernel row: full width at half
/// maximum of the row restricted to its own quantity, in altitude.
fn vertical_resolution(
    avk: &DMatrix<f64>,
    slots: &[StateSlot],
    atm: &Atmosphere,
    i: usize,
) -> f64 {
    let Some(_) = slots[i].1 else {
        return f64::NAN;
    };
    let quantity = slots[i].0;

    // Profile of this row over its own quantity block.
    let block: Vec<(f64, f64)> = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.0 == quantity)
        .map(|(j, s)| (atm.z[s.1.unwrap()], avk[(i, j)]))
        .collect();
    if block.len() < 2 {
        return f64::NAN;
    }

    let (imax, &(_, amax)) = block
        .iter()
        .enumerate()
        .max_by(|a, b| a.1 .1.total_cmp(&b.1 .1))
        .unwrap();
    if amax <= 0.0 {
        return f64::NAN;
    }
    let half = amax / 2.0;

    // Crossing below the peak.
    let mut z_lo = block[0].0;
    for j in (1..=imax).rev() {
        let (z1, a1) = block[j];
        let (z0, a0) = block[j - 1];
        if a0 < half {
            z_lo = z1 + (z0 - z1) * (half - a1) / (a0 - a1);
            break;
        }
    }
    // Crossing above the peak.
    let mut z_hi = block[block.len() - 1].0;
    for j in imax..block.len() - 1 {
        let (z0, a0) = block[j];
        let (z1, a1) = block[j + 1];
        if a1 < half {
            z_hi = z0 + (z1 - z0) * (half - a0) / (a1 - a0);
            break;
        }
    }
    z_hi - z_lo
}

/// Decode a vector of standard deviations through the state map and write it
/// as an atmosphere file `atm_err_<name>.tab`.
fn write_stddev(
    dir: &Utf8Path,
    name: &str,
    cfg: &Config,
    atm: &Atmosphere,
    slots: &[StateSlot],
    std: &DVector<f64>,
) -> Result<()> {
    let mut atm_err = atm.clone();
    x2atm(std, slots, &mut atm_err);
    let path: Utf8PathBuf = dir.join(format!("atm_err_{name}.tab"));
    write_atm(&path, cfg, &atm_err, AtmFormat::Ascii)
}

#[cfg(test)]
mod retrieval_test {
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    use super::*;
    use crate::testutil::{config_with, standard_atmosphere};

    fn ret_config(cfg: &Config) -> RetrievalConfig {
        let ctl = crate::config::ControlMap::from_pairs(&[
            ("ERR_NOISE[0]", "1e-5"),
            ("ERR_T", "10"),
            ("ERR_T_CZ", "5"),
        ]);
        RetrievalConfig::from_control(&ctl, cfg).unwrap()
    }

    #[test]
    fn apriori_covariance_is_block_diagonal_with_decay() {
        let cfg = config_with(&[
            ("RETT_ZMIN", "0"),
            ("RETT_ZMAX", "40"),
            ("RETQ_ZMIN[0]", "0"),
            ("RETQ_ZMAX[0]", "40"),
        ]);
        let mut ret = ret_config(&cfg);
        ret.err_q = vec![20.0];
        ret.err_q_cz = vec![-999.0];

        let atm = standard_atmosphere(&cfg, 40.0, 10.0);
        let slots = layout(&cfg, &atm);
        let x_a = atm2x(&atm, &slots);
        let s_a = set_cov_apr(&ret, &atm, &slots, &x_a);

        // Temperature diagonal: sigma^2 = 100.
        let it0 = slots
            .iter()
            .position(|s| s.0 == Quantity::Temperature)
            .unwrap();
        assert_abs_diff_eq!(s_a[(it0, it0)], 100.0, epsilon = 1e-12);

        // Vertical correlation decays with the 5 km length: 10 km spacing
        // gives exp(-2).
        let it1 = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.0 == Quantity::Temperature)
            .nth(1)
            .unwrap()
            .0;
        assert_relative_eq!(
            s_a[(it0, it1)],
            100.0 * (-2.0f64).exp(),
            max_relative = 1e-12
        );

        // No cross-quantity correlation, and no vmr correlation without a
        // correlation length.
        let iq0 = slots.iter().position(|s| s.0 == Quantity::Vmr(0)).unwrap();
        assert_eq!(s_a[(it0, iq0)], 0.0);
        let iq1 = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.0 == Quantity::Vmr(0))
            .nth(1)
            .unwrap()
            .0;
        assert_eq!(s_a[(iq0, iq1)], 0.0);
    }

    #[test]
    fn cost_function_normalizes_by_m() {
        let s_a_inv = DMatrix::identity(2, 2);
        let dx = DVector::from_vec(vec![1.0, 2.0]);
        let dy = DVector::from_vec(vec![3.0, 0.0, 4.0]);
        let w = vec![1.0, 1.0, 0.5];
        // (9 + 4) measurement + (1 + 4) a priori over m = 3.
        assert_relative_eq!(
            cost_function(&dx, &dy, &s_a_inv, &w),
            (9.0 + 4.0 + 5.0) / 3.0,
            max_relative = 1e-12
        );
    }

    #[test]
    fn zero_measurement_error_is_rejected() {
        let cfg = config_with(&[("RETT_ZMIN", "0"), ("RETT_ZMAX", "40")]);
        let mut ret = ret_config(&cfg);
        ret.err_noise = vec![0.0];
        let y = DVector::from_vec(vec![1.0]);
        assert!(set_cov_meas(&ret, &y, &[0]).is_err());
    }

    #[test]
    fn vertical_resolution_of_identity_rows() {
        // A sharply peaked averaging kernel resolves about one grid spacing.
        let cfg = config_with(&[("RETT_ZMIN", "0"), ("RETT_ZMAX", "40")]);
        let atm = standard_atmosphere(&cfg, 40.0, 5.0);
        let slots = layout(&cfg, &atm);
        let n = slots.len();
        let avk = DMatrix::identity(n, n);

        let res = vertical_resolution(&avk, &slots, &atm, n / 2);
        assert!(res > 0.0 && res <= 5.0 + 1e-9, "res = {res}");
    }
}
