//! Labeled matrix output and small linear-algebra helpers.
//!
//! Kernel, covariance and averaging-kernel matrices are written with axis
//! headers identifying the state or measurement space of rows and columns,
//! one labeled element per line.

use std::fs;
use std::io::{BufWriter, Write};

use camino::Utf8Path;
use log::info;
use nalgebra::{Cholesky, DMatrix};

use crate::atmosphere::Atmosphere;
use crate::config::Config;
use crate::errors::{LimbraError, Result};
use crate::observations::Observations;
use crate::statevec::StateSlot;

/// Axis space of a matrix dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// State space: rows/columns labeled by quantity and profile location.
    X,
    /// Measurement space: rows/columns labeled by channel and ray geometry.
    Y,
}

/// Emission order of the element lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sort {
    RowMajor,
    ColumnMajor,
}

fn axis_label(
    axis: Axis,
    i: usize,
    cfg: &Config,
    atm: &Atmosphere,
    obs: &Observations,
    slots: &[StateSlot],
) -> String {
    match axis {
        Axis::X => {
            let (quantity, ipa) = &slots[i];
            match ipa {
                Some(ip) => format!(
                    "{} {} {} {}",
                    quantity.name(cfg),
                    atm.z[*ip],
                    atm.lon[*ip],
                    atm.lat[*ip]
                ),
                None => format!("{} -999 -999 -999", quantity.name(cfg)),
            }
        }
        Axis::Y => {
            let id = i % cfg.nd();
            let ir = i / cfg.nd();
            format!(
                "{:.4} {} {} {}",
                cfg.nu[id], obs.tpz[ir], obs.tplon[ir], obs.tplat[ir]
            )
        }
    }
}

/// Write a matrix with labeled row and column axes.
#[allow(clippy::too_many_arguments)]
pub fn write_matrix(
    path: &Utf8Path,
    cfg: &Config,
    matrix: &DMatrix<f64>,
    atm: &Atmosphere,
    obs: &Observations,
    slots: &[StateSlot],
    rowspace: Axis,
    colspace: Axis,
    sort: Sort,
) -> Result<()> {
    info!("Write matrix: {path}");
    let mut out = BufWriter::new(fs::File::create(path)?);

    for (axis, prefix, offset) in [(rowspace, "Row", 1), (colspace, "Col", 6)] {
        match axis {
            Axis::X => writeln!(
                out,
                "# ${} = {prefix}: index i\n\
                 # ${} = {prefix}: name of quantity\n\
                 # ${} = {prefix}: altitude [km]\n\
                 # ${} = {prefix}: longitude [deg]\n\
                 # ${} = {prefix}: latitude [deg]",
                offset,
                offset + 1,
                offset + 2,
                offset + 3,
                offset + 4
            )?,
            Axis::Y => writeln!(
                out,
                "# ${} = {prefix}: index i\n\
                 # ${} = {prefix}: channel wavenumber [cm^-1]\n\
                 # ${} = {prefix}: tangent point altitude [km]\n\
                 # ${} = {prefix}: tangent point longitude [deg]\n\
                 # ${} = {prefix}: tangent point latitude [deg]",
                offset,
                offset + 1,
                offset + 2,
                offset + 3,
                offset + 4
            )?,
        }
    }
    writeln!(out, "# $11 = matrix element\n")?;

    let mut write_element = |i: usize, j: usize| -> Result<()> {
        let value = matrix[(i, j)];
        if value != 0.0 {
            let ri = axis_label(rowspace, i, cfg, atm, obs, slots);
            let cj = axis_label(colspace, j, cfg, atm, obs, slots);
            writeln!(out, "{i} {ri} {j} {cj} {value}")?;
        }
        Ok(())
    };

    match sort {
        Sort::RowMajor => {
            for i in 0..matrix.nrows() {
                for j in 0..matrix.ncols() {
                    write_element(i, j)?;
                }
            }
        }
        Sort::ColumnMajor => {
            for j in 0..matrix.ncols() {
                for i in 0..matrix.nrows() {
                    write_element(i, j)?;
                }
            }
        }
    }
    Ok(())
}

/// Invert a symmetric positive-definite matrix in place via Cholesky
/// decomposition.
pub fn invert_sym(matrix: &mut DMatrix<f64>, context: &str) -> Result<()> {
    let chol = Cholesky::new(matrix.clone()).ok_or_else(|| {
        LimbraError::numerical(context, "Cholesky decomposition failed")
    })?;
    *matrix = chol.inverse();
    Ok(())
}

/// K^T diag(w^2) K for a weight vector `w` (the inverse measurement sigmas).
pub fn weighted_normal(k: &DMatrix<f64>, w: &[f64]) -> DMatrix<f64> {
    let mut kw = k.clone();
    for (i, &wi) in w.iter().enumerate() {
        for j in 0..kw.ncols() {
            kw[(i, j)] *= wi;
        }
    }
    kw.transpose() * &kw
}
