//! Emissivity look-up tables and the Planck source-function table.
//!
//! Band emissivities are tabulated per (channel, gas) over pressure,
//! temperature and column density. The grids are ragged: each gas/channel
//! pair carries its own pressure nodes, each pressure node its own
//! temperature rows, each row its own column-density axis. Everything lives
//! on the heap; there is no dense worst-case array anywhere.

use std::fs;
use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};
use log::{info, warn};

use crate::atmosphere::BinReader;
use crate::config::{Config, TableFormat};
use crate::constants::{TBLNS, TMAX, TMIN};
use crate::errors::{LimbraError, Result};
use crate::geo::planck;
use crate::interp::{lin, locate_irr, locate_tbl, logx};

/// One temperature row: emissivity over a strictly increasing column-density
/// axis.
#[derive(Debug, Clone, Default)]
pub struct TableRow {
    /// Temperature [K].
    pub t: f64,
    /// Column density [molec/cm^2], strictly increasing.
    pub u: Vec<f32>,
    /// Emissivity, non-decreasing along `u`.
    pub eps: Vec<f32>,
}

/// Emissivity table of one gas in one channel.
#[derive(Debug, Clone, Default)]
pub struct GasTable {
    /// Pressure nodes [hPa], strictly decreasing.
    pub p: Vec<f64>,
    /// Temperature rows per pressure node, ascending in temperature.
    pub rows: Vec<Vec<TableRow>>,
}

impl GasTable {
    /// A gas with no tabulated absorption (fully transparent).
    pub fn is_empty(&self) -> bool {
        self.p.is_empty()
    }
}

/// All emissivity tables plus the tabulated source function.
pub struct TableStore {
    /// Emissivity tables indexed `[id][ig]`.
    tables: Vec<Vec<GasTable>>,
    /// Source function temperatures [K].
    st: Vec<f64>,
    /// Source function radiance per temperature and channel, `[is][id]`.
    sr: Vec<Vec<f64>>,
}

impl TableStore {
    /// Load the emissivity tables named by the configuration and tabulate the
    /// source function. With `TBLBASE -` every gas is transparent.
    pub fn read(cfg: &Config) -> Result<Self> {
        let mut tables = Vec::with_capacity(cfg.nd());
        for id in 0..cfg.nd() {
            let mut per_gas = Vec::with_capacity(cfg.ng());
            for ig in 0..cfg.ng() {
                per_gas.push(if cfg.tblbase == "-" {
                    GasTable::default()
                } else {
                    read_gas_table(cfg, id, ig)?
                });
            }
            tables.push(per_gas);
        }

        let n_loaded = tables
            .iter()
            .flatten()
            .filter(|tbl| !tbl.is_empty())
            .count();
        info!(
            "Initialized look-up tables ({n_loaded}/{} gas/channel pairs)",
            cfg.nd() * cfg.ng()
        );

        Ok(TableStore::with_tables(cfg, tables))
    }

    /// Build a store from in-memory tables (used by the tests and by table
    /// generators).
    pub fn with_tables(cfg: &Config, tables: Vec<Vec<GasTable>>) -> Self {
        // Tabulate the Planck source function for each channel.
        let mut st = Vec::with_capacity(TBLNS);
        let mut sr = Vec::with_capacity(TBLNS);
        for is in 0..TBLNS {
            let t = TMIN + (TMAX - TMIN) * is as f64 / (TBLNS - 1) as f64;
            st.push(t);
            sr.push(cfg.nu.iter().map(|&nu| planck(t, nu)).collect());
        }
        TableStore { tables, st, sr }
    }

    /// The table of one gas in one channel.
    pub fn gas_table(&self, id: usize, ig: usize) -> &GasTable {
        &self.tables[id][ig]
    }

    /// Band emissivity of gas `ig` in channel `id` for a homogeneous column
    /// at pressure `p` [hPa], temperature `t` [K] and column density `u`
    /// [molec/cm^2].
    ///
    /// Interpolation is linear in log u along the rows, linear in T across
    /// rows, and linear in log p across pressure nodes. Column densities
    /// beyond the last node saturate at the last emissivity.
    pub fn emissivity(&self, ig: usize, id: usize, p: f64, t: f64, u: f64) -> f64 {
        let tbl = &self.tables[id][ig];
        if tbl.is_empty() || u <= 0.0 {
            return 0.0;
        }

        if tbl.p.len() == 1 {
            return eps_at_pressure(&tbl.rows[0], t, u);
        }

        let ip = locate_irr(&tbl.p, p);
        let e0 = eps_at_pressure(&tbl.rows[ip], t, u);
        let e1 = eps_at_pressure(&tbl.rows[ip + 1], t, u);
        let eps = logx(tbl.p[ip], e0, tbl.p[ip + 1], e1, clamp_p(p, &tbl.p));
        eps.clamp(0.0, 1.0)
    }

    /// Column density yielding emissivity `eps` at (p, t): the inverse of
    /// [`TableStore::emissivity`]. Emissivities above the tabulated maximum
    /// saturate to the last column-density node.
    pub fn column_density(&self, ig: usize, id: usize, p: f64, t: f64, eps: f64) -> f64 {
        let tbl = &self.tables[id][ig];
        if tbl.is_empty() || eps <= 0.0 {
            return 0.0;
        }

        if tbl.p.len() == 1 {
            return u_at_pressure(&tbl.rows[0], t, eps);
        }

        let ip = locate_irr(&tbl.p, p);
        let u0 = u_at_pressure(&tbl.rows[ip], t, eps);
        let u1 = u_at_pressure(&tbl.rows[ip + 1], t, eps);
        let u = logx(tbl.p[ip], u0, tbl.p[ip + 1], u1, clamp_p(p, &tbl.p));
        u.max(0.0)
    }

    /// Grow the accumulated path emissivity of gas `ig` in channel `id` by a
    /// segment column `du` at local conditions (p, t).
    ///
    /// This is the emissivity-growth step: at every (pressure, temperature)
    /// corner of the bracketing grid cell the path emissivity is inverted to
    /// an effective column, grown by `du`, and looked up again; only the
    /// resulting emissivities are blended across the cell. Inverting per
    /// corner keeps the growth exact on homogeneous paths.
    pub fn ega_growth(&self, ig: usize, id: usize, p: f64, t: f64, eps_path: f64, du: f64) -> f64 {
        let tbl = &self.tables[id][ig];
        if tbl.is_empty() {
            return 0.0;
        }

        if tbl.p.len() == 1 {
            return grow_at_pressure(&tbl.rows[0], t, eps_path, du);
        }

        let ip = locate_irr(&tbl.p, p);
        let e0 = grow_at_pressure(&tbl.rows[ip], t, eps_path, du);
        let e1 = grow_at_pressure(&tbl.rows[ip + 1], t, eps_path, du);
        let eps = logx(tbl.p[ip], e0, tbl.p[ip + 1], e1, clamp_p(p, &tbl.p));
        eps.clamp(0.0, 1.0)
    }

    /// Source function radiance per channel at temperature `t`.
    pub fn source(&self, t: f64, src: &mut [f64]) {
        let ns = self.st.len();
        let pos = (t - TMIN) / (TMAX - TMIN) * (ns - 1) as f64;
        let is = (pos.floor() as isize).clamp(0, ns as isize - 2) as usize;
        let w = (pos - is as f64).clamp(0.0, 1.0);
        for (id, s) in src.iter_mut().enumerate() {
            *s = (1.0 - w) * self.sr[is][id] + w * self.sr[is + 1][id];
        }
    }
}

fn clamp_p(p: f64, nodes: &[f64]) -> f64 {
    // Pressure nodes are descending; clamp into the tabulated span so edge
    // queries do not extrapolate.
    p.clamp(nodes[nodes.len() - 1], nodes[0])
}

/// Emissivity at one pressure node, interpolated in temperature and log u.
fn eps_at_pressure(rows: &[TableRow], t: f64, u: f64) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    if rows.len() == 1 {
        return eps_in_row(&rows[0], u);
    }

    let it = locate_row(rows, t);
    let e0 = eps_in_row(&rows[it], u);
    let e1 = eps_in_row(&rows[it + 1], u);
    let t0 = rows[it].t;
    let t1 = rows[it + 1].t;
    lin(t0, e0, t1, e1, t.clamp(t0.min(t1), t0.max(t1)))
}

fn u_at_pressure(rows: &[TableRow], t: f64, eps: f64) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    if rows.len() == 1 {
        return u_in_row(&rows[0], eps);
    }

    let it = locate_row(rows, t);
    let u0 = u_in_row(&rows[it], eps);
    let u1 = u_in_row(&rows[it + 1], eps);
    let t0 = rows[it].t;
    let t1 = rows[it + 1].t;
    lin(t0, u0, t1, u1, t.clamp(t0.min(t1), t0.max(t1)))
}

/// Emissivity growth at one pressure node: per-row inversion and re-lookup,
/// interpolated in temperature.
fn grow_at_pressure(rows: &[TableRow], t: f64, eps_path: f64, du: f64) -> f64 {
    let grow = |row: &TableRow| eps_in_row(row, u_in_row(row, eps_path) + du);
    if rows.is_empty() {
        return 0.0;
    }
    if rows.len() == 1 {
        return grow(&rows[0]);
    }

    let it = locate_row(rows, t);
    let t0 = rows[it].t;
    let t1 = rows[it + 1].t;
    lin(
        t0,
        grow(&rows[it]),
        t1,
        grow(&rows[it + 1]),
        t.clamp(t0.min(t1), t0.max(t1)),
    )
}

fn locate_row(rows: &[TableRow], t: f64) -> usize {
    let mut ilo = 0;
    let mut ihi = rows.len() - 1;
    while ihi - ilo > 1 {
        let mid = (ihi + ilo) / 2;
        if t >= rows[mid].t {
            ilo = mid;
        } else {
            ihi = mid;
        }
    }
    ilo
}

/// Emissivity along one row, linear in ln u between nodes. Below the first
/// node the emissivity ramps linearly to zero; beyond the last it saturates.
fn eps_in_row(row: &TableRow, u: f64) -> f64 {
    let n = row.u.len();
    if n == 0 {
        return 0.0;
    }
    let u0 = f64::from(row.u[0]);
    if u <= u0 {
        return f64::from(row.eps[0]) * u / u0;
    }
    let ulast = f64::from(row.u[n - 1]);
    if u >= ulast {
        return f64::from(row.eps[n - 1]);
    }

    let iu = locate_tbl(&row.u, u);
    lin(
        f64::from(row.u[iu]).ln(),
        f64::from(row.eps[iu]),
        f64::from(row.u[iu + 1]).ln(),
        f64::from(row.eps[iu + 1]),
        u.ln(),
    )
}

/// Column density along one row: the exact inverse of [`eps_in_row`]
/// (log-linear in column density between nodes). Emissivities beyond the
/// row maximum saturate at the last node.
fn u_in_row(row: &TableRow, eps: f64) -> f64 {
    let n = row.u.len();
    if n == 0 {
        return 0.0;
    }
    let e0 = f64::from(row.eps[0]);
    if eps <= e0 {
        if e0 <= 0.0 {
            return 0.0;
        }
        return f64::from(row.u[0]) * eps / e0;
    }
    if eps >= f64::from(row.eps[n - 1]) {
        return f64::from(row.u[n - 1]);
    }

    let ie = locate_tbl(&row.eps, eps);
    let lnu = lin(
        f64::from(row.eps[ie]),
        f64::from(row.u[ie]).ln(),
        f64::from(row.eps[ie + 1]),
        f64::from(row.u[ie + 1]).ln(),
        eps,
    );
    lnu.exp()
}

/// Table file name for one gas and channel.
fn table_filename(cfg: &Config, id: usize, ig: usize) -> Utf8PathBuf {
    let ext = match cfg.tblfmt {
        TableFormat::Ascii => "tab",
        TableFormat::Binary | TableFormat::GasGrouped => "bin",
    };
    match cfg.tblfmt {
        TableFormat::GasGrouped => {
            Utf8PathBuf::from(format!("{}_{}.{ext}", cfg.tblbase, cfg.emitter[ig]))
        }
        _ => Utf8PathBuf::from(format!(
            "{}_{:04.0}_{}.{ext}",
            cfg.tblbase, cfg.nu[id], cfg.emitter[ig]
        )),
    }
}

fn read_gas_table(cfg: &Config, id: usize, ig: usize) -> Result<GasTable> {
    let path = table_filename(cfg, id, ig);
    if !path.as_std_path().exists() {
        warn!("Missing table file: {path}");
        return Ok(GasTable::default());
    }
    let tbl = match cfg.tblfmt {
        TableFormat::Ascii => read_tbl_asc(&path)?,
        TableFormat::Binary => read_tbl_bin(&path, None)?,
        TableFormat::GasGrouped => read_tbl_bin(&path, Some(id))?,
    };
    validate(&path, tbl)
}

fn validate(path: &Utf8Path, mut tbl: GasTable) -> Result<GasTable> {
    // Accept either pressure ordering on file, store descending.
    if tbl.p.len() >= 2 && tbl.p[0] < tbl.p[1] {
        tbl.p.reverse();
        tbl.rows.reverse();
    }
    if tbl.p.len() >= 2 && !tbl.p.windows(2).all(|w| w[1] < w[0]) {
        return Err(LimbraError::malformed(
            path.as_str(),
            "pressure nodes not strictly monotone",
        ));
    }
    for rows in &mut tbl.rows {
        rows.sort_by(|a, b| a.t.total_cmp(&b.t));
    }
    for rows in &tbl.rows {
        for row in rows {
            if !row.u.windows(2).all(|w| w[1] > w[0]) {
                return Err(LimbraError::malformed(
                    path.as_str(),
                    "column densities not strictly increasing",
                ));
            }
            if !row.eps.windows(2).all(|w| w[1] >= w[0]) {
                return Err(LimbraError::malformed(
                    path.as_str(),
                    "emissivity decreasing along column density",
                ));
            }
        }
    }
    Ok(tbl)
}

/// ASCII tables: one `p t u eps` quadruple per line, grouped by pressure and
/// temperature blocks.
fn read_tbl_asc(path: &Utf8Path) -> Result<GasTable> {
    let text = fs::read_to_string(path)?;
    let mut tbl = GasTable::default();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut cols = trimmed.split_whitespace().map(|tok| {
            tok.parse::<f64>()
                .map_err(|_| LimbraError::malformed(path.as_str(), format!("bad number: {tok}")))
        });
        let (Some(p), Some(t), Some(u), Some(eps)) =
            (cols.next(), cols.next(), cols.next(), cols.next())
        else {
            return Err(LimbraError::malformed(path.as_str(), "expected 4 columns"));
        };
        let (p, t, u, eps) = (p?, t?, u?, eps?);

        if tbl.p.last() != Some(&p) {
            tbl.p.push(p);
            tbl.rows.push(Vec::new());
        }
        let rows = tbl.rows.last_mut().unwrap();
        if rows.last().map(|row| row.t) != Some(t) {
            rows.push(TableRow {
                t,
                u: Vec::new(),
                eps: Vec::new(),
            });
        }
        let row = rows.last_mut().unwrap();
        row.u.push(u as f32);
        row.eps.push(eps as f32);
    }
    Ok(tbl)
}

/// Binary tables: `u32 np`, then per pressure node `u32 nt` and per
/// temperature row `f64 p, f64 t, u32 nu, f32[nu] u, f32[nu] eps`.
/// Gas-grouped files repeat that block per channel; `skip_to` selects one.
fn read_tbl_bin(path: &Utf8Path, skip_to: Option<usize>) -> Result<GasTable> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let mut rd = BinReader::new(&buf, path.as_str());

    let target = skip_to.unwrap_or(0);
    for block in 0.. {
        if rd.at_end() {
            return Err(LimbraError::malformed(
                path.as_str(),
                format!("channel block {target} not found"),
            ));
        }
        let tbl = read_tbl_block(&mut rd)?;
        if block == target {
            return Ok(tbl);
        }
    }
    unreachable!()
}

fn read_tbl_block(rd: &mut BinReader) -> Result<GasTable> {
    let np = rd.u32()? as usize;
    let mut tbl = GasTable {
        p: Vec::with_capacity(np),
        rows: Vec::with_capacity(np),
    };
    for _ in 0..np {
        let nt = rd.u32()? as usize;
        let mut rows = Vec::with_capacity(nt);
        let mut p = f64::NAN;
        for _ in 0..nt {
            p = rd.f64()?;
            let t = rd.f64()?;
            let nu = rd.u32()? as usize;
            let u = rd.f32_vec(nu)?;
            let eps = rd.f32_vec(nu)?;
            rows.push(TableRow { t, u, eps });
        }
        tbl.p.push(p);
        tbl.rows.push(rows);
    }
    Ok(tbl)
}

#[cfg(test)]
mod tables_test {
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    use super::*;
    use crate::testutil::{absorption, config_with, synthetic_store};

    fn test_config() -> Config {
        config_with(&[])
    }

    #[test]
    fn emissivity_matches_analytic() {
        let cfg = test_config();
        let store = synthetic_store(&cfg);
        for &(p, t, u) in &[
            (500.0, 230.0, 1e17),
            (80.0, 210.0, 5e17),
            (5.0, 280.0, 3e18),
        ] {
            let want = 1.0 - (-absorption(p, t) * u).exp();
            let got = store.emissivity(0, 0, p, t, u);
            assert_relative_eq!(got, want, max_relative = 2e-2);
        }
    }

    #[test]
    fn emissivity_monotone_in_column() {
        let cfg = test_config();
        let store = synthetic_store(&cfg);
        let mut last = 0.0;
        for iu in 0..40 {
            let u = 1e15 * 10f64.powf(f64::from(iu) * 0.15);
            let eps = store.emissivity(0, 0, 200.0, 250.0, u);
            assert!(eps >= last);
            last = eps;
        }
        assert!(last <= 1.0);
    }

    #[test]
    fn column_density_inverts_emissivity() {
        let cfg = test_config();
        let store = synthetic_store(&cfg);
        // Node spacing is a factor 10^0.1, so the round trip must come back
        // well within one node.
        for &(p, t, u) in &[
            (700.0, 200.0, 2e16),
            (120.0, 260.0, 4e17),
            (2.0, 300.0, 8e18),
        ] {
            let eps = store.emissivity(0, 0, p, t, u);
            let back = store.column_density(0, 0, p, t, eps);
            assert_relative_eq!(back, u, max_relative = 10f64.powf(0.1) - 1.0);
        }
    }

    #[test]
    fn saturation_beyond_last_node() {
        let cfg = test_config();
        let store = synthetic_store(&cfg);
        let tbl = store.gas_table(0, 0);
        let ulast = f64::from(*tbl.rows[0][0].u.last().unwrap());
        let u = store.column_density(0, 0, 1000.0, 180.0, 0.999999);
        assert!(u <= ulast * 1.001);
    }

    #[test]
    fn empty_table_is_transparent() {
        let cfg = test_config();
        let store = TableStore::with_tables(&cfg, vec![vec![GasTable::default()]]);
        assert_eq!(store.emissivity(0, 0, 100.0, 250.0, 1e20), 0.0);
    }

    #[test]
    fn source_function_matches_planck() {
        let cfg = test_config();
        let store = synthetic_store(&cfg);
        let mut src = [0.0];
        for t in [150.0, 221.7, 288.15, 377.3] {
            store.source(t, &mut src);
            assert_relative_eq!(src[0], planck(t, 792.0), max_relative = 1e-5);
        }
    }

    #[test]
    fn ascii_table_round_trip() {
        use std::io::Write as _;

        let dir = tempfile::tempdir().unwrap();
        let path =
            camino::Utf8PathBuf::from_path_buf(dir.path().join("tbl_0792_CO2.tab")).unwrap();
        let mut out = std::fs::File::create(&path).unwrap();
        writeln!(out, "# band emissivity table").unwrap();
        for (p, t) in [(1000.0, 200.0), (1000.0, 250.0), (100.0, 200.0), (100.0, 250.0)] {
            for iu in 0..4 {
                let u = 1e16 * 10f64.powi(iu);
                let eps = 0.1 + 0.2 * f64::from(iu);
                writeln!(out, "{p} {t} {u:e} {eps}").unwrap();
            }
        }
        drop(out);

        let tbl = validate(&path, read_tbl_asc(&path).unwrap()).unwrap();
        assert_eq!(tbl.p, vec![1000.0, 100.0]);
        assert_eq!(tbl.rows[0].len(), 2);
        assert_eq!(tbl.rows[1][1].t, 250.0);
        assert_eq!(tbl.rows[0][0].u.len(), 4);
    }

    #[test]
    fn binary_table_block() {
        let mut buf = Vec::new();
        buf.extend((1u32).to_le_bytes()); // np
        buf.extend((1u32).to_le_bytes()); // nt
        buf.extend(500.0f64.to_le_bytes()); // p
        buf.extend(230.0f64.to_le_bytes()); // t
        buf.extend((3u32).to_le_bytes()); // nu
        for u in [1e16f32, 1e17, 1e18] {
            buf.extend(u.to_le_bytes());
        }
        for eps in [0.1f32, 0.4, 0.8] {
            buf.extend(eps.to_le_bytes());
        }

        let mut rd = BinReader::new(&buf, "tbl.bin");
        let tbl = read_tbl_block(&mut rd).unwrap();
        assert_eq!(tbl.p, vec![500.0]);
        assert_eq!(tbl.rows[0][0].eps, vec![0.1, 0.4, 0.8]);
        assert!(rd.at_end());
    }

    #[test]
    fn below_first_node_ramps_to_zero() {
        let row = TableRow {
            t: 250.0,
            u: vec![1e16, 1e17],
            eps: vec![0.2, 0.5],
        };
        assert_abs_diff_eq!(eps_in_row(&row, 0.5e16), 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(eps_in_row(&row, 0.0), 0.0, epsilon = 1e-12);
    }
}
