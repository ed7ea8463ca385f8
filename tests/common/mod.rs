//! Shared fixtures for the integration tests: an analytic absorber tabulated
//! like the production emissivity tables, plus a midlatitude-like column.

use limbra::atmosphere::Atmosphere;
use limbra::config::{Config, ControlMap};
use limbra::tables::{GasTable, TableRow, TableStore};

/// Analytic band absorption cross section [cm^2]; eps = 1 - exp(-k u).
pub fn absorption(p: f64, t: f64) -> f64 {
    1e-19 * (p / 100.0).powf(0.3) * (250.0 / t).powf(0.5)
}

/// Tabulate the analytic absorber over a realistic ragged grid.
pub fn synthetic_table() -> GasTable {
    let mut tbl = GasTable::default();
    let mut p = 1100.0;
    while p > 1e-2 {
        let mut rows = Vec::new();
        for it in 0..8 {
            let t = 180.0 + 20.0 * f64::from(it);
            let k = absorption(p, t);
            let mut u = Vec::new();
            let mut eps = Vec::new();
            for iu in 0..60 {
                let uval = 1e15 * 10f64.powf(f64::from(iu) * 0.1);
                u.push(uval as f32);
                eps.push((1.0 - (-k * uval).exp()) as f32);
            }
            rows.push(TableRow { t, u, eps });
        }
        tbl.p.push(p);
        tbl.rows.push(rows);
        p /= 2.5;
    }
    tbl
}

/// A store with the synthetic table for every gas/channel pair.
pub fn synthetic_store(cfg: &Config) -> TableStore {
    let tables = (0..cfg.nd())
        .map(|_| (0..cfg.ng()).map(|_| synthetic_table()).collect())
        .collect();
    TableStore::with_tables(cfg, tables)
}

/// Single-gas configuration with continua and refraction off, overlaid with
/// extra control entries.
pub fn config_with(extra: &[(&str, &str)]) -> Config {
    let mut pairs = vec![
        ("NG", "1"),
        ("EMITTER[0]", "CO2"),
        ("ND", "1"),
        ("NU[0]", "792.0"),
        ("CTM_CO2", "0"),
        ("CTM_H2O", "0"),
        ("CTM_N2", "0"),
        ("CTM_O2", "0"),
        ("REFRAC", "0"),
    ];
    pairs.extend_from_slice(extra);
    Config::from_control(&ControlMap::from_pairs(&pairs)).unwrap()
}

/// Midlatitude-like column with a prescribed uniform mixing ratio.
pub fn standard_atmosphere(cfg: &Config, ztop: f64, dz: f64, q: f64) -> Atmosphere {
    let mut atm = Atmosphere::new(cfg);
    let mut z = 0.0;
    while z <= ztop + 1e-9 {
        let t = if z < 12.0 {
            288.15 - 6.5 * z
        } else {
            288.15 - 6.5 * 12.0 + (z - 12.0).min(20.0)
        };
        let qs: Vec<f64> = (0..cfg.ng()).map(|_| q).collect();
        let ks: Vec<f64> = (0..cfg.nw).map(|_| 0.0).collect();
        atm.push_level(0.0, z, 0.0, 0.0, 1013.25 * (-z / 7.0).exp(), t, &qs, &ks);
        z += dz;
    }
    atm.sft = 288.15;
    atm
}
