//! Atmospheric column data.
//!
//! One vertical profile ordered by strictly increasing altitude, together
//! with the cloud layer and surface scalars. The forward model never rejects
//! implausible values; [`Atmosphere::clamp`] pulls every field back into its
//! physical range after state updates.

use std::fs;
use std::io::{BufWriter, Read, Write};

use camino::Utf8Path;
use log::info;
use smallvec::SmallVec;

use crate::config::Config;
use crate::constants::{G0, MA, RI};
use crate::errors::{LimbraError, Result};
use crate::interp::{lin, locate_irr, logy};

/// File layout of atmospheric data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtmFormat {
    Ascii,
    Binary,
}

/// Atmospheric profile with cloud and surface parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Atmosphere {
    /// Time (seconds since 2000-01-01T00:00Z).
    pub time: Vec<f64>,
    /// Altitude [km], strictly increasing.
    pub z: Vec<f64>,
    /// Longitude [deg].
    pub lon: Vec<f64>,
    /// Latitude [deg].
    pub lat: Vec<f64>,
    /// Pressure [hPa].
    pub p: Vec<f64>,
    /// Temperature [K].
    pub t: Vec<f64>,
    /// Volume mixing ratio [ppv], indexed `[ig][ip]`.
    pub q: Vec<Vec<f64>>,
    /// Extinction [km^-1], indexed `[iw][ip]`.
    pub k: Vec<Vec<f64>>,

    /// Cloud layer top height [km].
    pub clz: f64,
    /// Cloud layer depth [km].
    pub cldz: f64,
    /// Cloud layer extinction [km^-1] on the `clnu` grid.
    pub clk: Vec<f64>,
    /// Surface temperature [K].
    pub sft: f64,
    /// Surface emissivity on the `sfnu` grid.
    pub sfeps: Vec<f64>,
}

/// Atmospheric state interpolated to a single altitude.
pub struct LocalState {
    pub p: f64,
    pub t: f64,
    pub q: SmallVec<[f64; 8]>,
    pub k: SmallVec<[f64; 4]>,
}

impl Atmosphere {
    /// An empty profile dimensioned for a configuration.
    pub fn new(cfg: &Config) -> Self {
        Atmosphere {
            time: Vec::new(),
            z: Vec::new(),
            lon: Vec::new(),
            lat: Vec::new(),
            p: Vec::new(),
            t: Vec::new(),
            q: vec![Vec::new(); cfg.ng()],
            k: vec![Vec::new(); cfg.nw],
            clz: 0.0,
            cldz: 0.1,
            clk: vec![0.0; cfg.ncl()],
            sft: 273.15,
            sfeps: vec![1.0; cfg.nsf()],
        }
    }

    /// Number of profile levels.
    pub fn np(&self) -> usize {
        self.z.len()
    }

    /// Append one profile level; levels must arrive in increasing altitude.
    pub fn push_level(
        &mut self,
        time: f64,
        z: f64,
        lon: f64,
        lat: f64,
        p: f64,
        t: f64,
        q: &[f64],
        k: &[f64],
    ) {
        debug_assert!(self.z.last().map_or(true, |&last| z > last));
        self.time.push(time);
        self.z.push(z);
        self.lon.push(lon);
        self.lat.push(lat);
        self.p.push(p);
        self.t.push(t);
        for (ig, col) in self.q.iter_mut().enumerate() {
            col.push(q.get(ig).copied().unwrap_or(0.0));
        }
        for (iw, col) in self.k.iter_mut().enumerate() {
            col.push(k.get(iw).copied().unwrap_or(0.0));
        }
    }

    /// Interpolate the profile to an altitude.
    ///
    /// Pressure is interpolated exponentially in altitude, everything else
    /// linearly. Altitudes outside the grid extrapolate from the edge pair,
    /// which continues the exponential pressure fall-off above the column.
    pub fn interpolate(&self, z: f64) -> LocalState {
        let ip = locate_irr(&self.z, z);
        let (z0, z1) = (self.z[ip], self.z[ip + 1]);
        LocalState {
            p: logy(z0, self.p[ip], z1, self.p[ip + 1], z),
            t: lin(z0, self.t[ip], z1, self.t[ip + 1], z),
            q: self
                .q
                .iter()
                .map(|col| lin(z0, col[ip], z1, col[ip + 1], z))
                .collect(),
            k: self
                .k
                .iter()
                .map(|col| lin(z0, col[ip], z1, col[ip + 1], z))
                .collect(),
        }
    }

    /// Altitude of the topmost profile level [km].
    pub fn top(&self) -> f64 {
        *self.z.last().expect("empty atmosphere")
    }

    /// Rebuild the pressure profile in hydrostatic equilibrium.
    ///
    /// Pressures are integrated up and down from the level closest to the
    /// reference height `cfg.hydz`, keeping that level's pressure fixed.
    /// Skipped when the reference height is negative.
    pub fn hydrostatic(&mut self, cfg: &Config) {
        if cfg.hydz < 0.0 || self.np() < 2 {
            return;
        }

        let ipref = (0..self.np())
            .min_by(|&a, &b| {
                (self.z[a] - cfg.hydz)
                    .abs()
                    .total_cmp(&(self.z[b] - cfg.hydz).abs())
            })
            .unwrap();

        for ip in ipref + 1..self.np() {
            let tbar = 0.5 * (self.t[ip - 1] + self.t[ip]);
            let dz = (self.z[ip] - self.z[ip - 1]) * 1e3;
            self.p[ip] = self.p[ip - 1] * (-dz * G0 * MA / (RI * tbar)).exp();
        }
        for ip in (0..ipref).rev() {
            let tbar = 0.5 * (self.t[ip] + self.t[ip + 1]);
            let dz = (self.z[ip + 1] - self.z[ip]) * 1e3;
            self.p[ip] = self.p[ip + 1] * (dz * G0 * MA / (RI * tbar)).exp();
        }
    }

    /// Clamp every field to its physical range.
    pub fn clamp(&mut self, cfg: &Config) {
        for ip in 0..self.np() {
            self.p[ip] = self.p[ip].clamp(5e-7, 5e4);
            self.t[ip] = self.t[ip].clamp(100.0, 400.0);
            for ig in 0..cfg.ng() {
                self.q[ig][ip] = self.q[ig][ip].clamp(0.0, 1.0);
            }
            for iw in 0..cfg.nw {
                self.k[iw][ip] = self.k[iw][ip].max(0.0);
            }
        }
        self.clz = self.clz.max(0.0);
        self.cldz = self.cldz.max(0.1);
        for clk in &mut self.clk {
            *clk = clk.max(0.0);
        }
        self.sft = self.sft.clamp(100.0, 400.0);
        for eps in &mut self.sfeps {
            *eps = eps.clamp(0.0, 1.0);
        }
    }
}

/// Read atmospheric data from a file.
///
/// Applies the hydrostatic pressure adjustment when a reference height is
/// configured.
pub fn read_atm(path: &Utf8Path, cfg: &Config, fmt: AtmFormat) -> Result<Atmosphere> {
    let mut atm = match fmt {
        AtmFormat::Ascii => read_atm_asc(path, cfg)?,
        AtmFormat::Binary => read_atm_bin(path, cfg)?,
    };
    if atm.np() == 0 {
        return Err(LimbraError::malformed(path.as_str(), "no data points"));
    }
    if !atm.z.windows(2).all(|w| w[1] > w[0]) {
        return Err(LimbraError::malformed(
            path.as_str(),
            "altitudes must be strictly increasing",
        ));
    }
    atm.hydrostatic(cfg);
    info!("Read atmospheric data: {path} ({} levels)", atm.np());
    Ok(atm)
}

fn read_atm_asc(path: &Utf8Path, cfg: &Config) -> Result<Atmosphere> {
    let text = fs::read_to_string(path)?;
    let mut atm = Atmosphere::new(cfg);

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(comment) = trimmed.strip_prefix('#') {
            parse_scalar_row(comment, &mut atm);
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }

        let cols: Vec<f64> = trimmed
            .split_whitespace()
            .map(|tok| {
                tok.parse::<f64>()
                    .map_err(|_| LimbraError::malformed(path.as_str(), format!("bad number: {tok}")))
            })
            .collect::<Result<_>>()?;
        if cols.len() != 6 + cfg.ng() + cfg.nw {
            return Err(LimbraError::malformed(
                path.as_str(),
                format!(
                    "expected {} columns, got {}",
                    6 + cfg.ng() + cfg.nw,
                    cols.len()
                ),
            ));
        }
        atm.push_level(
            cols[0],
            cols[1],
            cols[2],
            cols[3],
            cols[4],
            cols[5],
            &cols[6..6 + cfg.ng()],
            &cols[6 + cfg.ng()..],
        );
    }
    Ok(atm)
}

/// Parse a `key= value` scalar trailer row from a comment line.
fn parse_scalar_row(comment: &str, atm: &mut Atmosphere) {
    let Some((key, value)) = comment.split_once('=') else {
        return;
    };
    let key = key.trim();
    let Ok(value) = value.trim().parse::<f64>() else {
        return;
    };
    match key {
        "clz" => atm.clz = value,
        "cldz" => atm.cldz = value,
        "sft" => atm.sft = value,
        _ => {
            for (name, arr) in [("clk", &mut atm.clk), ("sfeps", &mut atm.sfeps)] {
                if let Some(idx) = key
                    .strip_prefix(name)
                    .and_then(|s| s.strip_prefix('['))
                    .and_then(|s| s.strip_suffix(']'))
                    .and_then(|s| s.parse::<usize>().ok())
                {
                    if idx < arr.len() {
                        arr[idx] = value;
                    }
                }
            }
        }
    }
}

fn read_atm_bin(path: &Utf8Path, cfg: &Config) -> Result<Atmosphere> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let mut rd = BinReader::new(&buf, path.as_str());

    let np = rd.u32()? as usize;
    let mut atm = Atmosphere::new(cfg);
    atm.time = rd.f64_vec(np)?;
    atm.z = rd.f64_vec(np)?;
    atm.lon = rd.f64_vec(np)?;
    atm.lat = rd.f64_vec(np)?;
    atm.p = rd.f64_vec(np)?;
    atm.t = rd.f64_vec(np)?;
    for ig in 0..cfg.ng() {
        atm.q[ig] = rd.f64_vec(np)?;
    }
    for iw in 0..cfg.nw {
        atm.k[iw] = rd.f64_vec(np)?;
    }
    atm.clz = rd.f64()?;
    atm.cldz = rd.f64()?;
    atm.clk = rd.f64_vec(cfg.ncl())?;
    atm.sft = rd.f64()?;
    atm.sfeps = rd.f64_vec(cfg.nsf())?;
    Ok(atm)
}

/// Write atmospheric data to a file.
pub fn write_atm(path: &Utf8Path, cfg: &Config, atm: &Atmosphere, fmt: AtmFormat) -> Result<()> {
    info!("Write atmospheric data: {path}");
    match fmt {
        AtmFormat::Ascii => write_atm_asc(path, cfg, atm),
        AtmFormat::Binary => write_atm_bin(path, cfg, atm),
    }
}

fn write_atm_asc(path: &Utf8Path, cfg: &Config, atm: &Atmosphere) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);

    writeln!(
        out,
        "# $1 = time (seconds since 2000-01-01T00:00Z)\n\
         # $2 = altitude [km]\n\
         # $3 = longitude [deg]\n\
         # $4 = latitude [deg]\n\
         # $5 = pressure [hPa]\n\
         # $6 = temperature [K]"
    )?;
    for ig in 0..cfg.ng() {
        writeln!(
            out,
            "# ${} = {} volume mixing ratio [ppv]",
            7 + ig,
            cfg.emitter[ig]
        )?;
    }
    for iw in 0..cfg.nw {
        writeln!(
            out,
            "# ${} = extinction (window {iw}) [km^-1]",
            7 + cfg.ng() + iw
        )?;
    }
    writeln!(out)?;

    for ip in 0..atm.np() {
        write!(
            out,
            "{:.2} {} {} {} {} {}",
            atm.time[ip], atm.z[ip], atm.lon[ip], atm.lat[ip], atm.p[ip], atm.t[ip]
        )?;
        for ig in 0..cfg.ng() {
            write!(out, " {}", atm.q[ig][ip])?;
        }
        for iw in 0..cfg.nw {
            write!(out, " {}", atm.k[iw][ip])?;
        }
        writeln!(out)?;
    }

    writeln!(out, "\n# clz= {}", atm.clz)?;
    writeln!(out, "# cldz= {}", atm.cldz)?;
    for (icl, clk) in atm.clk.iter().enumerate() {
        writeln!(out, "# clk[{icl}]= {clk}")?;
    }
    writeln!(out, "# sft= {}", atm.sft)?;
    for (isf, eps) in atm.sfeps.iter().enumerate() {
        writeln!(out, "# sfeps[{isf}]= {eps}")?;
    }
    Ok(())
}

fn write_atm_bin(path: &Utf8Path, cfg: &Config, atm: &Atmosphere) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    out.write_all(&(atm.np() as u32).to_le_bytes())?;
    for arr in [&atm.time, &atm.z, &atm.lon, &atm.lat, &atm.p, &atm.t] {
        write_f64_slice(&mut out, arr)?;
    }
    for ig in 0..cfg.ng() {
        write_f64_slice(&mut out, &atm.q[ig])?;
    }
    for iw in 0..cfg.nw {
        write_f64_slice(&mut out, &atm.k[iw])?;
    }
    write_f64_slice(&mut out, &[atm.clz, atm.cldz])?;
    write_f64_slice(&mut out, &atm.clk)?;
    write_f64_slice(&mut out, &[atm.sft])?;
    write_f64_slice(&mut out, &atm.sfeps)?;
    Ok(())
}

pub(crate) fn write_f64_slice(out: &mut impl Write, data: &[f64]) -> Result<()> {
    for v in data {
        out.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// Cursor over a little-endian binary buffer.
pub(crate) struct BinReader<'a> {
    buf: &'a [u8],
    pos: usize,
    file: &'a str,
}

impl<'a> BinReader<'a> {
    pub fn new(buf: &'a [u8], file: &'a str) -> Self {
        BinReader { buf, pos: 0, file }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(LimbraError::malformed(self.file, "unexpected end of file"));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn f64_vec(&mut self, n: usize) -> Result<Vec<f64>> {
        (0..n).map(|_| self.f64()).collect()
    }

    pub fn f32_vec(&mut self, n: usize) -> Result<Vec<f32>> {
        (0..n).map(|_| self.f32()).collect()
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }
}
