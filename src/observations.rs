//! Observation geometry and radiance data.
//!
//! Each ray connects an observer position to a view point; the tangent point
//! is filled in by the raytracer and is a NaN triple for rays without a limb
//! tangent. Radiance and transmittance are stored per channel and ray.

use std::fs;
use std::io::{BufWriter, Read, Write};

use camino::Utf8Path;
use log::info;

use crate::atmosphere::{write_f64_slice, BinReader};
use crate::config::Config;
use crate::errors::{LimbraError, Result};

/// File layout of observation data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObsFormat {
    Ascii,
    Binary,
}

/// A set of rays with per-channel radiances.
#[derive(Debug, Clone, PartialEq)]
pub struct Observations {
    /// Time (seconds since 2000-01-01T00:00Z).
    pub time: Vec<f64>,
    /// Observer position.
    pub obsz: Vec<f64>,
    pub obslon: Vec<f64>,
    pub obslat: Vec<f64>,
    /// View point.
    pub vpz: Vec<f64>,
    pub vplon: Vec<f64>,
    pub vplat: Vec<f64>,
    /// Tangent point (NaN when the ray has no limb tangent).
    pub tpz: Vec<f64>,
    pub tplon: Vec<f64>,
    pub tplat: Vec<f64>,
    /// Radiance [W/(m^2 sr cm^-1)] or brightness temperature [K], `[id][ir]`.
    pub rad: Vec<Vec<f64>>,
    /// Transmittance of the ray path, `[id][ir]`.
    pub tau: Vec<Vec<f64>>,
}

impl Observations {
    /// An empty observation set dimensioned for a configuration.
    pub fn new(cfg: &Config) -> Self {
        Observations {
            time: Vec::new(),
            obsz: Vec::new(),
            obslon: Vec::new(),
            obslat: Vec::new(),
            vpz: Vec::new(),
            vplon: Vec::new(),
            vplat: Vec::new(),
            tpz: Vec::new(),
            tplon: Vec::new(),
            tplat: Vec::new(),
            rad: vec![Vec::new(); cfg.nd()],
            tau: vec![Vec::new(); cfg.nd()],
        }
    }

    /// Number of rays.
    pub fn nr(&self) -> usize {
        self.time.len()
    }

    /// Append a ray with unset tangent point and zero radiances.
    #[allow(clippy::too_many_arguments)]
    pub fn push_ray(
        &mut self,
        time: f64,
        obsz: f64,
        obslon: f64,
        obslat: f64,
        vpz: f64,
        vplon: f64,
        vplat: f64,
    ) {
        self.time.push(time);
        self.obsz.push(obsz);
        self.obslon.push(obslon);
        self.obslat.push(obslat);
        self.vpz.push(vpz);
        self.vplon.push(vplon);
        self.vplat.push(vplat);
        self.tpz.push(f64::NAN);
        self.tplon.push(f64::NAN);
        self.tplat.push(f64::NAN);
        for col in self.rad.iter_mut().chain(self.tau.iter_mut()) {
            col.push(0.0);
        }
    }
}

/// Read observation data from a file.
pub fn read_obs(path: &Utf8Path, cfg: &Config, fmt: ObsFormat) -> Result<Observations> {
    let obs = match fmt {
        ObsFormat::Ascii => read_obs_asc(path, cfg)?,
        ObsFormat::Binary => read_obs_bin(path, cfg)?,
    };
    if obs.nr() == 0 {
        return Err(LimbraError::malformed(path.as_str(), "no ray paths"));
    }
    info!("Read observation data: {path} ({} rays)", obs.nr());
    Ok(obs)
}

fn read_obs_asc(path: &Utf8Path, cfg: &Config) -> Result<Observations> {
    let text = fs::read_to_string(path)?;
    let mut obs = Observations::new(cfg);

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let cols: Vec<f64> = trimmed
            .split_whitespace()
            .map(|tok| {
                tok.parse::<f64>()
                    .map_err(|_| LimbraError::malformed(path.as_str(), format!("bad number: {tok}")))
            })
            .collect::<Result<_>>()?;
        if cols.len() != 10 + 2 * cfg.nd() {
            return Err(LimbraError::malformed(
                path.as_str(),
                format!("expected {} columns, got {}", 10 + 2 * cfg.nd(), cols.len()),
            ));
        }

        let ir = obs.nr();
        obs.push_ray(cols[0], cols[1], cols[2], cols[3], cols[4], cols[5], cols[6]);
        obs.tpz[ir] = cols[7];
        obs.tplon[ir] = cols[8];
        obs.tplat[ir] = cols[9];
        for id in 0..cfg.nd() {
            obs.rad[id][ir] = cols[10 + 2 * id];
            obs.tau[id][ir] = cols[11 + 2 * id];
        }
    }
    Ok(obs)
}

fn read_obs_bin(path: &Utf8Path, cfg: &Config) -> Result<Observations> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let mut rd = BinReader::new(&buf, path.as_str());

    let nr = rd.u32()? as usize;
    let mut obs = Observations::new(cfg);
    obs.time = rd.f64_vec(nr)?;
    obs.obsz = rd.f64_vec(nr)?;
    obs.obslon = rd.f64_vec(nr)?;
    obs.obslat = rd.f64_vec(nr)?;
    obs.vpz = rd.f64_vec(nr)?;
    obs.vplon = rd.f64_vec(nr)?;
    obs.vplat = rd.f64_vec(nr)?;
    obs.tpz = rd.f64_vec(nr)?;
    obs.tplon = rd.f64_vec(nr)?;
    obs.tplat = rd.f64_vec(nr)?;
    for id in 0..cfg.nd() {
        obs.rad[id] = rd.f64_vec(nr)?;
    }
    for id in 0..cfg.nd() {
        obs.tau[id] = rd.f64_vec(nr)?;
    }
    Ok(obs)
}

/// Write observation data to a file.
pub fn write_obs(path: &Utf8Path, cfg: &Config, obs: &Observations, fmt: ObsFormat) -> Result<()> {
    info!("Write observation data: {path}");
    match fmt {
        ObsFormat::Ascii => write_obs_asc(path, cfg, obs),
        ObsFormat::Binary => write_obs_bin(path, cfg, obs),
    }
}

fn write_obs_asc(path: &Utf8Path, cfg: &Config, obs: &Observations) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);

    writeln!(
        out,
        "# $1 = time (seconds since 2000-01-01T00:00Z)\n\
         # $2 = observer altitude [km]\n\
         # $3 = observer longitude [deg]\n\
         # $4 = observer latitude [deg]\n\
         # $5 = view point altitude [km]\n\
         # $6 = view point longitude [deg]\n\
         # $7 = view point latitude [deg]\n\
         # $8 = tangent point altitude [km]\n\
         # $9 = tangent point longitude [deg]\n\
         # $10 = tangent point latitude [deg]"
    )?;
    for id in 0..cfg.nd() {
        let unit = if cfg.write_bbt {
            "brightness temperature [K]"
        } else {
            "radiance [W/(m^2 sr cm^-1)]"
        };
        writeln!(
            out,
            "# ${} = channel {:.4} cm^-1: {unit}\n# ${} = channel {:.4} cm^-1: transmittance",
            11 + 2 * id,
            cfg.nu[id],
            12 + 2 * id,
            cfg.nu[id]
        )?;
    }
    writeln!(out)?;

    for ir in 0..obs.nr() {
        write!(
            out,
            "{:.2} {} {} {} {} {} {} {} {} {}",
            obs.time[ir],
            obs.obsz[ir],
            obs.obslon[ir],
            obs.obslat[ir],
            obs.vpz[ir],
            obs.vplon[ir],
            obs.vplat[ir],
            obs.tpz[ir],
            obs.tplon[ir],
            obs.tplat[ir]
        )?;
        for id in 0..cfg.nd() {
            write!(out, " {} {}", obs.rad[id][ir], obs.tau[id][ir])?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn write_obs_bin(path: &Utf8Path, cfg: &Config, obs: &Observations) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    out.write_all(&(obs.nr() as u32).to_le_bytes())?;
    for arr in [
        &obs.time,
        &obs.obsz,
        &obs.obslon,
        &obs.obslat,
        &obs.vpz,
        &obs.vplon,
        &obs.vplat,
        &obs.tpz,
        &obs.tplon,
        &obs.tplat,
    ] {
        write_f64_slice(&mut out, arr)?;
    }
    for id in 0..cfg.nd() {
        write_f64_slice(&mut out, &obs.rad[id])?;
    }
    for id in 0..cfg.nd() {
        write_f64_slice(&mut out, &obs.tau[id])?;
    }
    Ok(())
}
