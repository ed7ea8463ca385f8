//! Control parameters.
//!
//! The control file is newline-separated `KEY value` or `KEY[i] value`
//! entries; `#` starts a comment. Command-line `KEY=value` pairs override
//! file entries. The file is parsed once into a map and queried thereafter.

use std::collections::HashMap;
use std::fs;

use ahash::RandomState;
use camino::Utf8Path;
use log::debug;

use crate::errors::{LimbraError, Result};

/// Treatment of the surface contribution at the lower end of a ray.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceType {
    /// Ignore the surface.
    None,
    /// Surface emission only.
    Emission,
    /// Emission plus reflected downward radiance.
    Downward,
    /// Emission plus reflected solar radiance.
    Solar,
}

/// Band transmittance model along the ray.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardKind {
    /// Curtis-Godson approximation.
    Cga,
    /// Emissivity growth approximation.
    Ega,
    /// Host-provided external engine.
    External,
}

/// Look-up table file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Ascii,
    Binary,
    /// One binary file per gas holding all channels.
    GasGrouped,
}

/// Parsed control entries, file values overlaid by command-line pairs.
pub struct ControlMap {
    source: String,
    map: HashMap<String, String, RandomState>,
}

impl ControlMap {
    /// Parse a control file and apply `KEY=value` overrides on top.
    pub fn read(path: &Utf8Path, overrides: &[String]) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut map: HashMap<String, String, RandomState> = HashMap::default();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut it = line.splitn(2, char::is_whitespace);
            let key = it.next().unwrap_or("");
            let value = it.next().unwrap_or("").trim();
            if value.is_empty() {
                return Err(LimbraError::malformed(
                    path.as_str(),
                    format!("control entry without value: {key}"),
                ));
            }
            map.insert(key.to_uppercase(), value.to_string());
        }
        let mut ctl = ControlMap {
            source: path.to_string(),
            map,
        };
        ctl.apply_overrides(overrides)?;
        Ok(ctl)
    }

    /// Build a control map from key/value pairs only (no file).
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let mut map: HashMap<String, String, RandomState> = HashMap::default();
        for (k, v) in pairs {
            map.insert(k.to_uppercase(), v.to_string());
        }
        ControlMap {
            source: "<inline>".to_string(),
            map,
        }
    }

    fn apply_overrides(&mut self, overrides: &[String]) -> Result<()> {
        for ov in overrides {
            let (key, value) = ov.split_once('=').ok_or_else(|| LimbraError::Config {
                key: ov.clone(),
                reason: "override must have the form KEY=value".to_string(),
            })?;
            self.map.insert(key.to_uppercase(), value.to_string());
        }
        Ok(())
    }

    fn raw(&self, name: &str, idx: Option<usize>) -> Option<&str> {
        let key = match idx {
            Some(i) => format!("{name}[{i}]"),
            None => name.to_string(),
        };
        self.map.get(&key.to_uppercase()).map(String::as_str)
    }

    /// Look up a string entry, falling back to `default` (`None` = mandatory).
    pub fn string(&self, name: &str, idx: Option<usize>, default: Option<&str>) -> Result<String> {
        let value = match self.raw(name, idx) {
            Some(v) => v.to_string(),
            None => match default {
                Some(d) => d.to_string(),
                None => return Err(LimbraError::MissingKey(name.to_string())),
            },
        };
        debug!("{} = {}", fmt_key(name, idx), value);
        Ok(value)
    }

    pub fn f64(&self, name: &str, idx: Option<usize>, default: Option<&str>) -> Result<f64> {
        let value = self.string(name, idx, default)?;
        value.parse().map_err(|_| LimbraError::Config {
            key: fmt_key(name, idx),
            reason: format!("not a number: {value} (from {})", self.source),
        })
    }

    pub fn usize(&self, name: &str, idx: Option<usize>, default: Option<&str>) -> Result<usize> {
        let value = self.string(name, idx, default)?;
        value.parse().map_err(|_| LimbraError::Config {
            key: fmt_key(name, idx),
            reason: format!("not a non-negative integer: {value} (from {})", self.source),
        })
    }

    pub fn flag(&self, name: &str, default: Option<&str>) -> Result<bool> {
        Ok(self.usize(name, None, default)? != 0)
    }
}

fn fmt_key(name: &str, idx: Option<usize>) -> String {
    match idx {
        Some(i) => format!("{name}[{i}]"),
        None => name.to_string(),
    }
}

/// Forward-model configuration.
///
/// Collects every knob of the radiative-transfer pipeline so it can be passed
/// around as one value. Built from a [`ControlMap`] by [`Config::from_control`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Emitter names.
    pub emitter: Vec<String>,
    /// Emitter indices of the continuum species, if present.
    pub ig_co2: Option<usize>,
    pub ig_h2o: Option<usize>,
    pub ig_n2: Option<usize>,
    pub ig_o2: Option<usize>,

    /// Centroid wavenumber of each radiance channel [cm^-1].
    pub nu: Vec<f64>,
    /// Number of spectral windows.
    pub nw: usize,
    /// Window index of each channel.
    pub window: Vec<usize>,

    /// Cloud layer spectral grid [cm^-1].
    pub clnu: Vec<f64>,
    /// Surface layer spectral grid [cm^-1].
    pub sfnu: Vec<f64>,
    /// Surface treatment.
    pub sftype: SurfaceType,
    /// Solar zenith angle at the surface [deg] (negative = derive from time).
    pub sfsza: f64,

    /// Basename of the emissivity table files ("-" = no tables).
    pub tblbase: String,
    pub tblfmt: TableFormat,

    /// Reference height for hydrostatic pressure adjustment [km] (negative = skip).
    pub hydz: f64,

    /// Continuum switches.
    pub ctm_co2: bool,
    pub ctm_h2o: bool,
    pub ctm_n2: bool,
    pub ctm_o2: bool,

    /// Refractive bending of rays.
    pub refrac: bool,
    /// Maximum step length for raytracing [km].
    pub rayds: f64,
    /// Maximum vertical step for raytracing [km].
    pub raydz: f64,

    /// Field-of-view shape: vertical offset [km] and weight pairs (empty = pencil beam).
    pub fov_dz: Vec<f64>,
    pub fov_w: Vec<f64>,
    /// Number of sub-rays for the FOV convolution.
    pub nfov: usize,

    /// Retrieval altitude windows [km].
    pub retp_zmin: f64,
    pub retp_zmax: f64,
    pub rett_zmin: f64,
    pub rett_zmax: f64,
    pub retq_zmin: Vec<f64>,
    pub retq_zmax: Vec<f64>,
    pub retk_zmin: Vec<f64>,
    pub retk_zmax: Vec<f64>,

    /// Retrieval flags for the scalar quantities.
    pub ret_clz: bool,
    pub ret_cldz: bool,
    pub ret_clk: bool,
    pub ret_sft: bool,
    pub ret_sfeps: bool,

    /// Report brightness temperatures instead of radiances.
    pub write_bbt: bool,
    /// Write matrix files during retrieval.
    pub write_matrix: bool,

    /// Band transmittance model.
    pub formod: ForwardKind,
}

impl Config {
    /// Number of emitters.
    pub fn ng(&self) -> usize {
        self.emitter.len()
    }

    /// Number of radiance channels.
    pub fn nd(&self) -> usize {
        self.nu.len()
    }

    /// Number of cloud layer spectral grid points.
    pub fn ncl(&self) -> usize {
        self.clnu.len()
    }

    /// Number of surface layer spectral grid points.
    pub fn nsf(&self) -> usize {
        self.sfnu.len()
    }

    /// Find the index of an emitter by (case-insensitive) name.
    pub fn find_emitter(&self, name: &str) -> Option<usize> {
        self.emitter.iter().position(|e| e.eq_ignore_ascii_case(name))
    }

    /// Build the forward-model configuration from parsed control entries.
    pub fn from_control(ctl: &ControlMap) -> Result<Self> {
        let ng = ctl.usize("NG", None, None)?;
        let mut emitter = Vec::with_capacity(ng);
        for ig in 0..ng {
            emitter.push(ctl.string("EMITTER", Some(ig), None)?);
        }

        let nd = ctl.usize("ND", None, None)?;
        let mut nu = Vec::with_capacity(nd);
        for id in 0..nd {
            nu.push(ctl.f64("NU", Some(id), None)?);
        }

        let nw = ctl.usize("NW", None, Some("1"))?;
        let mut window = Vec::with_capacity(nd);
        for id in 0..nd {
            let iw = ctl.usize("WINDOW", Some(id), Some("0"))?;
            if iw >= nw {
                return Err(LimbraError::Config {
                    key: format!("WINDOW[{id}]"),
                    reason: format!("window index {iw} >= NW = {nw}"),
                });
            }
            window.push(iw);
        }

        let ncl = ctl.usize("NCL", None, Some("0"))?;
        let mut clnu = Vec::with_capacity(ncl);
        for icl in 0..ncl {
            clnu.push(ctl.f64("CLNU", Some(icl), None)?);
        }

        let nsf = ctl.usize("NSF", None, Some("0"))?;
        let mut sfnu = Vec::with_capacity(nsf);
        for isf in 0..nsf {
            sfnu.push(ctl.f64("SFNU", Some(isf), None)?);
        }

        let sftype = match ctl.usize("SFTYPE", None, Some("0"))? {
            0 => SurfaceType::None,
            1 => SurfaceType::Emission,
            2 => SurfaceType::Downward,
            3 => SurfaceType::Solar,
            v => {
                return Err(LimbraError::Config {
                    key: "SFTYPE".to_string(),
                    reason: format!("unknown surface type {v}"),
                })
            }
        };

        let tblfmt = match ctl.usize("TBLFMT", None, Some("1"))? {
            1 => TableFormat::Ascii,
            2 => TableFormat::Binary,
            3 => TableFormat::GasGrouped,
            v => {
                return Err(LimbraError::Config {
                    key: "TBLFMT".to_string(),
                    reason: format!("unknown table format {v}"),
                })
            }
        };

        let formod = match ctl.usize("FORMOD", None, Some("1"))? {
            0 => ForwardKind::Cga,
            1 => ForwardKind::Ega,
            2 => ForwardKind::External,
            v => {
                return Err(LimbraError::Config {
                    key: "FORMOD".to_string(),
                    reason: format!("unknown forward model {v}"),
                })
            }
        };

        // Optional field-of-view shape.
        let fovfile = ctl.string("FOV", None, Some("-"))?;
        let (fov_dz, fov_w) = if fovfile == "-" {
            (Vec::new(), Vec::new())
        } else {
            read_shape(Utf8Path::new(&fovfile))?
        };

        let mut retq_zmin = Vec::with_capacity(ng);
        let mut retq_zmax = Vec::with_capacity(ng);
        for ig in 0..ng {
            retq_zmin.push(ctl.f64("RETQ_ZMIN", Some(ig), Some("-999"))?);
            retq_zmax.push(ctl.f64("RETQ_ZMAX", Some(ig), Some("-999"))?);
        }
        let mut retk_zmin = Vec::with_capacity(nw);
        let mut retk_zmax = Vec::with_capacity(nw);
        for iw in 0..nw {
            retk_zmin.push(ctl.f64("RETK_ZMIN", Some(iw), Some("-999"))?);
            retk_zmax.push(ctl.f64("RETK_ZMAX", Some(iw), Some("-999"))?);
        }

        let cfg = Config {
            ig_co2: emitter.iter().position(|e| e.eq_ignore_ascii_case("CO2")),
            ig_h2o: emitter.iter().position(|e| e.eq_ignore_ascii_case("H2O")),
            ig_n2: emitter.iter().position(|e| e.eq_ignore_ascii_case("N2")),
            ig_o2: emitter.iter().position(|e| e.eq_ignore_ascii_case("O2")),
            emitter,
            nu,
            nw,
            window,
            clnu,
            sfnu,
            sftype,
            sfsza: ctl.f64("SFSZA", None, Some("-999"))?,
            tblbase: ctl.string("TBLBASE", None, Some("-"))?,
            tblfmt,
            hydz: ctl.f64("HYDZ", None, Some("-999"))?,
            ctm_co2: ctl.flag("CTM_CO2", Some("1"))?,
            ctm_h2o: ctl.flag("CTM_H2O", Some("1"))?,
            ctm_n2: ctl.flag("CTM_N2", Some("1"))?,
            ctm_o2: ctl.flag("CTM_O2", Some("1"))?,
            refrac: ctl.flag("REFRAC", Some("1"))?,
            rayds: ctl.f64("RAYDS", None, Some("10"))?,
            raydz: ctl.f64("RAYDZ", None, Some("0.1"))?,
            fov_dz,
            fov_w,
            nfov: ctl.usize("NFOV", None, Some("5"))?,
            retp_zmin: ctl.f64("RETP_ZMIN", None, Some("-999"))?,
            retp_zmax: ctl.f64("RETP_ZMAX", None, Some("-999"))?,
            rett_zmin: ctl.f64("RETT_ZMIN", None, Some("-999"))?,
            rett_zmax: ctl.f64("RETT_ZMAX", None, Some("-999"))?,
            retq_zmin,
            retq_zmax,
            retk_zmin,
            retk_zmax,
            ret_clz: ctl.flag("RET_CLZ", Some("0"))?,
            ret_cldz: ctl.flag("RET_CLDZ", Some("0"))?,
            ret_clk: ctl.flag("RET_CLK", Some("0"))?,
            ret_sft: ctl.flag("RET_SFT", Some("0"))?,
            ret_sfeps: ctl.flag("RET_SFEPS", Some("0"))?,
            write_bbt: ctl.flag("WRITE_BBT", Some("0"))?,
            write_matrix: ctl.flag("WRITE_MATRIX", Some("0"))?,
            formod,
        };

        if cfg.nfov == 0 || cfg.nfov % 2 == 0 {
            return Err(LimbraError::Config {
                key: "NFOV".to_string(),
                reason: "number of sub-rays must be odd".to_string(),
            });
        }

        Ok(cfg)
    }
}

/// Retrieval configuration: convergence control and error statistics.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Recompute the kernel every n-th iteration.
    pub kernel_recomp: usize,
    /// Maximum number of outer iterations.
    pub conv_itmax: usize,
    /// Normalized step-size threshold for convergence.
    pub conv_dmin: f64,
    /// Carry out the posterior error analysis.
    pub err_ana: bool,

    /// Instrument noise per channel [W/(m^2 sr cm^-1)].
    pub err_noise: Vec<f64>,
    /// Forward-model error per channel [% of measured radiance].
    pub err_formod: Vec<f64>,

    /// A priori standard deviations and correlation lengths per quantity.
    pub err_p: f64,
    pub err_p_cz: f64,
    pub err_p_ch: f64,
    pub err_t: f64,
    pub err_t_cz: f64,
    pub err_t_ch: f64,
    pub err_q: Vec<f64>,
    pub err_q_cz: Vec<f64>,
    pub err_q_ch: Vec<f64>,
    pub err_k: Vec<f64>,
    pub err_k_cz: Vec<f64>,
    pub err_k_ch: Vec<f64>,

    /// A priori standard deviations for the scalar quantities.
    pub err_clz: f64,
    pub err_cldz: f64,
    pub err_clk: Vec<f64>,
    pub err_sft: f64,
    pub err_sfeps: Vec<f64>,
}

impl RetrievalConfig {
    pub fn from_control(ctl: &ControlMap, cfg: &Config) -> Result<Self> {
        let mut err_noise = Vec::with_capacity(cfg.nd());
        let mut err_formod = Vec::with_capacity(cfg.nd());
        for id in 0..cfg.nd() {
            err_noise.push(ctl.f64("ERR_NOISE", Some(id), Some("0"))?);
            err_formod.push(ctl.f64("ERR_FORMOD", Some(id), Some("0"))?);
        }

        let mut err_q = Vec::with_capacity(cfg.ng());
        let mut err_q_cz = Vec::with_capacity(cfg.ng());
        let mut err_q_ch = Vec::with_capacity(cfg.ng());
        for ig in 0..cfg.ng() {
            err_q.push(ctl.f64("ERR_Q", Some(ig), Some("0"))?);
            err_q_cz.push(ctl.f64("ERR_Q_CZ", Some(ig), Some("-999"))?);
            err_q_ch.push(ctl.f64("ERR_Q_CH", Some(ig), Some("-999"))?);
        }
        let mut err_k = Vec::with_capacity(cfg.nw);
        let mut err_k_cz = Vec::with_capacity(cfg.nw);
        let mut err_k_ch = Vec::with_capacity(cfg.nw);
        for iw in 0..cfg.nw {
            err_k.push(ctl.f64("ERR_K", Some(iw), Some("0"))?);
            err_k_cz.push(ctl.f64("ERR_K_CZ", Some(iw), Some("-999"))?);
            err_k_ch.push(ctl.f64("ERR_K_CH", Some(iw), Some("-999"))?);
        }
        let mut err_clk = Vec::with_capacity(cfg.ncl());
        for icl in 0..cfg.ncl() {
            err_clk.push(ctl.f64("ERR_CLK", Some(icl), Some("0"))?);
        }
        let mut err_sfeps = Vec::with_capacity(cfg.nsf());
        for isf in 0..cfg.nsf() {
            err_sfeps.push(ctl.f64("ERR_SFEPS", Some(isf), Some("0"))?);
        }

        let kernel_recomp = ctl.usize("KERNEL_RECOMP", None, Some("3"))?;
        if kernel_recomp == 0 {
            return Err(LimbraError::Config {
                key: "KERNEL_RECOMP".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(RetrievalConfig {
            kernel_recomp,
            conv_itmax: ctl.usize("CONV_ITMAX", None, Some("30"))?,
            conv_dmin: ctl.f64("CONV_DMIN", None, Some("0.1"))?,
            err_ana: ctl.flag("ERR_ANA", Some("1"))?,
            err_noise,
            err_formod,
            err_p: ctl.f64("ERR_P", None, Some("0"))?,
            err_p_cz: ctl.f64("ERR_P_CZ", None, Some("-999"))?,
            err_p_ch: ctl.f64("ERR_P_CH", None, Some("-999"))?,
            err_t: ctl.f64("ERR_T", None, Some("0"))?,
            err_t_cz: ctl.f64("ERR_T_CZ", None, Some("-999"))?,
            err_t_ch: ctl.f64("ERR_T_CH", None, Some("-999"))?,
            err_q,
            err_q_cz,
            err_q_ch,
            err_k,
            err_k_cz,
            err_k_ch,
            err_clz: ctl.f64("ERR_CLZ", None, Some("0"))?,
            err_cldz: ctl.f64("ERR_CLDZ", None, Some("0"))?,
            err_clk,
            err_sft: ctl.f64("ERR_SFT", None, Some("0"))?,
            err_sfeps,
        })
    }
}

/// Read a two-column shape function (x, w) from an ASCII file.
pub fn read_shape(path: &Utf8Path) -> Result<(Vec<f64>, Vec<f64>)> {
    let text = fs::read_to_string(path)?;
    let mut x = Vec::new();
    let mut w = Vec::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut cols = line.split_whitespace();
        let (Some(xv), Some(wv)) = (cols.next(), cols.next()) else {
            return Err(LimbraError::malformed(path.as_str(), "expected two columns"));
        };
        x.push(xv.parse().map_err(|_| {
            LimbraError::malformed(path.as_str(), format!("not a number: {xv}"))
        })?);
        w.push(wv.parse().map_err(|_| {
            LimbraError::malformed(path.as_str(), format!("not a number: {wv}"))
        })?);
    }
    if x.len() < 2 {
        return Err(LimbraError::malformed(
            path.as_str(),
            "shape function needs at least two points",
        ));
    }
    Ok((x, w))
}

#[cfg(test)]
mod config_test {
    use super::*;

    fn minimal_pairs() -> Vec<(&'static str, &'static str)> {
        vec![
            ("NG", "2"),
            ("EMITTER[0]", "CO2"),
            ("EMITTER[1]", "H2O"),
            ("ND", "2"),
            ("NU[0]", "792.0"),
            ("NU[1]", "832.0"),
        ]
    }

    #[test]
    fn minimal_config() {
        let ctl = ControlMap::from_pairs(&minimal_pairs());
        let cfg = Config::from_control(&ctl).unwrap();
        assert_eq!(cfg.ng(), 2);
        assert_eq!(cfg.nd(), 2);
        assert_eq!(cfg.ig_co2, Some(0));
        assert_eq!(cfg.ig_h2o, Some(1));
        assert_eq!(cfg.ig_n2, None);
        assert_eq!(cfg.sftype, SurfaceType::None);
        assert_eq!(cfg.formod, ForwardKind::Ega);
        assert_eq!(cfg.window, vec![0, 0]);
    }

    #[test]
    fn missing_mandatory_key() {
        let ctl = ControlMap::from_pairs(&[("NG", "1"), ("EMITTER[0]", "CO2")]);
        assert!(matches!(
            Config::from_control(&ctl),
            Err(LimbraError::MissingKey(_))
        ));
    }

    #[test]
    fn window_index_out_of_range() {
        let mut pairs = minimal_pairs();
        pairs.push(("WINDOW[1]", "3"));
        let ctl = ControlMap::from_pairs(&pairs);
        assert!(matches!(
            Config::from_control(&ctl),
            Err(LimbraError::Config { .. })
        ));
    }

    #[test]
    fn overrides_beat_file_values() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "NG 1\nEMITTER[0] CO2\nND 1\nNU[0] 667.5\nRAYDS 5.0").unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(file.path().to_path_buf()).unwrap();

        let ctl = ControlMap::read(&path, &["RAYDS=2.5".to_string()]).unwrap();
        let cfg = Config::from_control(&ctl).unwrap();
        assert_eq!(cfg.rayds, 2.5);
        assert_eq!(cfg.nu[0], 667.5);
    }

    #[test]
    fn retrieval_defaults() {
        let ctl = ControlMap::from_pairs(&minimal_pairs());
        let cfg = Config::from_control(&ctl).unwrap();
        let ret = RetrievalConfig::from_control(&ctl, &cfg).unwrap();
        assert_eq!(ret.conv_itmax, 30);
        assert_eq!(ret.kernel_recomp, 3);
        assert!(ret.err_ana);
        assert_eq!(ret.err_noise.len(), 2);
    }
}
