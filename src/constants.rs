use std::f64::consts::PI;

/// First spectroscopic constant (2 h c^2) [W/(m^2 sr cm^-4)].
pub const C1: f64 = 1.19104259e-8;
/// Second spectroscopic constant (h c / k) [K/cm^-1].
pub const C2: f64 = 1.43877506;

/// Standard gravity [m/s^2].
pub const G0: f64 = 9.80665;
/// Standard scale height [km].
pub const H0: f64 = 7.0;
/// Boltzmann constant [kg m^2/(K s^2)].
pub const KB: f64 = 1.3806504e-23;
/// Avogadro's number.
pub const NA: f64 = 6.02214199e23;
/// Ideal gas constant [J/(mol K)].
pub const RI: f64 = 8.3144598;
/// Molar mass of dry air [kg/mol].
pub const MA: f64 = 28.9644e-3;

/// Nitrogen volume fraction of dry air.
pub const VMR_N2: f64 = 0.78084;
/// Oxygen volume fraction of dry air.
pub const VMR_O2: f64 = 0.20946;

/// Standard pressure [hPa].
pub const P0: f64 = 1013.25;
/// Standard temperature [K].
pub const T0: f64 = 273.15;

/// Mean radius of Earth [km].
pub const RE: f64 = 6367.421;

/// Minimum temperature of the source function table [K].
pub const TMIN: f64 = 100.0;
/// Maximum temperature of the source function table [K].
pub const TMAX: f64 = 400.0;

/// Effective temperature of the sun [K].
pub const TSUN: f64 = 5780.0;
/// Solid angle of the solar disk seen from Earth [sr].
pub const OMEGA_SUN: f64 = 6.8e-5;

/// Number of source function temperature levels.
pub const TBLNS: usize = 1200;

/// Hard cap on the number of points along a single ray path.
pub const NLOS_MAX: usize = 10_000;

pub const DEG2RAD: f64 = PI / 180.0;
pub const RAD2DEG: f64 = 180.0 / PI;

// type def
pub type Kilometer = f64;
pub type HectoPascal = f64;
pub type Kelvin = f64;
/// Wavenumber [cm^-1].
pub type Wavenumber = f64;
/// Spectral radiance [W/(m^2 sr cm^-1)].
pub type Radiance = f64;
/// Seconds since 2000-01-01T00:00Z.
pub type Jsec = f64;
