//! End-to-end forward-model scenarios on the synthetic absorber.

mod common;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use limbra::forward::formod;
use limbra::geo::planck;
use limbra::observations::Observations;
use limbra::raytrace::raytrace;

use common::{config_with, standard_atmosphere, synthetic_store};

/// Observer and view point at the same altitude on opposite sides of the
/// tangent produce the same path and radiance in either direction.
#[test]
fn limb_ray_symmetry() {
    let cfg = config_with(&[("RAYDS", "5"), ("RAYDZ", "0.25")]);
    let tbl = synthetic_store(&cfg);
    let atm = standard_atmosphere(&cfg, 80.0, 2.0, 5e-9);

    let mut forward = Observations::new(&cfg);
    forward.push_ray(0.0, 60.0, -2.0, 0.0, 60.0, 2.0, 0.0);
    let mut backward = Observations::new(&cfg);
    backward.push_ray(0.0, 60.0, 2.0, 0.0, 60.0, -2.0, 0.0);

    let los_f = raytrace(&cfg, &atm, &forward, 0).unwrap();
    let los_b = raytrace(&cfg, &atm, &backward, 0).unwrap();

    let (tz_f, _, _) = los_f.tangent_point();
    let (tz_b, _, _) = los_b.tangent_point();
    assert_abs_diff_eq!(tz_f, tz_b, epsilon = 0.25);

    let len_f: f64 = los_f.ds.iter().sum();
    let len_b: f64 = los_b.ds.iter().sum();
    assert_relative_eq!(len_f, len_b, max_relative = 1e-6);

    formod(&cfg, &tbl, &atm, &mut forward).unwrap();
    formod(&cfg, &tbl, &atm, &mut backward).unwrap();
    assert_relative_eq!(forward.rad[0][0], backward.rad[0][0], max_relative = 1e-9);
    assert_relative_eq!(forward.tau[0][0], backward.tau[0][0], max_relative = 1e-9);
}

/// A nadir view through a nearly transparent column is dominated by the
/// surface Planck emission; an opaque column hides the surface entirely.
#[test]
fn nadir_radiance_between_atmosphere_and_surface() {
    let cfg = config_with(&[
        ("NU[0]", "667.5"),
        ("RAYDS", "10"),
        ("RAYDZ", "1"),
        ("SFTYPE", "1"),
    ]);
    let tbl = synthetic_store(&cfg);

    let mut obs = Observations::new(&cfg);
    obs.push_ray(0.0, 705.0, 0.0, 0.0, 0.0, 0.0, 0.0);

    // Nearly transparent column.
    let thin = standard_atmosphere(&cfg, 80.0, 2.0, 1e-10);
    let mut obs_thin = obs.clone();
    formod(&cfg, &tbl, &thin, &mut obs_thin).unwrap();
    assert!(obs_thin.tau[0][0] > 0.99);
    assert_relative_eq!(
        obs_thin.rad[0][0],
        planck(288.15, 667.5),
        max_relative = 2e-2
    );

    // Optically thick column: the radiance forms in the cold atmosphere
    // above the surface.
    let thick = standard_atmosphere(&cfg, 80.0, 2.0, 3.7e-4);
    let mut obs_thick = obs.clone();
    formod(&cfg, &tbl, &thick, &mut obs_thick).unwrap();
    assert!(obs_thick.tau[0][0] < 1e-6);
    assert!(obs_thick.rad[0][0] < obs_thin.rad[0][0]);
    assert!(obs_thick.rad[0][0] > 0.0);
}

/// Limb radiances decrease with tangent altitude once the path thins out.
#[test]
fn limb_scan_radiance_profile_decreases_aloft() {
    let cfg = config_with(&[("RAYDS", "10"), ("RAYDZ", "0.5")]);
    let tbl = synthetic_store(&cfg);
    let atm = standard_atmosphere(&cfg, 80.0, 2.0, 2e-8);

    let mut obs = Observations::new(&cfg);
    for tz in [20.0, 30.0, 40.0, 50.0, 60.0] {
        obs.push_ray(0.0, 800.0, 0.0, -30.0, tz, 0.0, 0.0);
    }
    formod(&cfg, &tbl, &atm, &mut obs).unwrap();

    for ir in 1..obs.nr() {
        assert!(
            obs.rad[0][ir] < obs.rad[0][ir - 1],
            "radiance not decreasing between tangents {} and {}",
            obs.tpz[ir - 1],
            obs.tpz[ir]
        );
        assert!(obs.tau[0][ir] > obs.tau[0][ir - 1]);
    }
}

/// The tangent points reported alongside the radiances track the requested
/// view-point altitudes.
#[test]
fn tangent_points_track_view_points() {
    let cfg = config_with(&[("RAYDS", "10"), ("RAYDZ", "0.25")]);
    let tbl = synthetic_store(&cfg);
    let atm = standard_atmosphere(&cfg, 80.0, 2.0, 2e-8);

    let mut obs = Observations::new(&cfg);
    for tz in [12.0, 24.0, 36.0] {
        obs.push_ray(0.0, 800.0, 0.0, -30.0, tz, 0.0, 0.0);
    }
    formod(&cfg, &tbl, &atm, &mut obs).unwrap();

    for (ir, tz) in [12.0, 24.0, 36.0].into_iter().enumerate() {
        assert_abs_diff_eq!(obs.tpz[ir], tz, epsilon = 0.3);
    }
}
