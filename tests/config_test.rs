//! Settings loading from files and the environment.
//!
//! Environment-override tests mutate process-wide state, so they are
//! serialized.

use rust_rig::config::Settings;
use serial_test::serial;

#[test]
#[serial]
fn test_env_overrides_apply() {
    std::env::set_var("RIG_ACQUISITION__NAVGS", "8");
    std::env::set_var("RIG_EXPOSURE__MAX_ITERATIONS", "5");

    let settings = Settings::new(None).unwrap();
    assert_eq!(settings.acquisition.navgs, 8);
    assert_eq!(settings.exposure.max_iterations, 5);

    std::env::remove_var("RIG_ACQUISITION__NAVGS");
    std::env::remove_var("RIG_EXPOSURE__MAX_ITERATIONS");
}

#[test]
#[serial]
fn test_invalid_env_value_fails_validation() {
    std::env::set_var("RIG_ACQUISITION__NAVGS", "0");

    let result = Settings::new(None);
    assert!(result.is_err());

    std::env::remove_var("RIG_ACQUISITION__NAVGS");
}

#[test]
#[serial]
fn test_explicit_file_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rig.toml");
    std::fs::write(
        &path,
        "[acquisition]\nnavgs = 4\nframe_period_ms = 25\n\n[projector]\nphases = 8\nfringes = 32\n",
    )
    .unwrap();

    let settings = Settings::new(path.to_str()).unwrap();
    assert_eq!(settings.acquisition.navgs, 4);
    assert_eq!(settings.acquisition.frame_period_ms, 25);
    assert_eq!(settings.projector.phases, 8);
    // Sections absent from the file keep their defaults.
    assert!((settings.filter.start_nm - 420.0).abs() < f64::EPSILON);
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    assert!(Settings::new(Some("/nonexistent/rig.toml")).is_err());
}
