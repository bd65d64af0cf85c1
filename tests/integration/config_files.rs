// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use hypergrid::{config::ConfigError, GridderConfig, ImagingError, ImagingSession};
use serial_test::serial;

use crate::*;

#[test]
#[serial]
fn sessions_come_from_config_files() {
    let (_dir, path) = write_config(CONFIG, "config.toml");
    let config = GridderConfig::from_file(&path).unwrap();
    assert_eq!(config.grid.n_chan, 3);
    assert_eq!(config.cf.support, 3);

    let session = ImagingSession::new(config).unwrap();
    let shape = session.accumulator().shape();
    assert_eq!((shape.n_pol, shape.n_chan, shape.ny, shape.nx), (1, 3, 64, 64));
    assert!(session.store().is_empty());
}

#[test]
fn bad_files_are_rejected() {
    let (_dir, path) = write_config(CONFIG, "config.txt");
    assert!(matches!(
        GridderConfig::from_file(&path),
        Err(ConfigError::UnrecognisedFileType { .. })
    ));

    let (_dir, path) = write_config(&CONFIG.replace("nx = 64", "nx = 0"), "config.toml");
    assert!(matches!(
        GridderConfig::from_file(&path),
        Err(ConfigError::EmptyGrid { .. })
    ));

    let (_dir, path) = write_config(
        &CONFIG.replace("[resample]", "[resample]\ndevice = \"cpu\""),
        "config.toml",
    );
    assert!(GridderConfig::from_file(&path).is_err());
}

fn with_cache_dir(dir: &std::path::Path) -> String {
    CONFIG.replace(
        "sampling = 4",
        &format!("sampling = 4\ncache_dir = {:?}", dir.display().to_string()),
    )
}

#[test]
#[serial]
fn cf_caches_are_reused_between_sessions() {
    let cache_dir = TempDir::new().unwrap();
    let contents = with_cache_dir(cache_dir.path());
    let (_dir, path) = write_config(&contents, "config.toml");

    let vb = buffer(0, 10);
    let spws = [spw(0)];
    let mut first = ImagingSession::new(GridderConfig::from_file(&path).unwrap()).unwrap();
    first
        .run_major_cycle(&spws, &[vb.clone()], Default::default())
        .unwrap();
    assert!(std::fs::read_dir(cache_dir.path()).unwrap().count() > 0);

    let mut second = ImagingSession::new(GridderConfig::from_file(&path).unwrap()).unwrap();
    second
        .run_major_cycle(&spws, &[vb], Default::default())
        .unwrap();
    assert_eq!(first.accumulator().grid(), second.accumulator().grid());
}

#[test]
#[serial]
fn cache_dirs_must_be_directories() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("not_a_dir");
    std::fs::write(&file, "").unwrap();
    let contents = with_cache_dir(&file);
    let (_dir, path) = write_config(&contents, "config.toml");
    let result = ImagingSession::new(GridderConfig::from_file(&path).unwrap());
    assert!(matches!(result, Err(ImagingError::CfCache(_))));
}
