// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::env;
use std::path::{Path, PathBuf};

/// Environment variable naming an alternate board configuration file.
pub const BOARD_CONFIG_VAR: &str = "BEAT_BOARD_CONFIG";

/// Exposes the CPU's M-profile architecture version. This isn't available in
/// rustc's standard environment.
///
/// This will set one of `cfg(armv6m`), `cfg(armv7m)`, or `cfg(armv8m)`
/// depending on the value of the `TARGET` environment variable. Host targets
/// (used for the simulated runtime and its tests) get none of them.
pub fn expose_m_profile() {
    println!("cargo:rustc-check-cfg=cfg(armv6m)");
    println!("cargo:rustc-check-cfg=cfg(armv7m)");
    println!("cargo:rustc-check-cfg=cfg(armv8m)");

    let target = target();
    if target.starts_with("thumbv6m") {
        println!("cargo:rustc-cfg=armv6m");
    } else if target.starts_with("thumbv7m") || target.starts_with("thumbv7em")
    {
        println!("cargo:rustc-cfg=armv7m");
    } else if target.starts_with("thumbv8m") {
        println!("cargo:rustc-cfg=armv8m");
    }
}

/// Returns `true` when building for a bare-metal target, i.e. when the
/// linker script has to be applied.
pub fn is_bare_metal() -> bool {
    env::var("CARGO_CFG_TARGET_OS").map_or(false, |os| os == "none")
}

fn target() -> String {
    env::var("TARGET").unwrap_or_default()
}

/// Returns the path of the board configuration in use: the contents of
/// `$BEAT_BOARD_CONFIG` if set, `default` otherwise. Either way, the build
/// script is asked to rerun if the file or the variable change.
pub fn board_config_path(default: &Path) -> PathBuf {
    println!("cargo:rerun-if-env-changed={BOARD_CONFIG_VAR}");
    let path = match env::var_os(BOARD_CONFIG_VAR) {
        Some(p) => PathBuf::from(p),
        None => default.to_path_buf(),
    };
    println!("cargo:rerun-if-changed={}", path.display());
    path
}

///
/// Pulls the board configuration for purposes of a build script. This will
/// fail if the file doesn't exist or doesn't parse. As with any Serde
/// target, `T` need only describe the parts of the file that a particular
/// build script cares about; unknown tables are ignored unless `T` says
/// otherwise.
///
pub fn board_config<T: DeserializeOwned>(default: &Path) -> Result<T> {
    let path = board_config_path(default);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml_from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn toml_from_str<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(toml::from_str(text)?)
}

/// Returns `OUT_DIR` as a path.
pub fn out_dir() -> Result<PathBuf> {
    Ok(PathBuf::from(
        env::var_os("OUT_DIR").context("OUT_DIR is not set")?,
    ))
}
