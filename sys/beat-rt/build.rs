// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Board {
    name: String,
    oscillators: Oscillators,
    limits: Limits,
    memory: Memory,
    clock: Vec<ClockEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Oscillators {
    internal_hz: u32,
    external_hz: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Limits {
    sysclk_max_hz: u32,
    apb1_max_hz: u32,
    apb2_max_hz: u32,
    flash_wait_state_hz: Vec<u32>,
    ready_poll_limit: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Memory {
    flash: Region,
    ram: Region,
    #[serde(default)]
    vector_table_offset: u32,
}

#[derive(Copy, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct Region {
    origin: u32,
    length: u32,
}

impl Region {
    fn end(&self) -> u64 {
        u64::from(self.origin) + u64::from(self.length)
    }
}

#[derive(Copy, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
enum Source {
    Internal,
    External,
    PllInternal,
    PllExternal,
}

impl Source {
    fn variant(self) -> &'static str {
        match self {
            Source::Internal => "Internal",
            Source::External => "External",
            Source::PllInternal => "PllFromInternal",
            Source::PllExternal => "PllFromExternal",
        }
    }

    fn is_pll(self) -> bool {
        matches!(self, Source::PllInternal | Source::PllExternal)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ClockEntry {
    mhz: u32,
    source: Source,
    pll_multiplier: Option<u8>,
    #[serde(default = "one")]
    ahb_divisor: u32,
    #[serde(default = "one")]
    apb1_divisor: u32,
    #[serde(default = "one")]
    apb2_divisor: u32,
    flash_wait_states: u8,
}

fn one() -> u32 {
    1
}

const AHB_DIVISORS: [u32; 9] = [1, 2, 4, 8, 16, 64, 128, 256, 512];
const APB_DIVISORS: [u32; 5] = [1, 2, 4, 8, 16];

/// Frequencies resulting from one clock entry, once it has passed checks.
struct Resolved {
    core_hz: u32,
    apb1_hz: u32,
    apb2_hz: u32,
}

fn main() -> Result<()> {
    build_util::expose_m_profile();

    let manifest = PathBuf::from(
        std::env::var("CARGO_MANIFEST_DIR").context("no manifest dir")?,
    );
    let board: Board =
        build_util::board_config(&manifest.join("boards/bluepill.toml"))?;

    check_limits(&board)?;
    check_memory(&board.memory)?;
    let resolved = board
        .clock
        .iter()
        .map(|entry| {
            resolve(&board, entry)
                .with_context(|| format!("clock entry for {} MHz", entry.mhz))
        })
        .collect::<Result<Vec<_>>>()?;

    let out = build_util::out_dir()?;
    fs::write(out.join("clock_table.rs"), clock_table(&board, &resolved)?)?;
    fs::write(out.join("memory.x"), memory_x(&board.memory)?)?;

    println!("cargo:rerun-if-changed=link.x");
    if build_util::is_bare_metal() {
        fs::copy(manifest.join("link.x"), out.join("link.x"))?;
        println!("cargo:rustc-link-search={}", out.display());
    }

    Ok(())
}

fn check_limits(board: &Board) -> Result<()> {
    let bands = &board.limits.flash_wait_state_hz;
    if bands.is_empty() || bands.len() > 8 {
        bail!("flash-wait-state-hz must list between 1 and 8 bands");
    }
    if bands.windows(2).any(|w| w[0] >= w[1]) {
        bail!("flash-wait-state-hz must be strictly increasing");
    }
    if board.limits.sysclk_max_hz > *bands.last().unwrap_or(&0) {
        bail!("sysclk-max-hz is not covered by any flash wait-state band");
    }
    if board.limits.ready_poll_limit == Some(0) {
        bail!("ready-poll-limit must be positive; omit it for unbounded polls");
    }
    Ok(())
}

fn check_memory(memory: &Memory) -> Result<()> {
    for (name, region) in [("flash", memory.flash), ("ram", memory.ram)] {
        if region.origin % 4 != 0 || region.length % 4 != 0 {
            bail!("{name} region must be word aligned");
        }
        if region.length == 0 {
            bail!("{name} region is empty");
        }
        if region.end() > 1 << 32 {
            bail!("{name} region runs off the end of the address space");
        }
    }
    let (f, r) = (memory.flash, memory.ram);
    if u64::from(f.origin) < r.end() && u64::from(r.origin) < f.end() {
        bail!("flash and ram regions overlap");
    }
    // VTOR.TBLOFF on the M3 needs the table aligned to its size rounded up to
    // a power of two; 59 words rounds up to 512 bytes.
    if memory.vector_table_offset % 0x200 != 0 {
        bail!("vector-table-offset must be a multiple of 0x200");
    }
    if memory.vector_table_offset >= f.length {
        bail!("vector-table-offset lies outside flash");
    }
    Ok(())
}

fn resolve(board: &Board, entry: &ClockEntry) -> Result<Resolved> {
    let osc = &board.oscillators;
    let sysclk = match (entry.source, entry.pll_multiplier) {
        (Source::Internal, None) => osc.internal_hz,
        (Source::External, None) => osc.external_hz,
        (Source::PllInternal, Some(m)) if (2..=16).contains(&m) => {
            (osc.internal_hz / 2) * u32::from(m)
        }
        (Source::PllExternal, Some(m)) if (2..=16).contains(&m) => {
            osc.external_hz * u32::from(m)
        }
        (s, Some(m)) if s.is_pll() => {
            bail!("pll-multiplier {m} is outside 2..=16")
        }
        (_, Some(_)) => bail!("pll-multiplier given for a non-PLL source"),
        (_, None) => bail!("PLL source needs a pll-multiplier"),
    };

    if sysclk > board.limits.sysclk_max_hz {
        bail!("SYSCLK exceeds {} Hz", board.limits.sysclk_max_hz);
    }
    if !AHB_DIVISORS.contains(&entry.ahb_divisor) {
        bail!("ahb-divisor {} is not one of {AHB_DIVISORS:?}", entry.ahb_divisor);
    }
    for d in [entry.apb1_divisor, entry.apb2_divisor] {
        if !APB_DIVISORS.contains(&d) {
            bail!("APB divisor {d} is not one of {APB_DIVISORS:?}");
        }
    }

    let core_hz = sysclk / entry.ahb_divisor;
    let apb1_hz = core_hz / entry.apb1_divisor;
    let apb2_hz = core_hz / entry.apb2_divisor;
    if u64::from(core_hz) != u64::from(entry.mhz) * 1_000_000 {
        bail!("settings produce a {core_hz} Hz core clock");
    }
    if apb1_hz > board.limits.apb1_max_hz {
        bail!("APB1 at {apb1_hz} Hz exceeds {}", board.limits.apb1_max_hz);
    }
    if apb2_hz > board.limits.apb2_max_hz {
        bail!("APB2 at {apb2_hz} Hz exceeds {}", board.limits.apb2_max_hz);
    }

    let bands = &board.limits.flash_wait_state_hz;
    let needed = bands.iter().position(|&max| sysclk <= max).with_context(
        || format!("no flash wait-state band covers {sysclk} Hz"),
    )?;
    let ws = usize::from(entry.flash_wait_states);
    if ws < needed {
        bail!("{ws} flash wait states are too few, {needed} required");
    }
    if ws >= bands.len() {
        bail!("{ws} flash wait states is beyond the configured bands");
    }

    Ok(Resolved {
        core_hz,
        apb1_hz,
        apb2_hz,
    })
}

fn clock_table(board: &Board, resolved: &[Resolved]) -> Result<String> {
    let mut seen = BTreeSet::new();
    for entry in &board.clock {
        if !seen.insert(entry.mhz) {
            bail!("{} MHz appears twice in the clock table", entry.mhz);
        }
    }
    if board.clock.is_empty() {
        bail!("the clock table is empty");
    }

    let mut rows: Vec<_> = board.clock.iter().zip(resolved).collect();
    rows.sort_by_key(|(e, _)| e.mhz);

    let mut out = String::new();
    writeln!(out, "// Generated by build.rs for board `{}`.", board.name)?;
    writeln!(out)?;
    writeln!(out, "/// Board these tables were generated for.")?;
    writeln!(out, "pub const BOARD: &str = {:?};", board.name)?;
    writeln!(out, "/// Internal RC oscillator frequency.")?;
    writeln!(
        out,
        "pub const INTERNAL_OSC_HZ: u32 = {};",
        board.oscillators.internal_hz
    )?;
    writeln!(out, "/// External crystal frequency.")?;
    writeln!(
        out,
        "pub const EXTERNAL_OSC_HZ: u32 = {};",
        board.oscillators.external_hz
    )?;
    writeln!(
        out,
        "/// Highest SYSCLK allowed with `n` flash wait states, indexed by `n`."
    )?;
    let bands = &board.limits.flash_wait_state_hz;
    writeln!(
        out,
        "pub const FLASH_WAIT_STATE_LIMITS_HZ: [u32; {}] = {:?};",
        bands.len(),
        bands
    )?;
    writeln!(out, "/// Ready-poll policy used unless overridden.")?;
    match board.limits.ready_poll_limit {
        None => writeln!(
            out,
            "pub const DEFAULT_READY_POLICY: ReadyPolicy = ReadyPolicy::Unbounded;"
        )?,
        Some(polls) => writeln!(
            out,
            "pub const DEFAULT_READY_POLICY: ReadyPolicy = \
             ReadyPolicy::Bounded {{ polls: {polls} }};"
        )?,
    }
    writeln!(out)?;

    writeln!(out, "/// Core frequencies this board knows how to reach.")?;
    writeln!(
        out,
        "#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]"
    )?;
    writeln!(out, "pub enum ClockFrequency {{")?;
    for (e, _) in &rows {
        writeln!(out, "    Mhz{},", e.mhz)?;
    }
    writeln!(out, "}}")?;
    writeln!(out)?;

    writeln!(out, "impl ClockFrequency {{")?;
    writeln!(out, "    /// Every entry of the table, lowest first.")?;
    writeln!(out, "    pub const ALL: [ClockFrequency; {}] = [", rows.len())?;
    for (e, _) in &rows {
        writeln!(out, "        ClockFrequency::Mhz{},", e.mhz)?;
    }
    writeln!(out, "    ];")?;
    writeln!(out)?;

    writeln!(out, "    /// Target core (HCLK) frequency in Hz.")?;
    writeln!(out, "    pub const fn hz(self) -> u32 {{")?;
    writeln!(out, "        match self {{")?;
    for (e, r) in &rows {
        writeln!(out, "            ClockFrequency::Mhz{} => {},", e.mhz, r.core_hz)?;
    }
    writeln!(out, "        }}")?;
    writeln!(out, "    }}")?;
    writeln!(out)?;

    writeln!(out, "    /// Register settings that reach this frequency.")?;
    writeln!(
        out,
        "    pub const fn configuration(self) -> ClockConfiguration {{"
    )?;
    writeln!(out, "        match self {{")?;
    for (e, _) in &rows {
        let mul = match e.pll_multiplier {
            Some(m) => format!("Some({m})"),
            None => "None".to_string(),
        };
        writeln!(
            out,
            "            ClockFrequency::Mhz{} => ClockConfiguration {{",
            e.mhz
        )?;
        writeln!(
            out,
            "                source: ClockSource::{},",
            e.source.variant()
        )?;
        writeln!(out, "                pll_multiplier: {mul},")?;
        writeln!(out, "                ahb: AhbPrescaler::Div{},", e.ahb_divisor)?;
        writeln!(out, "                apb1: ApbPrescaler::Div{},", e.apb1_divisor)?;
        writeln!(out, "                apb2: ApbPrescaler::Div{},", e.apb2_divisor)?;
        writeln!(
            out,
            "                flash_wait_states: {},",
            e.flash_wait_states
        )?;
        writeln!(out, "            }},")?;
    }
    writeln!(out, "        }}")?;
    writeln!(out, "    }}")?;
    writeln!(out)?;

    writeln!(
        out,
        "    /// Bus frequencies documented for this entry, checked at build time."
    )?;
    writeln!(out, "    pub const fn expected_clocks(self) -> DerivedClocks {{")?;
    writeln!(out, "        match self {{")?;
    for (e, r) in &rows {
        writeln!(
            out,
            "            ClockFrequency::Mhz{} => DerivedClocks {{ \
             core_hz: {}, apb1_hz: {}, apb2_hz: {} }},",
            e.mhz, r.core_hz, r.apb1_hz, r.apb2_hz
        )?;
    }
    writeln!(out, "        }}")?;
    writeln!(out, "    }}")?;
    writeln!(out, "}}")?;

    Ok(out)
}

fn memory_x(memory: &Memory) -> Result<String> {
    let mut out = String::new();
    writeln!(out, "/* Generated by build.rs. */")?;
    writeln!(out, "MEMORY")?;
    writeln!(out, "{{")?;
    writeln!(
        out,
        "  FLASH : ORIGIN = {:#010x}, LENGTH = {:#x}",
        memory.flash.origin, memory.flash.length
    )?;
    writeln!(
        out,
        "  RAM : ORIGIN = {:#010x}, LENGTH = {:#x}",
        memory.ram.origin, memory.ram.length
    )?;
    writeln!(out, "}}")?;
    writeln!(out)?;
    writeln!(
        out,
        "_vector_table_offset = {:#x};",
        memory.vector_table_offset
    )?;
    Ok(out)
}
