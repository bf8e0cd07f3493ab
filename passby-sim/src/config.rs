//! Load simulation config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use passby_core::{BLOCK_PROTOCOL_NAME, COMMON_ANY, PACKET_SIZE_MIN};

/// Simulation configuration. File: ~/.config/passby/sim.toml or /etc/passby/sim.toml
/// (or `--config <path>`). Env overrides: PASSBY_PARENT_MAX, PASSBY_CHILD_MAX,
/// PASSBY_FRAME_PERIOD_MS, PASSBY_MAX_FRAMES, PASSBY_PARENT_PAYLOAD, PASSBY_CHILD_PAYLOAD,
/// PASSBY_PARENT_GGID, PASSBY_CHILD_GGID, PASSBY_ROUNDS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimConfig {
    /// MP slot size of the parent, in bytes (default 128).
    #[serde(default = "default_parent_max")]
    pub parent_max: u16,
    /// MP slot size of each child, in bytes (default 64).
    #[serde(default = "default_child_max")]
    pub child_max: u16,
    /// Frame period (default 16 ms).
    #[serde(default = "default_frame_period_ms")]
    pub frame_period_ms: u64,
    /// Give up after this many frames (default 1000).
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
    #[serde(default = "default_parent_payload")]
    pub parent_payload: usize,
    #[serde(default = "default_child_payload")]
    pub child_payload: usize,
    /// GGID the parent registers and advertises.
    #[serde(default = "default_parent_ggid")]
    pub parent_ggid: u32,
    /// GGID the child registers; `COMMON_ANY` accepts any common peer.
    #[serde(default = "default_child_ggid")]
    pub child_ggid: u32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Block exchanges per connection; later rounds are re-armed from the completion callback.
    #[serde(default = "default_rounds")]
    pub rounds: u32,
}

fn default_parent_max() -> u16 {
    128
}
fn default_child_max() -> u16 {
    64
}
fn default_frame_period_ms() -> u64 {
    16
}
fn default_max_frames() -> usize {
    1000
}
fn default_parent_payload() -> usize {
    1024
}
fn default_child_payload() -> usize {
    512
}
fn default_parent_ggid() -> u32 {
    0x8000_0042
}
fn default_child_ggid() -> u32 {
    COMMON_ANY
}
fn default_protocol() -> String {
    BLOCK_PROTOCOL_NAME.to_string()
}
fn default_rounds() -> u32 {
    1
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            parent_max: default_parent_max(),
            child_max: default_child_max(),
            frame_period_ms: default_frame_period_ms(),
            max_frames: default_max_frames(),
            parent_payload: default_parent_payload(),
            child_payload: default_child_payload(),
            parent_ggid: default_parent_ggid(),
            child_ggid: default_child_ggid(),
            protocol: default_protocol(),
            rounds: default_rounds(),
        }
    }
}

impl SimConfig {
    /// Reject settings the link driver cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.parent_max >= PACKET_SIZE_MIN && self.child_max >= PACKET_SIZE_MIN,
            "packet sizes must be at least {} bytes",
            PACKET_SIZE_MIN
        );
        anyhow::ensure!(self.parent_ggid != 0, "parent_ggid must be non-zero");
        anyhow::ensure!(self.child_ggid != 0, "child_ggid must be non-zero");
        anyhow::ensure!(self.frame_period_ms > 0, "frame_period_ms must be positive");
        anyhow::ensure!(self.rounds > 0, "rounds must be at least 1");
        Ok(())
    }
}

/// Load config: merge default, then config file (explicit path or first found), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<SimConfig> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    c.validate()?;
    Ok(c)
}

fn apply_env(c: &mut SimConfig, var: impl Fn(&str) -> Option<String>) {
    fn parse<T: std::str::FromStr>(s: Option<String>) -> Option<T> {
        s.and_then(|s| s.trim().parse().ok())
    }
    if let Some(v) = parse(var("PASSBY_PARENT_MAX")) {
        c.parent_max = v;
    }
    if let Some(v) = parse(var("PASSBY_CHILD_MAX")) {
        c.child_max = v;
    }
    if let Some(v) = parse(var("PASSBY_FRAME_PERIOD_MS")) {
        c.frame_period_ms = v;
    }
    if let Some(v) = parse(var("PASSBY_MAX_FRAMES")) {
        c.max_frames = v;
    }
    if let Some(v) = parse(var("PASSBY_PARENT_PAYLOAD")) {
        c.parent_payload = v;
    }
    if let Some(v) = parse(var("PASSBY_CHILD_PAYLOAD")) {
        c.child_payload = v;
    }
    if let Some(v) = parse(var("PASSBY_ROUNDS")) {
        c.rounds = v;
    }
    if let Some(v) = var("PASSBY_PARENT_GGID").and_then(|s| parse_ggid(&s)) {
        c.parent_ggid = v;
    }
    if let Some(v) = var("PASSBY_CHILD_GGID").and_then(|s| parse_ggid(&s)) {
        c.child_ggid = v;
    }
}

/// Decimal or `0x`-prefixed hex.
fn parse_ggid(s: &str) -> Option<u32> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16).ok(),
        None => s.parse().ok(),
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/passby/sim.toml"));
    }
    out.push(PathBuf::from("/etc/passby/sim.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<SimConfig> {
    let s = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
    toml::from_str(&s).map_err(|e| anyhow::anyhow!("parsing {}: {}", path.display(), e))
}

fn load_file() -> Option<SimConfig> {
    for p in config_paths() {
        if p.exists() {
            match read_file(&p) {
                Ok(c) => return Some(c),
                Err(e) => tracing::warn!(error = %e, "ignoring config file"),
            }
            break;
        }
    }
    None
}
