//! Interactive configuration wizard.
//!
//! Walks the operator through the quarry parameters, writes
//! `config.<quarryId>` under the data directory, and returns the blob so the
//! caller can announce it on the bus.

use std::io::{BufRead, Write};
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use uuid::Uuid;

use quarry_kernel::{BoundingBox, QuarryConfig, StateStore};

/// Ask one question; empty input keeps the default.
fn ask(
    input: &mut impl BufRead,
    output: &mut impl Write,
    prompt: &str,
    default: &str,
) -> Result<String> {
    write!(output, "{prompt} [{default}]: ")?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    let answer = line.trim();
    Ok(if answer.is_empty() {
        default.to_string()
    } else {
        answer.to_string()
    })
}

fn ask_parsed<T: FromStr>(
    input: &mut impl BufRead,
    output: &mut impl Write,
    prompt: &str,
    default: T,
) -> Result<T>
where
    T: std::fmt::Display,
    T::Err: std::fmt::Display,
{
    loop {
        let raw = ask(input, output, prompt, &default.to_string())?;
        match raw.parse::<T>() {
            Ok(value) => return Ok(value),
            Err(e) => writeln!(output, "  invalid value ({e}), try again")?,
        }
    }
}

/// Run the wizard over arbitrary streams (stdin/stdout in the CLI, buffers
/// in tests).
pub fn run(
    input: &mut impl BufRead,
    output: &mut impl Write,
    data_dir: &Path,
) -> Result<QuarryConfig> {
    writeln!(output, "AutoMine quarry configuration")?;

    let default_id = format!("quarry-{}", &Uuid::new_v4().to_string()[..8]);
    let quarry_id = ask(input, output, "Quarry id", &default_id)?;

    let base = QuarryConfig::default();
    let max_x = ask_parsed(input, output, "Bounding box max x", base.bounds.max_x)?;
    let max_y = ask_parsed(input, output, "Bounding box max y", base.bounds.max_y)?;
    let max_z = ask_parsed(input, output, "Bounding box max z", base.bounds.max_z)?;
    let tunnel_spacing = ask_parsed(input, output, "Tunnel spacing (>= 3)", base.tunnel_spacing)?;
    let layer_spacing = ask_parsed(input, output, "Layer spacing (>= 3)", base.layer_spacing)?;
    let chunk_length = ask_parsed(input, output, "Tunnel length", base.chunk_length)?;
    let fuel_reserve = ask_parsed(input, output, "Fuel reserve", base.fuel_reserve)?;
    let target_fuel = ask_parsed(input, output, "Refuel target", base.target_fuel)?;

    let config = QuarryConfig {
        quarry_id: quarry_id.clone(),
        config_version: 1,
        bounds: BoundingBox::new(max_x, max_y, max_z),
        tunnel_spacing,
        layer_spacing,
        chunk_length,
        fuel_reserve,
        target_fuel,
        ..base
    };
    config.validate().context("configuration rejected")?;

    let store = StateStore::open(data_dir, &quarry_id)?;
    store.save_config(&config)?;
    writeln!(
        output,
        "Wrote {}",
        data_dir.join(format!("config.{quarry_id}")).display()
    )?;
    Ok(config)
}
