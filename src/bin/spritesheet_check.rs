use anyhow::{anyhow, bail, Context, Result};
use instanced_sprites::encoder::EncodedSpritesheet;
use instanced_sprites::spritesheet::aseprite::load_aseprite;
use instanced_sprites::spritesheet::{IssueSeverity, SpritesheetFormat};
use instanced_sprites::config::SpriteMeshConfigOverrides;
use instanced_sprites::{InstancedSpriteMesh, PlayMode, SpriteGeometryKind, SpriteMeshConfig};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;

fn main() {
    env_logger::init();
    match run() {
        Ok(summary) => {
            if summary.errors > 0 {
                process::exit(2);
            }
        }
        Err(err) => {
            eprintln!("spritesheet_check error: {err:?}");
            process::exit(1);
        }
    }
}

#[derive(Default)]
struct RunSummary {
    checked: usize,
    warnings: usize,
    errors: usize,
}

struct Simulation {
    ticks: u32,
    dt: f32,
}

struct CliOptions {
    aseprite: bool,
    show_help: bool,
    config_path: Option<PathBuf>,
    overrides: SpriteMeshConfigOverrides,
    simulation: Option<Simulation>,
    emit: Option<PathBuf>,
    targets: Vec<PathBuf>,
}

fn run() -> Result<RunSummary> {
    let args: Vec<String> = env::args().skip(1).collect();
    let options = parse_cli_args(&args)?;
    if options.show_help {
        print_usage();
        return Ok(RunSummary::default());
    }
    if options.targets.is_empty() {
        return Err(anyhow!("no spritesheet files given"));
    }
    if options.emit.is_some() && options.targets.len() > 1 {
        return Err(anyhow!("--emit accepts a single input file"));
    }

    let mut config = match &options.config_path {
        Some(path) => SpriteMeshConfig::load(path)?,
        None => SpriteMeshConfig::default(),
    };
    config.apply_overrides(&options.overrides);
    let overridden = if options.overrides.is_empty() {
        String::new()
    } else {
        format!(" (overrides: {})", options.overrides.applied_fields().join(", "))
    };
    println!(
        "Config: fps {}, geometry {}, billboarding {}{overridden}",
        config.fps,
        config.geometry.label(),
        if config.billboarding { "on" } else { "off" }
    );

    let mut summary = RunSummary::default();
    for path in &options.targets {
        summary.checked += 1;
        let sheet = if options.aseprite {
            load_aseprite(path)?.spritesheet
        } else {
            SpritesheetFormat::load(path)?
        };
        let mut has_errors = false;
        for issue in sheet.validate() {
            println!("[{}] {} - {}", issue.severity, path.display(), issue.message);
            match issue.severity {
                IssueSeverity::Warning => summary.warnings += 1,
                IssueSeverity::Error => {
                    summary.errors += 1;
                    has_errors = true;
                }
            }
        }
        if has_errors {
            continue;
        }
        let table = EncodedSpritesheet::encode(&sheet)
            .with_context(|| format!("failed to encode '{}'", path.display()))?;
        println!(
            "OK {} ({} frames, {} animations, table {}x{})",
            path.display(),
            sheet.frame_count(),
            table.animation_count(),
            table.width(),
            table.height()
        );
        for (index, name) in table.animation_names().iter().enumerate() {
            println!("  {index}: {name} ({} frames)", table.animation_length(index as u32));
        }
        if let Some(simulation) = &options.simulation {
            simulate(&sheet, simulation, &config)?;
        }
        if let Some(emit) = &options.emit {
            fs::write(emit, sheet.to_json_pretty()?)
                .with_context(|| format!("failed to write '{}'", emit.display()))?;
            println!("Wrote {}", emit.display());
        }
    }
    println!("Checked {} spritesheets ({} warnings, {} errors)", summary.checked, summary.warnings, summary.errors);
    Ok(summary)
}

/// Plays every animation on its own CPU instance and prints the frame sequence.
fn simulate(sheet: &SpritesheetFormat, simulation: &Simulation, config: &SpriteMeshConfig) -> Result<()> {
    let names: Vec<String> = sheet.animation_names().map(str::to_owned).collect();
    let mut mesh = InstancedSpriteMesh::cpu(names.len() as u32, config.clone());
    mesh.set_spritesheet(sheet.clone())?;
    for (id, name) in names.iter().enumerate() {
        mesh.play(name, true, PlayMode::Forward).at(id);
    }
    let mut sequences = vec![Vec::with_capacity(simulation.ticks as usize); names.len()];
    for _ in 0..simulation.ticks {
        mesh.update_with_delta(simulation.dt);
        for (id, sequence) in sequences.iter_mut().enumerate() {
            if let Some(state) = mesh.state_at(id) {
                sequence.push(state.frame_index().to_string());
            }
        }
    }
    for (name, sequence) in names.iter().zip(&sequences) {
        println!("  {name}: {}", sequence.join(" "));
    }
    Ok(())
}

fn print_usage() {
    eprintln!(
        "Spritesheet Check

Usage:
  spritesheet_check [--aseprite] [--config <path>] [--fps F] [--geometry quad|tri]
                    [--billboard on|off] [--ticks N --dt S] [--emit <path>] <file> [<file>...]

Validates spritesheet JSON files (or Aseprite JSON exports with --aseprite)
and prints the encoded table shape. --config loads sprite mesh settings;
--fps, --geometry and --billboard override them. --ticks simulates looped
forward playback of every animation and prints the frame shown after each
tick. --emit writes the normalized spritesheet JSON. Exit code 2 on errors.
"
    );
}

fn parse_cli_args(args: &[String]) -> Result<CliOptions> {
    let mut options = CliOptions {
        aseprite: false,
        show_help: false,
        config_path: None,
        overrides: SpriteMeshConfigOverrides::default(),
        simulation: None,
        emit: None,
        targets: Vec::new(),
    };
    let mut ticks = None;
    let mut dt = 1.0 / 60.0;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--aseprite" => options.aseprite = true,
            "--help" | "-h" => options.show_help = true,
            "--ticks" => ticks = Some(parse_value::<u32>(arg, iter.next())?),
            "--dt" => dt = parse_value::<f32>(arg, iter.next())?,
            "--fps" => options.overrides.fps = Some(parse_value::<f32>(arg, iter.next())?),
            "--geometry" => {
                let value = iter.next().ok_or_else(|| anyhow!("missing value for '{arg}'"))?;
                let geometry = SpriteGeometryKind::from_label(value)
                    .ok_or_else(|| anyhow!("invalid geometry '{value}'; use quad or tri"))?;
                options.overrides.geometry = Some(geometry);
            }
            "--billboard" => {
                let value = iter.next().ok_or_else(|| anyhow!("missing value for '{arg}'"))?;
                options.overrides.billboarding = Some(parse_bool_flag(arg, value)?);
            }
            "--config" => {
                let value = iter.next().ok_or_else(|| anyhow!("missing value for '{arg}'"))?;
                options.config_path = Some(PathBuf::from(value));
            }
            "--emit" => {
                let value = iter.next().ok_or_else(|| anyhow!("missing value for '{arg}'"))?;
                options.emit = Some(PathBuf::from(value));
            }
            _ if arg.starts_with("--") => {
                return Err(anyhow!("unknown flag '{arg}'"));
            }
            _ => options.targets.push(PathBuf::from(arg)),
        }
    }
    options.simulation = ticks.map(|ticks| Simulation { ticks, dt });
    Ok(options)
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> Result<T> {
    let value = value.ok_or_else(|| anyhow!("missing value for '{flag}'"))?;
    value.parse::<T>().map_err(|_| anyhow!("invalid value '{value}' for '{flag}'"))
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("invalid value '{other}' for '{flag}'; use on/off or true/false"),
    }
}
