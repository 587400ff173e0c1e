//! checkpoint-tools CLI - convert, combine, and re-key model checkpoints.

use checkpoint_tools::{
    cast_state_dict, classify_and_split, extension_for_state_dict, load_state_dict,
    quantize_for_model, save_state_dict, Architecture, Precision, QuantKind, StateDict,
};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};

/// Target precision for floating-point tensors.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum PrecisionArg {
    /// Keep each tensor's native format
    Full,
    /// IEEE half precision
    Float16,
    /// Brain float, f32 range at half width
    Bfloat16,
    /// 8-bit float, 4 exponent bits, finite-only (saturating)
    Float8E4m3Fn,
    /// Finite-only without negative zero
    Float8E4m3FnUz,
    /// 8-bit float, 5 exponent bits, IEEE-style infinities
    Float8E5m2,
    /// 5 exponent bits, finite-only without negative zero
    Float8E5m2FnUz,
}

impl From<PrecisionArg> for Precision {
    fn from(arg: PrecisionArg) -> Self {
        match arg {
            PrecisionArg::Full => Precision::Full,
            PrecisionArg::Float16 => Precision::Float16,
            PrecisionArg::Bfloat16 => Precision::BFloat16,
            PrecisionArg::Float8E4m3Fn => Precision::Float8E4M3Fn,
            PrecisionArg::Float8E4m3FnUz => Precision::Float8E4M3FnUz,
            PrecisionArg::Float8E5m2 => Precision::Float8E5M2,
            PrecisionArg::Float8E5m2FnUz => Precision::Float8E5M2FnUz,
        }
    }
}

/// Packed representation for quantized outputs.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum QuantKindArg {
    /// 4-bit NormalFloat (QLoRA-style codebook)
    Nf4,
    /// 8-bit per-block symmetric
    Int8,
}

impl From<QuantKindArg> for QuantKind {
    fn from(arg: QuantKindArg) -> Self {
        match arg {
            QuantKindArg::Nf4 => QuantKind::Nf4,
            QuantKindArg::Int8 => QuantKind::Int8,
        }
    }
}

/// Model family hint for splitting.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum ModelTypeArg {
    Sd15,
    Sdxl,
    Sd35,
    FluxDev,
    FluxSchnell,
}

impl From<ModelTypeArg> for Architecture {
    fn from(arg: ModelTypeArg) -> Self {
        match arg {
            ModelTypeArg::Sd15 => Architecture::Sd15,
            ModelTypeArg::Sdxl => Architecture::Sdxl,
            ModelTypeArg::Sd35 => Architecture::Sd35,
            ModelTypeArg::FluxDev => Architecture::FluxDev,
            ModelTypeArg::FluxSchnell => Architecture::FluxSchnell,
        }
    }
}

/// Convert, combine, and re-key neural network checkpoints.
///
/// Reads legacy pickle-based archives or safetensors files and writes
/// safetensors, with optional key rewriting, precision downcasting,
/// per-component splitting, and quantization.
#[derive(Parser, Debug)]
#[command(name = "checkpoint-tools")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert a checkpoint to a single safetensors file
    Convert(ConvertArgs),
    /// Split a checkpoint into per-component safetensors files
    ConvertToDiffusers(ConvertToDiffusersArgs),
    /// Merge several checkpoints key-wise into one (later files win)
    Combine(CombineArgs),
    /// List every tensor's shape and dtype plus the parameter count
    Metadata(MetadataArgs),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

/// Options shared by the converting commands.
#[derive(Parser, Debug)]
struct CommonArgs {
    /// Output name (defaults to the input file stem)
    #[arg(short, long)]
    name: Option<String>,

    /// Replace existing output files
    #[arg(long)]
    overwrite: bool,

    /// Drop keys containing this substring (repeatable)
    #[arg(long = "ignore-key", value_name = "PATTERN")]
    ignore_keys: Vec<String>,

    /// Rewrite keys by substring replacement (repeatable)
    #[arg(long = "replace-key", value_name = "OLD:NEW", value_parser = parse_replace_rule)]
    replace_keys: Vec<(String, String)>,

    /// Target precision for floating-point tensors
    #[arg(long, value_enum, default_value = "full")]
    precision: PrecisionArg,
}

#[derive(Parser, Debug)]
struct ConvertArgs {
    /// Input checkpoint (.ckpt, .pt, .pth, .bin, or .safetensors)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Parser, Debug)]
struct ConvertToDiffusersArgs {
    /// Input checkpoint (.ckpt, .pt, .pth, .bin, or .safetensors)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Model family; detected from the key set when omitted
    #[arg(long, value_enum)]
    model_type: Option<ModelTypeArg>,

    /// Quantize eligible tensors of quantizable components
    #[arg(long, value_enum)]
    quantize: Option<QuantKindArg>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Parser, Debug)]
struct CombineArgs {
    /// Input checkpoints, merged in order
    #[arg(value_name = "INPUT", required = true, num_args = 1..)]
    inputs: Vec<PathBuf>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Parser, Debug)]
struct MetadataArgs {
    /// Input checkpoint
    #[arg(value_name = "INPUT")]
    input: PathBuf,
}

#[derive(Parser, Debug)]
struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    shell: Shell,
}

fn parse_replace_rule(raw: &str) -> Result<(String, String), String> {
    match raw.split_once(':') {
        Some((old, new)) if !old.is_empty() => Ok((old.to_string(), new.to_string())),
        _ => Err(format!("expected OLD:NEW with a non-empty OLD, got '{raw}'")),
    }
}

/// Create a spinner for indeterminate progress.
fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Load, filter/rename, and cast: the stages every converting command
/// shares.
fn prepare(
    input: &Path,
    common: &CommonArgs,
) -> Result<StateDict, Box<dyn std::error::Error>> {
    let pb = create_spinner(&format!("Loading {}", input.display()));
    let loaded = load_state_dict(input);
    pb.finish_and_clear();

    let dict = loaded?;
    let mut dict = dict.filtered_renamed(&common.ignore_keys, &common.replace_keys)?;
    cast_state_dict(&mut dict, common.precision.into())?;
    Ok(dict)
}

fn output_name(common: &CommonArgs, input: &Path) -> String {
    common.name.clone().unwrap_or_else(|| {
        input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "checkpoint".to_string())
    })
}

/// Path next to `anchor` for the given file name.
fn sibling_path(anchor: &Path, file_name: &str) -> PathBuf {
    anchor.with_file_name(file_name)
}

fn write_output(
    dict: &StateDict,
    path: &Path,
    overwrite: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() && !overwrite {
        return Err(format!(
            "{} already exists (pass --overwrite to replace it)",
            path.display()
        )
        .into());
    }
    let pb = create_spinner(&format!("Writing {}", path.display()));
    let result = save_state_dict(dict, path);
    pb.finish_and_clear();
    result?;
    eprintln!("Wrote {}", style(path.display()).green());
    Ok(())
}

fn run_convert(args: ConvertArgs) -> Result<(), Box<dyn std::error::Error>> {
    let dict = prepare(&args.input, &args.common)?;
    let name = output_name(&args.common, &args.input);
    let file_name = format!("{name}{}", extension_for_state_dict(&dict));
    let path = sibling_path(&args.input, &file_name);
    write_output(&dict, &path, args.common.overwrite)
}

fn run_convert_to_diffusers(
    args: ConvertToDiffusersArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let dict = prepare(&args.input, &args.common)?;
    let (arch, components) = classify_and_split(dict, args.model_type.map(Into::into))?;
    eprintln!("Detected architecture: {}", style(arch).cyan());

    let name = output_name(&args.common, &args.input);
    let mut failures = 0usize;
    for (component, sub) in components {
        // one failed component must not stop the rest
        let sub = match args.quantize {
            Some(kind) => match quantize_for_model(sub, arch, component, kind.into()) {
                Ok(sub) => sub,
                Err(e) => {
                    eprintln!("{}: {e}", style(format!("Skipping {component}")).red());
                    failures += 1;
                    continue;
                }
            },
            None => sub,
        };

        let file_name = format!("{name}-{component}{}", extension_for_state_dict(&sub));
        let path = sibling_path(&args.input, &file_name);
        if path.exists() && !args.common.overwrite {
            eprintln!(
                "Skipping {component}: {} already exists (pass --overwrite to replace it)",
                path.display()
            );
            continue;
        }
        if let Err(e) = save_state_dict(&sub, &path) {
            eprintln!("{}: {e}", style(format!("Skipping {component}")).red());
            failures += 1;
            continue;
        }
        eprintln!("Wrote {}", style(path.display()).green());
    }

    if failures > 0 {
        return Err(format!("{failures} component output(s) failed").into());
    }
    Ok(())
}

fn run_combine(args: CombineArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut merged = StateDict::new();
    for input in &args.inputs {
        let pb = create_spinner(&format!("Loading {}", input.display()));
        let loaded = load_state_dict(input);
        pb.finish_and_clear();
        merged.merge_from(loaded?);
    }

    let mut dict = merged.filtered_renamed(&args.common.ignore_keys, &args.common.replace_keys)?;
    cast_state_dict(&mut dict, args.common.precision.into())?;

    let name = args.common.name.clone().unwrap_or_else(|| {
        let stems: Vec<String> = args
            .inputs
            .iter()
            .filter_map(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .collect();
        stems.join("-")
    });
    let file_name = format!("{name}{}", extension_for_state_dict(&dict));
    let path = sibling_path(&args.inputs[0], &file_name);
    write_output(&dict, &path, args.common.overwrite)
}

fn format_shape(shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("[{}]", dims.join(", "))
}

fn run_metadata(args: MetadataArgs) -> Result<(), Box<dyn std::error::Error>> {
    let dict = load_state_dict(&args.input)?;
    let summary = dict.summary();

    for row in &summary.rows {
        println!(
            "{}: {} {}",
            style(&row.key).cyan(),
            format_shape(&row.shape),
            style(row.dtype.as_str()).yellow()
        );
    }
    println!();
    println!(
        "Total parameters: {} ({})",
        style(summary.abbreviated_params()).green().bold(),
        summary.exact_params()
    );
    Ok(())
}

fn run_completions(args: CompletionsArgs) {
    let mut cmd = Cli::command();
    generate(args.shell, &mut cmd, "checkpoint-tools", &mut io::stdout());
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Convert(args) => run_convert(args),
        Commands::ConvertToDiffusers(args) => run_convert_to_diffusers(args),
        Commands::Combine(args) => run_combine(args),
        Commands::Metadata(args) => run_metadata(args),
        Commands::Completions(args) => {
            run_completions(args);
            return;
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
