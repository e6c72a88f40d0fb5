//! nncc command line front-end.
//!
//! # Usage
//!
//! ```bash
//! # Float model, sources written to out/nncc/<model stem>/
//! nncc model.nnir
//!
//! # int8 fixed point from a calibration table
//! nncc model.nnir --quantize int8 --calibration ranges.csv --output build/model
//!
//! # Print the whole model as one translation unit
//! nncc model.nnir --single-file
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use bumpalo::Bump;
use clap::Parser;
use nncc::calibration::CalibrationTable;
use nncc::core::{CompilationSession, CompileError, CompileResult, QuantMode, Stage};
use nncc::pipeline::{Compiler, CompilerOptions};
use nncc::text_ir;

/// Compile a neural network layer graph to C.
#[derive(Parser, Debug)]
#[command(name = "nncc")]
#[command(version)]
struct Args {
    /// Model description in the .nnir text format
    model: PathBuf,

    /// Number representation of the generated code
    #[arg(short, long, default_value = "float32")]
    quantize: QuantMode,

    /// Calibration table (CSV) with per-layer scale factors, required for int8/int16
    #[arg(short, long)]
    calibration: Option<PathBuf>,

    /// Output directory. Defaults to out/nncc/<model stem>
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the combined single-file output instead of writing files
    #[arg(long)]
    single_file: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// PyTorch module name and arguments (not supported)
    #[arg(trailing_var_arg = true, hide = true)]
    module: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{} failed: {e}", e.stage());
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> CompileResult<()> {
    if let Some(module) = args.module.first() {
        return Err(CompileError::structural(
            module.as_str(),
            "PyTorch modules cannot be imported, export the model to .nnir first",
        )
        .in_stage(Stage::Import));
    }

    let mut graph = text_ir::load_model(&args.model)?;
    log::info!("Loaded {} layers from {}", graph.len(), args.model.display());

    let calibration = match &args.calibration {
        Some(path) => {
            let input = graph.input().map(|id| graph.node(id).name().to_string()).unwrap_or_default();
            Some(CalibrationTable::load(path, &input)?)
        }
        None => None,
    };

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let options = CompilerOptions { mode: args.quantize };
    let result = Compiler::new(&session, options).compile(&mut graph, calibration.as_ref())?;

    let full_model = result.single_file();
    if args.single_file {
        print!("{full_model}");
        return Ok(());
    }

    let dir = args.output.clone().unwrap_or_else(|| default_output(&args.model));
    result.bundle.write_to(&dir)?;
    let full_model_path = dir.join("full_model.h");
    std::fs::write(&full_model_path, full_model).map_err(|e| CompileError::output(&full_model_path, e))?;
    log::info!("Wrote {} files to {}", result.bundle.len() + 1, dir.display());
    Ok(())
}

fn default_output(model: &Path) -> PathBuf {
    let stem = model.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "model".to_string());
    Path::new("out").join("nncc").join(stem)
}
