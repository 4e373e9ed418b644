// CLI binary: errors are reported on stderr and mapped to exit codes.

use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use indexmap::IndexMap;
use tracing_subscriber::EnvFilter;

use knit_script::interpreter::Value;
use knit_script::{dat, paths, settings, KnitScriptInterpreter};

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "knitscript-cli",
    about = "Compile a KnitScript pattern to knitout",
    version
)]
struct Cli {
    /// Pattern file, or pattern source text with --string
    pattern: String,

    /// Treat PATTERN as source text instead of a file path
    #[arg(long)]
    string: bool,

    /// Knitout output file (defaults to the pattern name with a .k extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Seed a pattern variable, e.g. --var rows=12 (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var_arg)]
    vars: Vec<(String, String)>,

    /// Settings JSON (machine spec, import paths, error file)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also compile to DAT, optionally naming the output file
    #[arg(long, num_args = 0..=1, value_name = "FILE")]
    dat: Option<Option<PathBuf>>,

    /// knitout-to-dat script run with node
    #[arg(long, default_value = paths::DEFAULT_DAT_COMPILER)]
    dat_compiler: PathBuf,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

fn parse_var_arg(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing variable name in '{s}'"));
    }
    Ok((name.to_string(), value.to_string()))
}

/// Host values are typed by their text: int, float, bool, else string.
fn host_value(text: &str) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        return Value::Float(f);
    }
    match text {
        "True" | "true" => Value::Bool(true),
        "False" | "false" => Value::Bool(false),
        _ => Value::str(text),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "knit_script=debug" } else { "knit_script=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn output_path(cli: &Cli) -> PathBuf {
    match &cli.output {
        Some(path) => path.clone(),
        None if cli.string => PathBuf::from(format!("out.{}", paths::KNITOUT_EXT)),
        None => paths::knitout_path_for(Path::new(&cli.pattern)),
    }
}

// ── Main ─────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(paths::SETTINGS_FILE));
    let settings = match settings::load_settings(&config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let host_vars: IndexMap<String, Value> = cli
        .vars
        .iter()
        .map(|(name, text)| (name.clone(), host_value(text)))
        .collect();

    let out = output_path(&cli);
    let interpreter = KnitScriptInterpreter::new(settings);
    if let Err(e) = interpreter.write_knitout(&cli.pattern, &out, !cli.string, host_vars) {
        eprintln!("Error: {e}");
        process::exit(1);
    }

    if let Some(dat_out) = &cli.dat {
        let dat_path = dat_out.clone().unwrap_or_else(|| paths::dat_path_for(&out));
        if !dat::knitout_to_dat(&out, &dat_path, &cli.dat_compiler) {
            eprintln!("Error: DAT compilation of {} failed", out.display());
            process::exit(2);
        }
    }
}
