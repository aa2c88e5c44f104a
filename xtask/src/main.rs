use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, ExitCode};

use clap::{Parser, Subcommand, ValueEnum};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const CORE_PACKAGE: &str = "certification_core";
const LAMBDA_PACKAGE: &str = "certification_lambda";
const LAMBDA_BINARY: &str = "agent_actions";
const SCENARIO_SUITES: &[&str] = &[
    "integration_step_sequence_tests",
    "integration_otp_flow_tests",
    "integration_property_lookup_tests",
    "integration_certificate_quota_tests",
    "integration_session_expiry_tests",
];

#[derive(Parser)]
#[command(name = "xtask", about = "Checks and packaging for the certificate agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workflow engine benchmarks
    Bench,
    /// Run CI checks
    Ci {
        #[arg(value_enum, default_value_t = CiJob::Check)]
        job: CiJob,
    },
    /// Run the end-to-end workflow scenarios only
    Scenarios,
    /// Build the agent action binary and zip it as `bootstrap`
    LambdaPackage {
        #[arg(long, default_value = "x86_64-unknown-linux-gnu")]
        target: String,
        #[arg(long, env = "LAMBDA_DIST_DIR", default_value = "dist")]
        dist_dir: String,
    },
}

#[derive(Clone, ValueEnum)]
enum CiJob {
    /// fmt, clippy and tests
    Check,
    Bench,
    All,
}

type TaskResult = Result<(), String>;

fn step(label: &str) {
    eprintln!("\n=== {label} ===");
}

fn run_cargo(args: &[&str]) -> TaskResult {
    eprintln!("+ cargo {}", args.join(" "));
    let status = Command::new("cargo")
        .args(args)
        .status()
        .map_err(|error| format!("failed to execute cargo: {error}"))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("cargo {} exited with {status}", args.join(" ")))
    }
}

fn ci_check() -> TaskResult {
    step("Check formatting");
    run_cargo(&["fmt", "--all", "--", "--check"])?;

    step("Clippy");
    run_cargo(&["clippy", "--all-targets", "--all-features", "--", "-D", "warnings"])?;

    for package in [CORE_PACKAGE, LAMBDA_PACKAGE] {
        step(&format!("Test {package}"));
        run_cargo(&["test", "-p", package])?;
    }
    Ok(())
}

fn ci_bench() -> TaskResult {
    step("Run benchmarks");
    run_cargo(&["bench", "-p", CORE_PACKAGE, "--bench", "workflow"])
}

fn scenarios() -> TaskResult {
    let mut args = vec!["test", "-p", CORE_PACKAGE];
    for suite in SCENARIO_SUITES {
        args.extend(["--test", *suite]);
    }
    run_cargo(&args)
}

fn package_lambda(target: &str, dist_dir: &str) -> TaskResult {
    step("Build agent action lambda binary");
    run_cargo(&[
        "build",
        "--release",
        "-p",
        LAMBDA_PACKAGE,
        "--target",
        target,
        "--bin",
        LAMBDA_BINARY,
    ])
    .map_err(|error| format!("{error}; is `rustup target add {target}` installed?"))?;

    step("Package lambda zip artifact");
    let binary_path = Path::new("target")
        .join(target)
        .join("release")
        .join(LAMBDA_BINARY);
    let binary = fs::read(&binary_path)
        .map_err(|error| format!("cannot read {}: {error}", binary_path.display()))?;

    let dist_dir = Path::new(dist_dir);
    fs::create_dir_all(dist_dir).map_err(|error| format!("cannot create dist dir: {error}"))?;
    let zip_path = dist_dir.join(format!("{LAMBDA_BINARY}.zip"));
    write_bootstrap_zip(&binary, &zip_path).map_err(|error| format!("zip failed: {error}"))?;

    eprintln!("\nPackaged artifact:\n- {}", zip_path.display());
    Ok(())
}

fn write_bootstrap_zip(binary: &[u8], zip_path: &Path) -> zip::result::ZipResult<()> {
    let mut zip = ZipWriter::new(fs::File::create(zip_path)?);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o755);
    zip.start_file("bootstrap", options)?;
    zip.write_all(binary)?;
    zip.finish()?;
    Ok(())
}

fn main() -> ExitCode {
    let result = match Cli::parse().command {
        Commands::Bench => ci_bench(),
        Commands::Ci { job } => match job {
            CiJob::Check => ci_check(),
            CiJob::Bench => ci_bench(),
            CiJob::All => ci_check().and_then(|()| ci_bench()),
        },
        Commands::Scenarios => scenarios(),
        Commands::LambdaPackage { target, dist_dir } => package_lambda(&target, &dist_dir),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("\nerror: {message}");
            ExitCode::FAILURE
        }
    }
}
