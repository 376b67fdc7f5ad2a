use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use emu_core::{
    check_output, ConfigError, ExitReason, LogFilter, OutputCheck, RunConfig, RunProfile,
    RunResult, StopSignal, DEFAULT_NOISE_MARKER, DEFAULT_RUN_DIR,
};
use emu_runner::{JsonlRunSink, Supervisor};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const EXIT_OK: u8 = 0;
const EXIT_RUNTIME_ERROR: u8 = 1;
const EXIT_INVALID_CONFIG: u8 = 2;
const EXIT_LAUNCH_FAILED: u8 = 3;
const EXIT_CHECK_FAILED: u8 = 4;

#[derive(Parser)]
#[command(
    name = "emurun",
    version,
    about = "Run an emulator until a trigger line, a time limit or its own exit"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise one emulator run and filter its log.
    Run(RunArgs),
    /// Filter a raw log into a trimmed log.
    Filter {
        raw: PathBuf,
        trimmed: PathBuf,
        #[arg(long)]
        marker: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Check a log against expected output lines.
    Check {
        log: PathBuf,
        #[arg(long)]
        expected: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

/// Options go before the executable; everything after it (or after `--`)
/// is handed to the emulator untouched.
#[derive(Args, Debug)]
struct RunArgs {
    executable: Option<PathBuf>,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
    #[arg(long)]
    trigger: Option<String>,
    /// Seconds, fractions allowed.
    #[arg(long)]
    time_limit: Option<f64>,
    #[arg(long, default_value = DEFAULT_RUN_DIR)]
    run_dir: PathBuf,
    #[arg(long)]
    raw_log: Option<PathBuf>,
    #[arg(long)]
    trimmed_log: Option<PathBuf>,
    #[arg(long)]
    marker: Option<String>,
    #[arg(long, value_parser = parse_stop_signal)]
    stop_signal: Option<StopSignal>,
    /// YAML or JSON run profile; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    expected: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn profile_overrides(&self) -> RunProfile {
        RunProfile {
            executable: self.executable.clone(),
            args: if self.executable.is_some() {
                Some(self.args.clone())
            } else {
                None
            },
            trigger: self.trigger.clone(),
            time_limit_secs: self.time_limit,
            marker: self.marker.clone(),
            raw_log: self.raw_log.clone(),
            trimmed_log: self.trimmed_log.clone(),
            stop_signal: self.stop_signal,
            ..RunProfile::default()
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("invalid run profile: {0:#}")]
    Profile(anyhow::Error),
}

struct CommandOutput {
    payload: Value,
    exit_code: u8,
}

fn parse_stop_signal(value: &str) -> Result<StopSignal, String> {
    value.parse().map_err(|err: ConfigError| err.to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let env = |key: &str| std::env::var(key).ok();

    match run_command(cli.command, &env).await {
        Ok(output) => {
            if json_mode {
                emit_json(&output.payload);
            }
            ExitCode::from(output.exit_code)
        }
        Err(err) => {
            let (code, exit_code) = classify_error(&err);
            if json_mode {
                emit_json(&json_error(code, format!("{err:#}"), json!({})));
            } else {
                eprintln!("error: {err:#}");
            }
            ExitCode::from(exit_code)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn run_command(
    command: Commands,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<CommandOutput> {
    match command {
        Commands::Run(args) => execute_run(args, env).await,
        Commands::Filter {
            raw,
            trimmed,
            marker,
            json,
        } => {
            let filter = LogFilter::new(marker.unwrap_or_else(|| DEFAULT_NOISE_MARKER.to_string()));
            let lines = filter.filter_file(&raw, &trimmed)?;
            info!(raw = %raw.display(), trimmed = %trimmed.display(), lines, "log filtered");
            if !json {
                println!("trimmed_log: {}", trimmed.display());
                println!("lines: {}", lines);
            }
            Ok(CommandOutput {
                payload: json!({
                    "ok": true,
                    "command": "filter",
                    "raw_log": raw.display().to_string(),
                    "trimmed_log": trimmed.display().to_string(),
                    "lines": lines,
                }),
                exit_code: EXIT_OK,
            })
        }
        Commands::Check {
            log,
            expected,
            json,
        } => {
            let check = check_files(&log, &expected)?;
            if !json {
                print_check(&check);
            }
            Ok(CommandOutput {
                payload: json!({
                    "ok": check.passed,
                    "command": "check",
                    "log": log.display().to_string(),
                    "check": check,
                }),
                exit_code: if check.passed {
                    EXIT_OK
                } else {
                    EXIT_CHECK_FAILED
                },
            })
        }
    }
}

fn resolve_run_config(
    args: &RunArgs,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<RunConfig> {
    let base = match &args.config {
        Some(path) => RunProfile::load(path).map_err(CliError::Profile)?,
        None => RunProfile::default(),
    };
    let config = base
        .merged_with(args.profile_overrides())
        .resolve(&args.run_dir, env)?;
    Ok(config)
}

async fn execute_run(args: RunArgs, env: &dyn Fn(&str) -> Option<String>) -> Result<CommandOutput> {
    let config = resolve_run_config(&args, env)?;
    debug!(?config, "run config resolved");
    let sink = JsonlRunSink::new(&args.run_dir)
        .with_context(|| format!("open run records in {}", args.run_dir.display()))?;
    let supervisor = Supervisor::new(config).with_sink(Box::new(sink));
    let run_id = supervisor.run_id().to_string();
    let result = supervisor.run().await;

    let check = match (&args.expected, result.exit_reason) {
        (Some(expected), reason) if reason != ExitReason::LaunchFailed => {
            Some(check_files(&result.raw_log_path, expected)?)
        }
        _ => None,
    };
    let exit_code = run_exit_code(&result, check.as_ref());

    if !args.json {
        print_run(&run_id, &result, &args.run_dir);
        if let Some(check) = &check {
            print_check(check);
        }
    }

    let mut payload = json!({
        "ok": exit_code == EXIT_OK,
        "command": "run",
        "run_id": run_id,
        "run_dir": args.run_dir.display().to_string(),
        "result": result,
    });
    if let Some(check) = check {
        payload["check"] = serde_json::to_value(check)?;
    }
    Ok(CommandOutput { payload, exit_code })
}

fn run_exit_code(result: &RunResult, check: Option<&OutputCheck>) -> u8 {
    if result.exit_reason == ExitReason::LaunchFailed {
        return EXIT_LAUNCH_FAILED;
    }
    match check {
        Some(check) if !check.passed => EXIT_CHECK_FAILED,
        _ => EXIT_OK,
    }
}

fn check_files(log: &Path, expected: &Path) -> Result<OutputCheck> {
    let actual = read_text(log)?;
    let expected = read_text(expected)?;
    Ok(check_output(&actual, &expected))
}

fn read_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn classify_error(err: &anyhow::Error) -> (&'static str, u8) {
    for cause in err.chain() {
        if cause.is::<ConfigError>() || cause.is::<CliError>() {
            return ("invalid_config", EXIT_INVALID_CONFIG);
        }
    }
    ("command_failed", EXIT_RUNTIME_ERROR)
}

fn print_run(run_id: &str, result: &RunResult, run_dir: &Path) {
    println!("run_id: {}", run_id);
    println!("exit_reason: {}", result.exit_reason);
    if let Some(found) = &result.matched {
        println!("matched: line {}: {}", found.line_number, found.line);
    }
    if let Some(code) = result.process_exit_code {
        println!("process_exit_code: {}", code);
    }
    println!("elapsed_ms: {}", result.elapsed_ms);
    println!("raw_log: {}", result.raw_log_path.display());
    if let Some(path) = &result.trimmed_log_path {
        println!("trimmed_log: {}", path.display());
    }
    println!("run_dir: {}", run_dir.display());
    if let Some(err) = &result.launch_error {
        eprintln!("launch failed: {}", err);
    }
}

fn print_check(check: &OutputCheck) {
    println!(
        "check: {} ({} expected, {} actual)",
        if check.passed { "passed" } else { "failed" },
        check.expected_lines,
        check.actual_lines
    );
    if !check.missing.is_empty() {
        println!("missing:");
        for line in &check.missing {
            println!("  - {}", line);
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run(args) => args.json,
        Commands::Filter { json, .. } | Commands::Check { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::time::Duration;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn parse_run(argv: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(argv).expect("argv should parse");
        match cli.command {
            Commands::Run(args) => args,
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn emulator_arguments_pass_through_verbatim() {
        let args = parse_run(&[
            "emurun",
            "run",
            "--trigger",
            "Guru Meditation",
            "--time-limit",
            "2.5",
            "qemu-system-xtensa",
            "-nographic",
            "-machine",
            "esp32",
            "--trigger",
        ]);
        assert_eq!(args.executable, Some(PathBuf::from("qemu-system-xtensa")));
        assert_eq!(args.args, vec!["-nographic", "-machine", "esp32", "--trigger"]);
        assert_eq!(args.trigger.as_deref(), Some("Guru Meditation"));
        assert_eq!(args.time_limit, Some(2.5));
        assert_eq!(args.run_dir, PathBuf::from(DEFAULT_RUN_DIR));
    }

    #[test]
    fn double_dash_separates_emulator_arguments() {
        let args = parse_run(&[
            "emurun",
            "run",
            "qemu",
            "--stop-signal",
            "SIGINT",
            "--",
            "-serial",
            "mon:stdio",
        ]);
        assert_eq!(args.stop_signal, Some(StopSignal::Int));
        assert_eq!(args.args, vec!["-serial", "mon:stdio"]);
    }

    #[test]
    fn unknown_stop_signal_is_a_usage_error() {
        let err = Cli::try_parse_from(["emurun", "run", "--stop-signal", "hup", "qemu"])
            .err()
            .expect("should reject signal");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn flags_override_profile_values() {
        let dir = tempfile::tempdir().expect("temp dir");
        let profile = dir.path().join("esp32.yaml");
        fs::write(
            &profile,
            "executable: /opt/qemu/bin/qemu-system-xtensa\nargs: [\"-nographic\"]\ntrigger: Rebooting\ntime_limit_secs: 20\nkill_grace_ms: 750\n",
        )
        .expect("write profile");
        let profile_arg = profile.display().to_string();
        let run_dir = dir.path().join("run").display().to_string();
        let args = parse_run(&[
            "emurun",
            "run",
            "--config",
            &profile_arg,
            "--run-dir",
            &run_dir,
            "--time-limit",
            "3",
        ]);

        let config = resolve_run_config(&args, &no_env).expect("config");
        assert_eq!(
            config.executable,
            PathBuf::from("/opt/qemu/bin/qemu-system-xtensa")
        );
        assert_eq!(config.args, vec!["-nographic"]);
        assert_eq!(config.trigger_pattern, "Rebooting");
        assert_eq!(config.time_limit, Duration::from_secs(3));
        assert_eq!(config.watch.kill_grace, Duration::from_millis(750));
        assert_eq!(config.raw_log, PathBuf::from(&run_dir).join("output.txt"));
    }

    #[test]
    fn environment_overrides_profile_timings() {
        let dir = tempfile::tempdir().expect("temp dir");
        let profile = dir.path().join("p.json");
        fs::write(&profile, r#"{"poll_interval_ms": 200}"#).expect("write profile");
        let profile_arg = profile.display().to_string();
        let args = parse_run(&[
            "emurun", "run", "--config", &profile_arg, "--trigger", "x", "--time-limit", "1",
            "sh",
        ]);
        let env: HashMap<&str, &str> = [("EMURUN_POLL_INTERVAL_MS", "25")].into();
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());

        let config = resolve_run_config(&args, &lookup).expect("config");
        assert_eq!(config.watch.poll_interval, Duration::from_millis(25));
    }

    #[test]
    fn config_problems_map_to_exit_code_two() {
        let args = parse_run(&["emurun", "run", "--time-limit", "1", "qemu"]);
        let err = resolve_run_config(&args, &no_env).expect_err("trigger is missing");
        assert_eq!(classify_error(&err), ("invalid_config", EXIT_INVALID_CONFIG));

        let args = parse_run(&["emurun", "run", "--trigger", "x", "--time-limit", "0", "qemu"]);
        let err = resolve_run_config(&args, &no_env).expect_err("zero limit");
        assert_eq!(classify_error(&err).1, EXIT_INVALID_CONFIG);

        let dir = tempfile::tempdir().expect("temp dir");
        let profile = dir.path().join("bad.yaml");
        fs::write(&profile, "unknown_key: 1\n").expect("write profile");
        let profile_arg = profile.display().to_string();
        let args = parse_run(&["emurun", "run", "--config", &profile_arg]);
        let err = resolve_run_config(&args, &no_env).expect_err("bad profile");
        assert_eq!(classify_error(&err).1, EXIT_INVALID_CONFIG);

        let other = anyhow::anyhow!("disk full");
        assert_eq!(classify_error(&other), ("command_failed", EXIT_RUNTIME_ERROR));
    }

    #[tokio::test]
    async fn check_command_reports_missing_lines() {
        let dir = tempfile::tempdir().expect("temp dir");
        let log = dir.path().join("output.txt");
        let expected = dir.path().join("expected.txt");
        fs::write(&log, "I (31) app: PIN 2, HIGH\nI (1031) app: PIN 2, LOW\n").expect("log");
        fs::write(&expected, "PIN 2, HIGH\n\n  PIN 4, HIGH  \n").expect("expected");

        let output = run_command(
            Commands::Check {
                log,
                expected,
                json: true,
            },
            &no_env,
        )
        .await
        .expect("check runs");
        assert_eq!(output.exit_code, EXIT_CHECK_FAILED);
        assert_eq!(output.payload["ok"], false);
        assert_eq!(output.payload["check"]["missing"], json!(["PIN 4, HIGH"]));
    }

    #[tokio::test]
    async fn filter_command_uses_given_marker() {
        let dir = tempfile::tempdir().expect("temp dir");
        let raw = dir.path().join("output.txt");
        let trimmed = dir.path().join("out").join("filtered_output.txt");
        fs::write(&raw, "rom boot\nMARKER\na\nb\nc\n").expect("raw");

        let output = run_command(
            Commands::Filter {
                raw,
                trimmed: trimmed.clone(),
                marker: Some("MARKER".to_string()),
                json: true,
            },
            &no_env,
        )
        .await
        .expect("filter runs");
        assert_eq!(output.exit_code, EXIT_OK);
        assert_eq!(output.payload["lines"], 2);
        assert_eq!(fs::read_to_string(trimmed).expect("trimmed"), "a\nb\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_command_writes_records_and_checks_output() {
        let dir = tempfile::tempdir().expect("temp dir");
        let run_dir = dir.path().join("run").display().to_string();
        let expected = dir.path().join("expected.txt");
        fs::write(&expected, "PIN 2, HIGH\n").expect("expected");
        let expected_arg = expected.display().to_string();
        let args = parse_run(&[
            "emurun",
            "run",
            "--trigger",
            "Rebooting",
            "--time-limit",
            "10",
            "--run-dir",
            &run_dir,
            "--marker",
            "MARKER",
            "--expected",
            &expected_arg,
            "--json",
            "sh",
            "-c",
            "echo MARKER; echo 'PIN 2, HIGH'; echo 'Rebooting...'; sleep 30",
        ]);

        let output = run_command(Commands::Run(args), &no_env)
            .await
            .expect("run succeeds");
        assert_eq!(output.exit_code, EXIT_OK);
        assert_eq!(output.payload["result"]["exit_reason"], "pattern_matched");
        assert_eq!(output.payload["check"]["passed"], true);

        let run_dir = PathBuf::from(run_dir);
        assert!(run_dir.join(emu_core::RUN_SUMMARY_FILE).exists());
        assert!(run_dir.join(emu_core::RUN_EVENTS_FILE).exists());
        assert_eq!(
            fs::read_to_string(run_dir.join("filtered_output.txt")).expect("trimmed"),
            "PIN 2, HIGH\n"
        );
    }

    #[tokio::test]
    async fn missing_emulator_exits_with_launch_code() {
        let dir = tempfile::tempdir().expect("temp dir");
        let run_dir = dir.path().display().to_string();
        let exe = dir.path().join("qemu-missing").display().to_string();
        let args = parse_run(&[
            "emurun", "run", "--trigger", "x", "--time-limit", "1", "--run-dir", &run_dir, &exe,
        ]);

        let output = run_command(Commands::Run(args), &no_env)
            .await
            .expect("launch failure is a result, not an error");
        assert_eq!(output.exit_code, EXIT_LAUNCH_FAILED);
        assert_eq!(output.payload["result"]["exit_reason"], "launch_failed");
        assert!(output.payload["result"]["trimmed_log_path"].is_null());
    }
}
