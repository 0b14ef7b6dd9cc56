use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use sqlreduce_error::{ReduceError, Result};
use sqlreduce_harness::isolation::{WORKER_SUBCOMMAND, run_worker_job};
use sqlreduce_harness::logging::{init_logging, init_worker_logging};
use sqlreduce_harness::script::render_statements;
use sqlreduce_harness::{
    AcceptancePolicy, CrashHarness, IsolationMode, LoadContext, ReduceSettings, ReductionDriver,
    ReductionOutcome, ShellOracle,
};
use tracing::{error, info};

const RULE: &str = "================================================================";

/// Flags that override the settings file.
#[derive(Debug, Default)]
struct Overrides {
    shell: Option<PathBuf>,
    max_time_secs: Option<u64>,
    verbose: bool,
    work_dir: Option<PathBuf>,
    isolation: Option<IsolationMode>,
    acceptance: Option<AcceptancePolicy>,
}

#[derive(Debug, Default)]
struct CliConfig {
    load: Option<PathBuf>,
    exec: Option<PathBuf>,
    cleanup_log: Option<PathBuf>,
    inplace: bool,
    config: Option<PathBuf>,
    report: Option<PathBuf>,
    log_file: Option<PathBuf>,
    overrides: Overrides,
}

#[derive(Debug)]
enum Invocation {
    Reduce(CliConfig),
    CleanupLog(CliConfig),
    Worker { job: PathBuf },
    Help,
}

fn print_help() {
    let help = "\
sqlreduce - shrink a SQL script while it keeps triggering the same engine fault

USAGE:
    sqlreduce --load <PATH> --exec <PATH> [OPTIONS]
    sqlreduce --cleanup-log <PATH> [OPTIONS]

OPTIONS:
    --shell <PATH>             Engine shell binary (default: build/debug/duckdb)
    --load <PATH>              Setup script run before every candidate
    --exec <PATH>              Script that triggers the fault
    --inplace                  Overwrite the exec script with the reduced result
    --max-time <SECS>          Wall-clock budget in seconds (default: 300)
    --verbose                  Debug logging and per-candidate diagnostics
    --config <PATH>            TOML settings file; flags override it
    --work-dir <PATH>          Directory for the crash journal (default: .sqlreduce)
    --isolation <MODE>         Harness worker: process|thread (default: process)
    --accept <POLICY>          Log-step acceptance: same-signature|any-fault
    --report <PATH>            Write a JSON reduction report
    --log-file <PATH>          Also write logs as JSON lines to this file
    --cleanup-log <PATH>       Replay a captured query log through the harness
    -h, --help                 Show this help

EXIT CODES:
    0 reduced, 1 could not reproduce, 2+ error
";
    println!("{help}");
}

fn take_value<'a>(args: &'a [String], index: &mut usize, flag: &str) -> Result<&'a str> {
    *index += 1;
    args.get(*index)
        .map(String::as_str)
        .ok_or_else(|| ReduceError::config(format!("{flag} requires a value")))
}

fn parse_args(args: &[String]) -> Result<Invocation> {
    if args.first().map(String::as_str) == Some(WORKER_SUBCOMMAND) {
        return match args.get(1..) {
            Some([flag, job]) if flag == "--job" => Ok(Invocation::Worker {
                job: PathBuf::from(job),
            }),
            _ => Err(ReduceError::config(format!(
                "usage: sqlreduce {WORKER_SUBCOMMAND} --job <PATH>"
            ))),
        };
    }

    let mut config = CliConfig::default();
    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--shell" => {
                config.overrides.shell = Some(PathBuf::from(take_value(args, &mut index, "--shell")?));
            }
            "--load" => config.load = Some(PathBuf::from(take_value(args, &mut index, "--load")?)),
            "--exec" => config.exec = Some(PathBuf::from(take_value(args, &mut index, "--exec")?)),
            "--inplace" => config.inplace = true,
            "--max-time" => {
                let raw = take_value(args, &mut index, "--max-time")?;
                let secs = raw
                    .parse::<u64>()
                    .map_err(|_| ReduceError::config(format!("invalid --max-time value: {raw}")))?;
                config.overrides.max_time_secs = Some(secs);
            }
            "--verbose" => config.overrides.verbose = true,
            "--config" => {
                config.config = Some(PathBuf::from(take_value(args, &mut index, "--config")?));
            }
            "--work-dir" => {
                config.overrides.work_dir =
                    Some(PathBuf::from(take_value(args, &mut index, "--work-dir")?));
            }
            "--isolation" => {
                config.overrides.isolation =
                    Some(take_value(args, &mut index, "--isolation")?.parse()?);
            }
            "--accept" => {
                config.overrides.acceptance = Some(take_value(args, &mut index, "--accept")?.parse()?);
            }
            "--report" => {
                config.report = Some(PathBuf::from(take_value(args, &mut index, "--report")?));
            }
            "--log-file" => {
                config.log_file = Some(PathBuf::from(take_value(args, &mut index, "--log-file")?));
            }
            "--cleanup-log" => {
                config.cleanup_log =
                    Some(PathBuf::from(take_value(args, &mut index, "--cleanup-log")?));
            }
            "-h" | "--help" => return Ok(Invocation::Help),
            unknown => return Err(ReduceError::config(format!("unknown option: {unknown}"))),
        }
        index += 1;
    }

    if config.cleanup_log.is_some() {
        if config.exec.is_some() {
            return Err(ReduceError::config("--cleanup-log cannot be combined with --exec"));
        }
        return Ok(Invocation::CleanupLog(config));
    }
    if config.load.is_none() || config.exec.is_none() {
        return Err(ReduceError::config("--load and --exec are required"));
    }
    Ok(Invocation::Reduce(config))
}

fn build_settings(config: &CliConfig) -> Result<ReduceSettings> {
    let mut settings = match &config.config {
        Some(path) => ReduceSettings::load(path)?,
        None => ReduceSettings::default(),
    };
    let overrides = &config.overrides;
    if let Some(shell) = &overrides.shell {
        settings.engine.shell.clone_from(shell);
    }
    if let Some(secs) = overrides.max_time_secs {
        settings.max_time_secs = secs;
    }
    if overrides.verbose {
        settings.verbose = true;
    }
    if let Some(dir) = &overrides.work_dir {
        settings.work_dir.clone_from(dir);
    }
    if let Some(isolation) = overrides.isolation {
        settings.isolation = isolation;
    }
    if let Some(acceptance) = overrides.acceptance {
        settings.acceptance = acceptance;
    }
    settings.validate()?;
    Ok(settings)
}

fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|err| ReduceError::InvalidInput(format!("cannot read '{}': {err}", path.display())))
}

fn print_section(title: &str, body: &str) {
    println!("{RULE}");
    println!("{title}");
    println!("{RULE}");
    println!("{body}");
}

fn run_reduce(config: &CliConfig, settings: &ReduceSettings) -> Result<ExitCode> {
    let (Some(load_path), Some(exec_path)) = (&config.load, &config.exec) else {
        return Err(ReduceError::config("--load and --exec are required"));
    };
    let load = LoadContext::new(read_script(load_path)?);
    let script = read_script(exec_path)?;

    let oracle = ShellOracle::new(settings.engine.clone());
    let driver = ReductionDriver::new(&oracle, settings);
    let report = match driver.reduce_script(&load, &script)? {
        ReductionOutcome::CouldNotReproduce { stdout } => {
            println!("Failed to reproduce the error with the unmodified query");
            if !stdout.is_empty() {
                println!("{stdout}");
            }
            return Ok(ExitCode::from(1));
        }
        ReductionOutcome::Reduced(report) => report,
    };

    print_section("Found expected error", &report.target_signature);
    print_section("Found final reduced query", &report.final_script);
    println!("{RULE}");
    println!("{}", report.triage_line());

    if config.inplace {
        std::fs::write(exec_path, &report.final_script)?;
        info!(path = %exec_path.display(), "exec script overwritten");
    }
    if let Some(path) = &config.report {
        report.write_json(path)?;
        info!(path = %path.display(), "report written");
    }
    Ok(ExitCode::SUCCESS)
}

fn run_cleanup(config: &CliConfig, settings: &ReduceSettings) -> Result<ExitCode> {
    let Some(log_path) = &config.cleanup_log else {
        return Err(ReduceError::config("--cleanup-log requires a value"));
    };
    let log = read_script(log_path)?;
    settings.ensure_work_dir()?;

    let oracle = ShellOracle::new(settings.engine.clone());
    let outcome = CrashHarness::new(&oracle, settings).cleanup_query_log(&LoadContext::empty(), &log)?;
    match (outcome.signature, outcome.surviving) {
        (Some(signature), Some(surviving)) => {
            print_section("Found error", signature.as_str());
            print_section("Statements needed to reproduce", &render_statements(&surviving));
            println!("{RULE}");
            Ok(ExitCode::SUCCESS)
        }
        _ => {
            println!("Query log replayed without a fault");
            Ok(ExitCode::from(1))
        }
    }
}

fn run(args: &[String]) -> Result<ExitCode> {
    let invocation = parse_args(args)?;
    match invocation {
        Invocation::Help => {
            print_help();
            Ok(ExitCode::SUCCESS)
        }
        Invocation::Worker { job } => {
            init_worker_logging();
            run_worker_job(&job)?;
            Ok(ExitCode::SUCCESS)
        }
        Invocation::Reduce(config) | Invocation::CleanupLog(config) => {
            let settings = build_settings(&config)?;
            init_logging(settings.verbose, config.log_file.as_deref())?;
            if config.cleanup_log.is_some() {
                run_cleanup(&config, &settings)
            } else {
                run_reduce(&config, &settings)
            }
        }
    }
}

/// Stderr text for a failed run. Setup failures are told apart from a
/// reduction that stopped part way.
fn failure_message(err: &ReduceError) -> String {
    let stage = if err.is_fatal() {
        "setup failed"
    } else {
        "reduction aborted"
    };
    let mut message = format!("ERROR ({stage}): {err}\n");
    if let Some(hint) = err.suggestion() {
        message.push_str("hint: ");
        message.push_str(hint);
        message.push('\n');
    }
    message
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    match run(&args) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, fatal = err.is_fatal(), "sqlreduce failed");
            eprint!("{}", failure_message(&err));
            ExitCode::from(err.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn reduce_invocation_collects_overrides() {
        let invocation = parse_args(&args(&[
            "--load", "load.sql", "--exec", "exec.sql", "--max-time", "12", "--isolation",
            "thread", "--accept", "any-fault", "--verbose", "--inplace",
        ]))
        .expect("valid flags");
        let Invocation::Reduce(config) = invocation else {
            panic!("expected reduce invocation");
        };
        assert!(config.inplace);
        let settings = build_settings(&config).expect("settings");
        assert_eq!(settings.max_time_secs, 12);
        assert_eq!(settings.isolation, IsolationMode::Thread);
        assert_eq!(settings.acceptance, AcceptancePolicy::AnyFault);
        assert!(settings.verbose);
    }

    #[test]
    fn missing_required_flags_are_config_errors() {
        let err = parse_args(&args(&["--load", "load.sql"])).expect_err("exec missing");
        assert_eq!(err.exit_code(), 2);
        let err = parse_args(&args(&["--max-time"])).expect_err("value missing");
        assert!(err.to_string().contains("--max-time requires a value"));
        let err = parse_args(&args(&["--isolation", "fork", "--load", "a", "--exec", "b"]))
            .expect_err("bad mode");
        assert!(matches!(err, ReduceError::Config(_)));
    }

    #[test]
    fn worker_subcommand_is_recognised_first() {
        let invocation =
            parse_args(&args(&[WORKER_SUBCOMMAND, "--job", "/tmp/job.json"])).expect("worker");
        assert!(
            matches!(invocation, Invocation::Worker { ref job } if job == Path::new("/tmp/job.json"))
        );
        assert!(parse_args(&args(&[WORKER_SUBCOMMAND])).is_err(), "case=missing_job");
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sqlreduce.toml");
        std::fs::write(&path, "max_time_secs = 30\n[engine]\nshell = \"/opt/engine\"\n")
            .expect("write config");
        let invocation = parse_args(&args(&[
            "--config",
            path.to_str().expect("utf-8 path"),
            "--load",
            "a",
            "--exec",
            "b",
            "--max-time",
            "7",
        ]))
        .expect("valid flags");
        let Invocation::Reduce(config) = invocation else {
            panic!("expected reduce invocation");
        };
        let settings = build_settings(&config).expect("settings");
        assert_eq!(settings.max_time_secs, 7, "case=flag_wins");
        assert_eq!(settings.engine.shell, PathBuf::from("/opt/engine"), "case=file_kept");
    }

    #[test]
    fn cleanup_log_excludes_exec() {
        let invocation = parse_args(&args(&["--cleanup-log", "q.log"])).expect("cleanup");
        assert!(matches!(invocation, Invocation::CleanupLog(_)));
        assert!(parse_args(&args(&["--cleanup-log", "q.log", "--exec", "x"])).is_err());
    }

    #[test]
    fn failure_message_separates_setup_from_aborted_runs() {
        let setup = failure_message(&ReduceError::config("bad flag"));
        assert!(setup.starts_with("ERROR (setup failed): "), "message={setup}");
        assert!(setup.contains("hint: "), "case=hint_printed");

        let aborted = failure_message(&ReduceError::journal("/tmp/j.jsonl", "torn header"));
        assert!(aborted.starts_with("ERROR (reduction aborted): "), "message={aborted}");
    }
}
