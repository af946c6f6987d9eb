use std::env;
use std::fs;
use std::net::SocketAddr;
use std::process::ExitCode;

use contracts::scenario::ScenarioDoc;
use contracts::RunMode;
use kernel_api::{serve, EngineApi};

const EXIT_SCENARIO_ERROR: u8 = 1;
const EXIT_RUNTIME_ERROR: u8 = 2;

fn print_usage() {
    println!("kernel-cli <scenario-file>");
    println!("commands:");
    println!("  run <scenario-file> [--db <path>]");
    println!("  serve <scenario-file> [addr]");
    println!("    default addr: 127.0.0.1:8080");
}

fn load_scenario(path: &str) -> Result<ScenarioDoc, String> {
    let raw = fs::read_to_string(path).map_err(|err| format!("cannot read {path}: {err}"))?;
    serde_json::from_str(&raw).map_err(|err| format!("cannot parse {path}: {err}"))
}

fn build_engine(path: &str, db_path: Option<&str>) -> Result<EngineApi, String> {
    let scenario = load_scenario(path)?;
    let mut engine =
        EngineApi::from_scenario(&scenario).map_err(|err| format!("invalid scenario: {err}"))?;
    if let Some(db) = db_path {
        engine
            .attach_sqlite_store(db)
            .map_err(|err| format!("cannot open {db}: {err}"))?;
        engine
            .initialize_run_storage(true)
            .map_err(|err| format!("cannot initialize run storage: {err}"))?;
    }
    Ok(engine)
}

fn run_to_horizon(mut engine: EngineApi) -> ExitCode {
    let horizon = engine.config().horizon_months;
    engine.start();
    let (status, committed) = engine.run_to_month(horizon);
    println!("committed={} {}", committed, status);

    if status.mode == RunMode::Aborted {
        if let Some(error) = engine.last_runtime_error() {
            eprintln!("runtime error: {error}");
        }
        return ExitCode::from(EXIT_RUNTIME_ERROR);
    }

    let snapshot = engine.snapshot_for_current_month();
    println!(
        "total_material={} facilities={} state_hash={}",
        snapshot.total_material,
        snapshot.facilities.len(),
        snapshot.world_state_hash
    );
    ExitCode::SUCCESS
}

fn parse_socket_addr(value: Option<&String>) -> Result<SocketAddr, String> {
    let raw = value.map(String::as_str).unwrap_or("127.0.0.1:8080");
    raw.parse::<SocketAddr>()
        .map_err(|_| format!("invalid addr: {raw}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str);

    match command {
        Some("run") => {
            let Some(path) = args.get(2) else {
                eprintln!("error: missing scenario file");
                print_usage();
                return ExitCode::from(EXIT_SCENARIO_ERROR);
            };
            let db_path = match args.get(3).map(String::as_str) {
                Some("--db") => match args.get(4) {
                    Some(db) => Some(db.as_str()),
                    None => {
                        eprintln!("error: --db requires a path");
                        print_usage();
                        return ExitCode::from(EXIT_SCENARIO_ERROR);
                    }
                },
                _ => None,
            };
            match build_engine(path, db_path) {
                Ok(engine) => run_to_horizon(engine),
                Err(err) => {
                    eprintln!("error: {err}");
                    ExitCode::from(EXIT_SCENARIO_ERROR)
                }
            }
        }
        Some("serve") => {
            let Some(path) = args.get(2) else {
                eprintln!("error: missing scenario file");
                print_usage();
                return ExitCode::from(EXIT_SCENARIO_ERROR);
            };
            let addr = match parse_socket_addr(args.get(3)) {
                Ok(addr) => addr,
                Err(err) => {
                    eprintln!("error: {err}");
                    print_usage();
                    return ExitCode::from(EXIT_SCENARIO_ERROR);
                }
            };
            let engine = match build_engine(path, None) {
                Ok(engine) => engine,
                Err(err) => {
                    eprintln!("error: {err}");
                    return ExitCode::from(EXIT_SCENARIO_ERROR);
                }
            };
            println!("serving api on http://{addr}");
            if let Err(err) = serve(addr, Some(engine)).await {
                eprintln!("server error: {err}");
                return ExitCode::from(EXIT_RUNTIME_ERROR);
            }
            ExitCode::SUCCESS
        }
        Some(path) if !path.starts_with('-') => match build_engine(path, None) {
            Ok(engine) => run_to_horizon(engine),
            Err(err) => {
                eprintln!("error: {err}");
                ExitCode::from(EXIT_SCENARIO_ERROR)
            }
        },
        _ => {
            print_usage();
            ExitCode::SUCCESS
        }
    }
}
