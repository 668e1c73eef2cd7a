pub mod models {
    pub mod mobile_alerts;
}

pub mod client;
pub mod config;
pub mod error;
pub mod liveness;
pub mod schema;
pub mod shutdown;
pub mod utils;
pub mod db {
    #[cfg(test)]
    pub mod memory;
    pub mod models;
    pub mod store;
}
pub mod services {
    pub mod ingest;
    pub mod normalize;
    pub mod poller;
    pub mod rooms;
}

use crate::client::SensorApiClient;
use crate::config::Config;
use crate::db::store::{PgStore, Store};
use crate::liveness::HeartbeatFile;
use crate::services::poller::{self, LoopSettings, PollState};
use crate::services::rooms::{self, RoomFileWatch};
use crate::shutdown::Shutdown;
use chrono::Utc;
use log::{error, info, warn};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

const DB_CONNECT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

#[derive(Debug, Default)]
struct CliOptions {
    env_file: Option<PathBuf>,
    healthcheck: bool,
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (sensors={}, fetch_interval={}s, api_url={}, max_ids_per_request={}, room_assoc_config={}, room_assoc_watch={}, liveness_threshold={}m, database={})",
        cfg.sensor_ids.len(),
        cfg.fetch_interval.as_secs(),
        cfg.api_url,
        cfg.max_ids_per_request,
        cfg.room_assoc_config.display(),
        cfg.room_assoc_watch,
        cfg.liveness_threshold.num_minutes(),
        cfg.database_url_redacted()
    );
    if cfg.sensor_ids.is_empty() {
        warn!("SENSOR_IDS is empty; the poll loop will run without requesting any sensor");
    }

    // 2) Connect DB and apply pending migrations
    let mut store = PgStore::connect(&cfg.database_url, cfg.db_connect_retries, DB_CONNECT_WAIT)?;

    // 3) Room associations; an invalid file is fatal at startup
    rooms::reconcile(&mut store, &cfg.room_assoc_config).map_err(|e| format!("[{}] {}", e.kind(), e))?;
    let room_watch = cfg
        .room_assoc_watch
        .then(|| RoomFileWatch::new(&cfg.room_assoc_config));

    // 4) Seed rain counters from the latest stored readings
    let mut state = PollState::new();
    match store.latest_rain_totals(&cfg.sensor_ids) {
        Ok(totals) => {
            info!("Seeded cumulative rain for {} sensor(s)", totals.len());
            state.seed_rain_totals(totals);
        }
        Err(e) => warn!("Could not seed cumulative rain totals [{}]: {}", e.kind(), e),
    }

    // 5) Sensor API client
    let client = SensorApiClient::new(
        cfg.api_url.clone(),
        cfg.api_token.clone(),
        cfg.api_timeout,
        cfg.max_ids_per_request,
    );

    // 6) Poll loop until SIGINT/SIGTERM
    let shutdown = Shutdown::from_signals()?;
    info!(
        "Starting poll loop: sensors={}, interval={}s",
        cfg.sensor_ids.len(),
        cfg.fetch_interval.as_secs()
    );
    poller::run_loop(
        &mut store,
        &client,
        &cfg.sensor_ids,
        &mut state,
        LoopSettings {
            interval: cfg.fetch_interval,
            shutdown_grace: cfg.shutdown_grace,
            liveness_threshold: cfg.liveness_threshold,
            heartbeat: Some(HeartbeatFile::new(cfg.liveness_file.clone())),
            room_watch,
        },
        &shutdown,
    )?;
    info!("Shut down cleanly");
    Ok(())
}

/// Exit status for supervisors: 0 while a poll succeeded recently, 1 otherwise.
fn healthcheck() -> i32 {
    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("unhealthy: {}", e);
            return 1;
        }
    };
    if cfg.sensor_ids.is_empty() {
        println!("no sensors configured -> healthy");
        return 0;
    }
    match liveness::check(&HeartbeatFile::new(cfg.liveness_file), Utc::now(), cfg.liveness_threshold) {
        Ok(msg) => {
            println!("{}", msg);
            0
        }
        Err(msg) => {
            eprintln!("{}", msg);
            1
        }
    }
}

fn parse_cli(args: impl IntoIterator<Item = OsString>) -> Result<CliOptions, String> {
    let mut args = args.into_iter();
    let mut opts = CliOptions::default();

    while let Some(arg) = args.next() {
        let arg = arg
            .into_string()
            .map_err(|raw| format!("argument is not valid UTF-8: {:?}", raw))?;
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };

        match flag.as_str() {
            "--env-file" => {
                let path = match inline {
                    Some(value) => value,
                    None => args
                        .next()
                        .and_then(|v| v.into_string().ok())
                        .unwrap_or_default(),
                };
                if path.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                if opts.env_file.replace(PathBuf::from(path)).is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
            }
            "--healthcheck" if inline.is_none() => opts.healthcheck = true,
            "--" => break,
            _ => return Err(format!("unrecognised argument: {}", flag)),
        }
    }
    Ok(opts)
}

/// Load `--env-file`, or `./.env` when present. Variables already set in the
/// process environment win over file values.
fn load_env(explicit: Option<PathBuf>) -> Result<Option<LoadedEnvFile>, String> {
    let (path, explicit) = match explicit {
        Some(path) => {
            if !path.is_file() {
                return Err(format!("env file not found: {}", path.display()));
            }
            (path, true)
        }
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let path = cwd.join(".env");
            if !path.is_file() {
                return Ok(None);
            }
            (path, false)
        }
    };

    dotenvy::from_path(&path).map_err(|e| format!("failed to load {}: {}", path.display(), e))?;
    Ok(Some(LoadedEnvFile { path, explicit }))
}

fn main() {
    let opts = match parse_cli(std::env::args_os().skip(1)) {
        Ok(opts) => opts,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(2);
        }
    };
    let loaded_env = match load_env(opts.env_file) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    if opts.healthcheck {
        std::process::exit(healthcheck());
    }

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "sensor-ingest {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn cli_accepts_env_file_and_healthcheck() {
        let opts = parse_cli(args(&["--env-file", "prod.env", "--healthcheck"])).unwrap();
        assert_eq!(opts.env_file, Some(PathBuf::from("prod.env")));
        assert!(opts.healthcheck);

        let opts = parse_cli(args(&["--env-file=dev.env"])).unwrap();
        assert_eq!(opts.env_file, Some(PathBuf::from("dev.env")));
        assert!(!opts.healthcheck);
    }

    #[test]
    fn cli_rejects_bad_arguments() {
        assert!(parse_cli(args(&["--env-file"])).is_err());
        assert!(parse_cli(args(&["--env-file=a", "--env-file=b"])).is_err());
        assert!(parse_cli(args(&["--verbose"])).is_err());
    }

    #[test]
    fn env_file_values_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.env");
        std::fs::write(
            &path,
            "# local overrides\nSENSOR_INGEST_ENV_FILE_CHECK=\"from file\" # quoted\n",
        )
        .unwrap();

        let loaded = load_env(Some(path.clone())).unwrap().unwrap();
        assert!(loaded.explicit);
        assert_eq!(loaded.path, path);
        assert_eq!(
            std::env::var("SENSOR_INGEST_ENV_FILE_CHECK").as_deref(),
            Ok("from file")
        );
    }

    #[test]
    fn missing_env_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_env(Some(dir.path().join("absent.env"))).unwrap_err();
        assert!(err.contains("not found"));
    }
}
