use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use facematch::config::Config;
use facematch::db::SqliteStore;
use facematch::logging;
use facematch::recognition::HttpFaceProvider;
use facematch::scanner::{HttpFetcher, ImageRef, LocalObjectSource};
use facematch::tasks::{
    CollectionRef, JobHandle, JobRunner, JobSpec, ProgressRecord, RetryPolicy, Services,
};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

enum Command {
    Scan {
        probe: String,
        prefixes: Vec<String>,
    },
    Index {
        event: String,
        folder: String,
        prefixes: Vec<String>,
        reprocess: bool,
    },
    Search {
        probe: String,
        event: String,
        folder: String,
    },
    Status {
        job_id: String,
    },
    Resume {
        job_id: String,
    },
    Unfinished,
}

struct Args {
    command: Command,
    config_path: Option<PathBuf>,
    job_id: Option<String>,
    threshold: Option<f32>,
}

fn take_value(args: &[String], i: &mut usize, flag: &str) -> String {
    if *i + 1 < args.len() {
        *i += 1;
        args[*i].clone()
    } else {
        eprintln!("Error: {} requires a value", flag);
        std::process::exit(1);
    }
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();

    let mut subcommand: Option<String> = None;
    let mut positional: Vec<String> = Vec::new();
    let mut config_path = None;
    let mut job_id = None;
    let mut threshold = None;
    let mut probe = None;
    let mut prefixes = Vec::new();
    let mut event = None;
    let mut folder = None;
    let mut reprocess = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("facematch {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => config_path = Some(PathBuf::from(take_value(&args, &mut i, "--config"))),
            "--job-id" => job_id = Some(take_value(&args, &mut i, "--job-id")),
            "--probe" => probe = Some(take_value(&args, &mut i, "--probe")),
            "--prefix" => prefixes.push(take_value(&args, &mut i, "--prefix")),
            "--event" => event = Some(take_value(&args, &mut i, "--event")),
            "--folder" => folder = Some(take_value(&args, &mut i, "--folder")),
            "--reprocess" => reprocess = true,
            "--threshold" => {
                let raw = take_value(&args, &mut i, "--threshold");
                match raw.parse::<f32>() {
                    Ok(value) => threshold = Some(value),
                    Err(_) => {
                        eprintln!("Error: --threshold expects a number, got {}", raw);
                        std::process::exit(1);
                    }
                }
            }
            arg if arg.starts_with('-') => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
            arg => {
                if subcommand.is_none() {
                    subcommand = Some(arg.to_string());
                } else {
                    positional.push(arg.to_string());
                }
            }
        }
        i += 1;
    }

    let require = |value: Option<String>, flag: &str| -> String {
        value.unwrap_or_else(|| {
            eprintln!("Error: {} is required", flag);
            std::process::exit(1);
        })
    };
    let job_arg = |positional: &[String], job_id: &Option<String>| -> String {
        positional
            .first()
            .cloned()
            .or_else(|| job_id.clone())
            .unwrap_or_else(|| {
                eprintln!("Error: a job id is required");
                std::process::exit(1);
            })
    };

    let command = match subcommand.as_deref() {
        Some("scan") => Command::Scan {
            probe: require(probe, "--probe"),
            prefixes,
        },
        Some("index") => Command::Index {
            event: require(event, "--event"),
            folder: require(folder, "--folder"),
            prefixes,
            reprocess,
        },
        Some("search") => Command::Search {
            probe: require(probe, "--probe"),
            event: require(event, "--event"),
            folder: require(folder, "--folder"),
        },
        Some("status") => Command::Status {
            job_id: job_arg(&positional, &job_id),
        },
        Some("resume") => Command::Resume {
            job_id: job_arg(&positional, &job_id),
        },
        Some("unfinished") => Command::Unfinished,
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            print_help();
            std::process::exit(1);
        }
        None => {
            print_help();
            std::process::exit(1);
        }
    };

    Args {
        command,
        config_path,
        job_id,
        threshold,
    }
}

fn print_help() {
    println!(
        r#"facematch - find a person's face across event photos

USAGE:
    facematch [OPTIONS] <COMMAND>

COMMANDS:
    scan        Compare a probe against every image under the prefixes
                  --probe REF --prefix P [--prefix P ...] [--threshold N]
    index       Register faces of event photos in the folder's collection
                  --event ID --folder NAME --prefix P [--reprocess]
    search      Search a folder's collection with a probe
                  --probe REF --event ID --folder NAME [--threshold N]
    status ID   Show a job's progress record
    resume ID   Continue an unfinished job
    unfinished  List jobs that are pending or still processing

OPTIONS:
    --job-id ID         Job id (default: generated from the current time)
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

Probe references starting with http:// or https:// are downloaded, anything
else is read from the storage root.

ENVIRONMENT:
    FACEMATCH_CONFIG    Path to config file (overrides default location)
    FACEMATCH_LOG       Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/facematch/config.toml"#
    );
}

fn generated_job_id(prefix: &str) -> String {
    format!("{}-{}", prefix, chrono::Utc::now().format("%Y%m%dT%H%M%S%3f"))
}

fn print_record(record: &ProgressRecord) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

/// Poll until the job stops, cancelling it on Ctrl-C.
async fn follow(runner: &JobRunner, handle: JobHandle) -> Result<()> {
    let job_id = handle.job_id().to_string();
    let mut last_scanned = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Cancelling {}...", job_id);
                runner.cancel(&job_id).await?;
                handle.cancel();
                break;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                let record = runner.poll(&job_id).await?;
                if last_scanned != Some(record.scanned_files) {
                    eprintln!(
                        "{}: {} {}/{} ({}%) matches={}",
                        job_id,
                        record.status.as_str(),
                        record.scanned_files,
                        record.total_files,
                        record.percent(),
                        record.matches_found
                    );
                    last_scanned = Some(record.scanned_files);
                }
                if handle.is_finished() {
                    break;
                }
            }
        }
    }

    handle.wait().await;
    let record = runner.poll(&job_id).await?;
    print_record(&record)?;
    if record.resumable {
        eprintln!("Deadline reached; continue with: facematch resume {}", job_id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let _ = logging::init(None);

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(SqliteStore::open(&config.db_path)?);

    let services = Services {
        source: Arc::new(LocalObjectSource::new(config.storage.root.clone())),
        fetcher: Arc::new(HttpFetcher::new(Duration::from_secs(
            config.provider.timeout_secs,
        ))),
        provider: Arc::new(HttpFaceProvider::from_config(&config.provider)),
        progress: store.clone(),
        metadata: store.clone(),
    };
    let runner = JobRunner::new(
        services,
        config.jobs.clone(),
        RetryPolicy::from_config(&config.retry),
    );
    let threshold = args.threshold.unwrap_or(config.jobs.similarity_threshold);

    let spec = match args.command {
        Command::Scan { probe, prefixes } => {
            let job_id = args.job_id.unwrap_or_else(|| generated_job_id("scan"));
            JobSpec::pairwise(&job_id, ImageRef::parse(&probe), prefixes).with_threshold(threshold)
        }
        Command::Index {
            event,
            folder,
            prefixes,
            reprocess,
        } => {
            let job_id = args.job_id.unwrap_or_else(|| generated_job_id("index"));
            JobSpec::index(&job_id, CollectionRef::new(event, folder), prefixes)
                .with_reprocess(reprocess)
        }
        Command::Search {
            probe,
            event,
            folder,
        } => {
            let job_id = args.job_id.unwrap_or_else(|| generated_job_id("search"));
            JobSpec::collection_search(
                &job_id,
                ImageRef::parse(&probe),
                CollectionRef::new(event, folder),
            )
            .with_threshold(threshold)
        }
        Command::Status { job_id } => {
            return print_record(&runner.poll(&job_id).await?);
        }
        Command::Resume { job_id } => {
            let handle = runner.resume(&job_id).await?;
            return follow(&runner, handle).await;
        }
        Command::Unfinished => {
            for job_id in store.unfinished_jobs()? {
                println!("{}", job_id);
            }
            return Ok(());
        }
    };

    info!(job_id = %spec.job_id, mode = spec.mode.display_name(), "Starting job");
    let handle = runner.start(spec).await?;
    follow(&runner, handle).await
}
