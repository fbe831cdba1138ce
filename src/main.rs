//! planet - StarPing probe agent.
//!
//! Fetches its probe configuration from a Star coordinator, measures
//! latency and path topology toward the configured targets, and reports
//! signed statistics back over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Duplicate, FileSpec, Logger, LoggerHandle};
use log::{debug, info, warn};
use planet::config::{self, ConfigClient, MtrConfig, PingConfig};
use planet::dns::RdnsService;
use planet::report::{
    parse_retry_spec, unix_nanos, Pipeline, Report, ReportClient, ReportContainer, ReportKind,
};
use planet::scheduler;
use planet::{mtr, ping, IcmpManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const LICENSE: &str = "StarPing planet probe agent\n\n\
This program is free software: you can redistribute it and/or modify it\n\
under the terms of the GNU General Public License as published by the Free\n\
Software Foundation, either version 3 of the License, or (at your option)\n\
any later version.\n\n\
This program is distributed in the hope that it will be useful, but WITHOUT\n\
ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or\n\
FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for\n\
more details.";

/// Command-line arguments for the probe agent.
#[derive(Parser, Debug)]
#[clap(name = "planet", version, about = "StarPing planet: network probe agent", long_about = None)]
struct Args {
    /// Authorization key shared with the coordinator
    #[clap(short = 'k', long = "key", default_value = "secret")]
    secret: String,

    /// Name of this planet
    #[clap(short = 'n', long, default_value = "planet")]
    name: String,

    /// Coordinator host:port to report to
    #[clap(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Connect to the coordinator over HTTPS
    #[clap(short = 't', long)]
    https: bool,

    /// Retry stages as "seconds,capacity;..."; "0" disables retries
    #[clap(short = 'r', long, default_value = "60,64;3600,64")]
    retry: String,

    /// Append logs to this file in addition to stderr
    #[clap(short = 'l', long)]
    log_file: Option<PathBuf>,

    /// Verbosity: 0 error, 1 warn, 2 info, 3 debug
    #[clap(short = 'v', long, default_value_t = 2)]
    verbose: u8,

    /// Report send timeout in milliseconds
    #[clap(short = 'w', long = "timeout", default_value_t = 1000)]
    timeout_ms: u64,

    /// Config refresh interval in seconds
    #[clap(short = 'f', long = "refresh", default_value_t = 3600)]
    refresh_s: u64,

    /// Print license information and exit
    #[clap(long)]
    license: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.license {
        println!("{LICENSE}");
        return Ok(());
    }
    let _logger = init_logging(&args)?;
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?
        .block_on(run(args))
}

fn init_logging(args: &Args) -> Result<LoggerHandle> {
    let level = match args.verbose {
        0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    };
    let logger = Logger::try_with_env_or_str(level).context("failed to parse log level")?;
    match &args.log_file {
        Some(path) => logger
            .log_to_file(FileSpec::try_from(path.clone()).context("bad log file path")?)
            .duplicate_to_stderr(Duplicate::All)
            .start(),
        None => logger.log_to_stderr().start(),
    }
    .context("failed to start logger")
}

async fn run(args: Args) -> Result<()> {
    let stages = parse_retry_spec(&args.retry).context("bad retry config")?;
    let scheme = if args.https { "https" } else { "http" };
    let base = format!("{scheme}://{}", args.server);
    let secret: Arc<Vec<u8>> = Arc::new(args.secret.clone().into_bytes());

    let http = reqwest::Client::builder()
        .timeout(Duration::from_millis(args.timeout_ms))
        .pool_max_idle_per_host(100)
        .build()
        .context("failed to build HTTP client")?;

    let config_client = Arc::new(ConfigClient::new(
        http.clone(),
        &base,
        &args.name,
        secret.as_slice(),
    ));
    let initial = config_client
        .fetch()
        .await
        .context("can't get config from the coordinator")?;
    info!("got config from the coordinator");

    let sink = Arc::new(ReportClient::new(http, &base, &args.name));
    let pipeline = Pipeline::spawn(sink, &stages);

    // starts the receive chains and fires the warm-up probe
    let manager = IcmpManager::global();

    let ping_frequency = initial.ping_config.frequency;
    let mtr_frequency = initial.mtr_config.frequency;
    let (config_tx, config_rx) = watch::channel(Arc::new(initial));

    info!("aligning probe start");
    scheduler::align_to_boundary(ping_frequency).await;

    {
        let pipeline = pipeline.clone();
        let secret = Arc::clone(&secret);
        let config_rx = config_rx.clone();
        scheduler::spawn_periodic(ping_frequency, move || {
            let snapshot = config_rx.borrow().clone();
            let pipeline = pipeline.clone();
            let secret = Arc::clone(&secret);
            tokio::spawn(async move {
                info!(
                    "start probing latency data of {} targets",
                    snapshot.ping_targets.len()
                );
                let config = snapshot.ping_config.clone();
                let targets = snapshot.ping_targets.clone();
                scheduler::fan_out(ping_frequency, targets, move |target| {
                    tokio::spawn(ping_report(
                        target,
                        config.clone(),
                        pipeline.clone(),
                        Arc::clone(&secret),
                    ));
                })
                .await;
            });
        });
    }
    {
        let pipeline = pipeline.clone();
        let secret = Arc::clone(&secret);
        let config_rx = config_rx.clone();
        scheduler::spawn_periodic(mtr_frequency, move || {
            let snapshot = config_rx.borrow().clone();
            let pipeline = pipeline.clone();
            let secret = Arc::clone(&secret);
            tokio::spawn(async move {
                info!(
                    "start probing route data of {} targets",
                    snapshot.mtr_targets.len()
                );
                let config = snapshot.mtr_config.clone();
                let targets = snapshot.mtr_targets.clone();
                scheduler::fan_out(mtr_frequency, targets, move |target| {
                    tokio::spawn(mtr_report(
                        target,
                        config.clone(),
                        pipeline.clone(),
                        Arc::clone(&secret),
                    ));
                })
                .await;
            });
        });
    }

    config::spawn_refresh(config_client, config_tx, Duration::from_secs(args.refresh_s));

    tokio::signal::ctrl_c()
        .await
        .context("failed waiting for shutdown signal")?;
    info!("shutting down");
    manager.finish();
    Ok(())
}

async fn ping_report(target: String, config: PingConfig, pipeline: Pipeline, secret: Arc<Vec<u8>>) {
    debug!("ping {target}");
    let time = unix_nanos();
    match ping(IcmpManager::global(), &target, &config).await {
        Ok(stat) => match serde_json::to_vec(&Report { time, report: stat }) {
            Ok(body) => pipeline.submit(ReportContainer::new(
                ReportKind::Ping,
                target,
                body,
                &secret,
            )),
            Err(err) => warn!("failed marshalling ping report for {target}: {err}"),
        },
        Err(err) => debug!("ping {target} skipped: {err:#}"),
    }
}

async fn mtr_report(target: String, config: MtrConfig, pipeline: Pipeline, secret: Arc<Vec<u8>>) {
    debug!("mtr {target}");
    let time = unix_nanos();
    match mtr(IcmpManager::global(), RdnsService::global(), &target, &config).await {
        Ok(stat) => match serde_json::to_vec(&Report { time, report: stat }) {
            Ok(body) => pipeline.submit(ReportContainer::new(ReportKind::Mtr, target, body, &secret)),
            Err(err) => warn!("failed marshalling mtr report for {target}: {err}"),
        },
        Err(err) => debug!("mtr {target} skipped: {err:#}"),
    }
}
