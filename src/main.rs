//! Command-line entry point.
//!
//! Flags layer over an optional TOML config file which layers over
//! defaults; every flag can also come from an `S3GC_*` environment
//! variable, and a `.env` file is honored. The summary goes to stdout,
//! structured logs to stderr.

use clap::Parser;
use s3gc::config::GcConfig;
use s3gc::observability::{self, Verbosity};
use s3gc::session::GcSession;
use std::path::PathBuf;
use std::process::ExitCode;

/// Garbage collector for unreferenced objects on ClickHouse S3 disks.
#[derive(Parser, Debug)]
#[command(name = "s3gc", version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file (default: the user config directory).
    #[arg(long, env = "S3GC_CONFIG")]
    config: Option<PathBuf>,

    /// ClickHouse host.
    #[arg(long, env = "S3GC_CH_HOST")]
    ch_host: Option<String>,

    /// ClickHouse HTTP port.
    #[arg(long, env = "S3GC_CH_PORT")]
    ch_port: Option<u16>,

    /// ClickHouse user.
    #[arg(long, env = "S3GC_CH_USER")]
    ch_user: Option<String>,

    /// ClickHouse password.
    #[arg(long, env = "S3GC_CH_PASSWORD")]
    ch_password: Option<String>,

    /// Use HTTPS for ClickHouse.
    #[arg(long, env = "S3GC_CH_SECURE")]
    ch_secure: bool,

    /// S3 endpoint URL, e.g. http://127.0.0.1:9001.
    #[arg(long, env = "S3GC_S3_ENDPOINT")]
    s3_endpoint: Option<String>,

    /// S3 bucket holding the disk's objects.
    #[arg(long, env = "S3GC_S3_BUCKET")]
    s3_bucket: Option<String>,

    /// S3 access key.
    #[arg(long, env = "S3GC_S3_ACCESS_KEY")]
    s3_access_key: Option<String>,

    /// S3 secret key.
    #[arg(long, env = "S3GC_S3_SECRET_KEY")]
    s3_secret_key: Option<String>,

    /// S3 region used in request signing.
    #[arg(long, env = "S3GC_S3_REGION")]
    s3_region: Option<String>,

    /// Key prefix the disk writes under.
    #[arg(long, env = "S3GC_S3_PREFIX")]
    s3_prefix: Option<String>,

    /// ClickHouse disk name to reconcile.
    #[arg(long, env = "S3GC_DISK")]
    disk: Option<String>,

    /// Inventory table prefix; `db.prefix_` namespaces the table.
    #[arg(long, env = "S3GC_TABLE_PREFIX")]
    table_prefix: Option<String>,

    /// Allow creating the namespace of a namespaced table prefix.
    #[arg(long, env = "S3GC_CREATE_NAMESPACE")]
    create_namespace: bool,

    /// Drop and recreate the inventory table before collecting.
    #[arg(long, env = "S3GC_RECREATE_TABLE")]
    recreate_table: bool,

    /// Require that no replica of this cluster references an object.
    #[arg(long, env = "S3GC_CLUSTER")]
    cluster: Option<String>,

    /// Number of shards the inventory is partitioned into.
    #[arg(long, env = "S3GC_SAMPLES")]
    samples: Option<u32>,

    /// Only touch objects older than this many hours (0 disables).
    #[arg(long, env = "S3GC_AGE_HOURS")]
    age_hours: Option<u64>,

    /// Rows per inventory insert batch.
    #[arg(long, env = "S3GC_COLLECT_BATCH_SIZE")]
    collect_batch_size: Option<usize>,

    /// Rows per streamed candidate block during the sweep.
    #[arg(long, env = "S3GC_SWEEP_BLOCK_ROWS")]
    sweep_block_rows: Option<usize>,

    /// Stop collecting after this many objects (resumable).
    #[arg(long, env = "S3GC_TOTAL")]
    total: Option<u64>,

    /// Resume collecting after this object name.
    #[arg(long, env = "S3GC_COLLECT_AFTER")]
    collect_after: Option<String>,

    /// Resume the sweep after this object name.
    #[arg(long, env = "S3GC_USE_AFTER")]
    use_after: Option<String>,

    /// Process at most this many candidates during the sweep.
    #[arg(long, env = "S3GC_USE_TOTAL")]
    use_total: Option<u64>,

    /// Compute what would be removed without deleting anything.
    #[arg(long, env = "S3GC_DRY_RUN")]
    dry_run: bool,

    /// Keep the inventory table contents after the sweep.
    #[arg(long, env = "S3GC_KEEP_DATA")]
    keep_data: bool,

    /// Only collect the inventory; skip reconciliation.
    #[arg(long, env = "S3GC_COLLECT_ONLY")]
    collect_only: bool,

    /// Sweep a previously collected inventory; skip collection.
    #[arg(long, env = "S3GC_USE_COLLECTED")]
    use_collected: bool,

    /// Log progress at info level.
    #[arg(short, long)]
    verbose: bool,

    /// Log everything, including per-batch detail.
    #[arg(long)]
    debug: bool,

    /// Suppress all output except errors on the exit code.
    #[arg(long, conflicts_with_all = ["verbose", "debug"])]
    silent: bool,
}

impl Cli {
    fn verbosity(&self) -> Verbosity {
        if self.silent {
            Verbosity::Silent
        } else if self.debug {
            Verbosity::Debug
        } else if self.verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }

    /// Builds the effective configuration: flags over file over defaults.
    fn build_config(&self) -> s3gc::Result<GcConfig> {
        let mut config = match &self.config {
            Some(path) => GcConfig::load_from_file(path)?,
            None => GcConfig::load_default(),
        };

        if let Some(host) = &self.ch_host {
            config.clickhouse.host = host.clone();
        }
        if let Some(port) = self.ch_port {
            config.clickhouse.port = port;
        }
        if let Some(user) = &self.ch_user {
            config.clickhouse.user = user.clone();
        }
        if let Some(password) = &self.ch_password {
            config.clickhouse.password = password.clone();
        }
        if self.ch_secure {
            config.clickhouse.secure = true;
        }
        if let Some(endpoint) = &self.s3_endpoint {
            config.s3.endpoint = endpoint.clone();
        }
        if let Some(bucket) = &self.s3_bucket {
            config.s3.bucket = bucket.clone();
        }
        if let Some(access_key) = &self.s3_access_key {
            config.s3.access_key = access_key.clone();
        }
        if let Some(secret_key) = &self.s3_secret_key {
            config.s3.secret_key = secret_key.clone();
        }
        if let Some(region) = &self.s3_region {
            config.s3.region = region.clone();
        }
        if let Some(prefix) = &self.s3_prefix {
            config.s3.prefix = prefix.clone();
        }
        if let Some(disk) = &self.disk {
            config.disk_name = disk.clone();
        }
        if let Some(table_prefix) = &self.table_prefix {
            config.table_prefix = table_prefix.clone();
        }
        if self.create_namespace {
            config.create_namespace = true;
        }
        if self.recreate_table {
            config.recreate_table = true;
        }
        if let Some(cluster) = &self.cluster {
            config.cluster = Some(cluster.clone());
        }
        if let Some(samples) = self.samples {
            config.samples = samples;
        }
        if let Some(age_hours) = self.age_hours {
            config.age_hours = age_hours;
        }
        if let Some(batch) = self.collect_batch_size {
            config.collect_batch_size = batch;
        }
        if let Some(rows) = self.sweep_block_rows {
            config.sweep_block_rows = rows;
        }
        config.total = self.total.or(config.total);
        config.collect_after = self.collect_after.clone().or(config.collect_after.take());
        config.use_after = self.use_after.clone().or(config.use_after.take());
        config.use_total = self.use_total.or(config.use_total);
        if self.dry_run {
            config.dry_run = true;
        }
        if self.keep_data {
            config.keep_data = true;
        }
        if self.collect_only {
            config.collect_only = true;
        }
        if self.use_collected {
            config.use_collected = true;
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    observability::init_logging(cli.verbosity());

    let config = match cli.build_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("s3gc: {e}");
            return ExitCode::FAILURE;
        },
    };

    match GcSession::new(config).run() {
        Ok(outcome) => {
            if !cli.silent {
                let summary = outcome.summary();
                if !summary.is_empty() {
                    println!("{summary}");
                }
            }
            // An operator decline is a clean exit, same as a completed run.
            ExitCode::SUCCESS
        },
        Err(e) => {
            tracing::error!(error = %e, "session failed");
            eprintln!("s3gc: {e}");
            ExitCode::FAILURE
        },
    }
}
