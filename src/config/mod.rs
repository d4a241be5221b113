//! Configuration management.
//!
//! Settings come from three layers, highest precedence first: CLI flags
//! (which also read `S3GC_*` environment variables via clap), an optional
//! TOML config file, and built-in defaults. Validation runs once, before
//! any I/O, so bad identifiers or inconsistent flags never reach a service.

use crate::query::{TableName, validate_identifier};
use crate::{Error, Result};
use serde::Deserialize;

/// ClickHouse connection settings.
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    /// Host to connect to.
    pub host: String,
    /// HTTP interface port.
    pub port: u16,
    /// User name.
    pub user: String,
    /// Password.
    pub password: String,
    /// Use HTTPS.
    pub secure: bool,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8123,
            user: "default".to_string(),
            password: String::new(),
            secure: false,
        }
    }
}

/// S3 connection settings.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Endpoint URL, e.g. `http://127.0.0.1:9001`.
    pub endpoint: String,
    /// Bucket name.
    pub bucket: String,
    /// Access key.
    pub access_key: String,
    /// Secret key.
    pub secret_key: String,
    /// Region for request signing.
    pub region: String,
    /// Key prefix the ClickHouse disk writes under.
    pub prefix: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9001".to_string(),
            bucket: "root".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            region: "us-east-1".to_string(),
            prefix: "data/".to_string(),
        }
    }
}

/// Full configuration for one garbage-collection session.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// ClickHouse connection settings.
    pub clickhouse: ClickHouseConfig,
    /// S3 connection settings.
    pub s3: S3Config,
    /// ClickHouse disk name whose objects are being collected.
    pub disk_name: String,
    /// Prefix for the inventory table name; may carry one `db.` namespace.
    pub table_prefix: String,
    /// Allow creating the namespace (database) for a namespaced table name.
    pub create_namespace: bool,
    /// Drop and recreate the inventory table for a fresh generation.
    pub recreate_table: bool,
    /// Consider an object unused only if no replica of this cluster
    /// references it.
    pub cluster: Option<String>,
    /// Shard count; fixed for the lifetime of one table generation.
    pub samples: u32,
    /// Only process objects older than this many hours (0 disables the
    /// gate).
    pub age_hours: u64,
    /// Rows per inventory insert batch.
    pub collect_batch_size: usize,
    /// Rows per streamed candidate block during the sweep.
    pub sweep_block_rows: usize,
    /// Maximum number of objects to collect this run.
    pub total: Option<u64>,
    /// Resume the listing after this object name.
    pub collect_after: Option<String>,
    /// Resume the sweep after this object name.
    pub use_after: Option<String>,
    /// Maximum number of collected objects to sweep this run.
    pub use_total: Option<u64>,
    /// Compute but do not delete or mutate anything.
    pub dry_run: bool,
    /// Keep the inventory table contents after the sweep.
    pub keep_data: bool,
    /// Only collect; skip reconciliation.
    pub collect_only: bool,
    /// The inventory was already collected by a prior run; skip collection.
    pub use_collected: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            clickhouse: ClickHouseConfig::default(),
            s3: S3Config::default(),
            disk_name: "s3".to_string(),
            table_prefix: "s3objects_for_".to_string(),
            create_namespace: false,
            recreate_table: false,
            cluster: None,
            samples: 4,
            age_hours: 0,
            collect_batch_size: 1024,
            sweep_block_rows: 1024,
            total: None,
            collect_after: None,
            use_after: None,
            use_total: None,
            dry_run: false,
            keep_data: false,
            collect_only: false,
            use_collected: false,
        }
    }
}

impl GcConfig {
    /// Validates the configuration before any I/O.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on invalid identifiers, a zero
    /// shard count or batch size, contradictory phase flags, or a
    /// namespaced table prefix without the namespace-creation flag.
    pub fn validate(&self) -> Result<()> {
        let table = TableName::new(&self.table_prefix, &self.disk_name)?;
        if let Some(cluster) = &self.cluster {
            validate_identifier("cluster name", cluster)?;
        }
        if self.samples == 0 {
            return Err(Error::Configuration(
                "samples must be at least 1".to_string(),
            ));
        }
        if self.collect_batch_size == 0 || self.sweep_block_rows == 0 {
            return Err(Error::Configuration(
                "batch sizes must be at least 1".to_string(),
            ));
        }
        if self.collect_only && self.use_collected {
            return Err(Error::Configuration(
                "--collect-only with --use-collected leaves nothing to do".to_string(),
            ));
        }
        if table.namespace().is_some() && !self.use_collected && !self.create_namespace {
            return Err(Error::Configuration(format!(
                "table prefix '{}' is namespaced; pass --create-namespace to allow creating it",
                self.table_prefix
            )));
        }
        Ok(())
    }

    /// Returns the validated inventory table name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the prefix or disk name is
    /// invalid (already caught by [`Self::validate`] in normal flow).
    pub fn table_name(&self) -> Result<TableName> {
        TableName::new(&self.table_prefix, &self.disk_name)
    }

    /// Returns the age gate, `None` when disabled.
    #[must_use]
    pub const fn age_gate(&self) -> Option<u64> {
        if self.age_hours == 0 {
            None
        } else {
            Some(self.age_hours)
        }
    }

    /// Loads configuration from a TOML file and applies it over defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the file cannot be read or
    /// parsed.
    pub fn load_from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let file: ConfigFile = toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!("cannot parse config file {}: {e}", path.display()))
        })?;
        Ok(Self::from_config_file(file))
    }

    /// Loads configuration from the default location, falling back to
    /// defaults when no file exists.
    #[must_use]
    pub fn load_default() -> Self {
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default();
        };
        let config_path = base_dirs.config_dir().join("s3gc").join("config.toml");
        if config_path.exists() {
            if let Ok(config) = Self::load_from_file(&config_path) {
                return config;
            }
        }
        Self::default()
    }

    fn from_config_file(file: ConfigFile) -> Self {
        let mut config = Self::default();
        if let Some(ch) = file.clickhouse {
            if let Some(host) = ch.host {
                config.clickhouse.host = host;
            }
            if let Some(port) = ch.port {
                config.clickhouse.port = port;
            }
            if let Some(user) = ch.user {
                config.clickhouse.user = user;
            }
            if let Some(password) = ch.password {
                config.clickhouse.password = password;
            }
            if let Some(secure) = ch.secure {
                config.clickhouse.secure = secure;
            }
        }
        if let Some(s3) = file.s3 {
            if let Some(endpoint) = s3.endpoint {
                config.s3.endpoint = endpoint;
            }
            if let Some(bucket) = s3.bucket {
                config.s3.bucket = bucket;
            }
            if let Some(access_key) = s3.access_key {
                config.s3.access_key = access_key;
            }
            if let Some(secret_key) = s3.secret_key {
                config.s3.secret_key = secret_key;
            }
            if let Some(region) = s3.region {
                config.s3.region = region;
            }
            if let Some(prefix) = s3.prefix {
                config.s3.prefix = prefix;
            }
        }
        if let Some(gc) = file.gc {
            if let Some(disk_name) = gc.disk_name {
                config.disk_name = disk_name;
            }
            if let Some(table_prefix) = gc.table_prefix {
                config.table_prefix = table_prefix;
            }
            if let Some(cluster) = gc.cluster {
                config.cluster = Some(cluster);
            }
            if let Some(samples) = gc.samples {
                config.samples = samples;
            }
            if let Some(age_hours) = gc.age_hours {
                config.age_hours = age_hours;
            }
            if let Some(batch) = gc.collect_batch_size {
                config.collect_batch_size = batch;
            }
            if let Some(rows) = gc.sweep_block_rows {
                config.sweep_block_rows = rows;
            }
        }
        config
    }
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// `[clickhouse]` section.
    pub clickhouse: Option<ConfigFileClickHouse>,
    /// `[s3]` section.
    pub s3: Option<ConfigFileS3>,
    /// `[gc]` section.
    pub gc: Option<ConfigFileGc>,
}

/// ClickHouse section in the config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileClickHouse {
    /// Host.
    pub host: Option<String>,
    /// Port.
    pub port: Option<u16>,
    /// User name.
    pub user: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Use HTTPS.
    pub secure: Option<bool>,
}

/// S3 section in the config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileS3 {
    /// Endpoint URL.
    pub endpoint: Option<String>,
    /// Bucket name.
    pub bucket: Option<String>,
    /// Access key.
    pub access_key: Option<String>,
    /// Secret key.
    pub secret_key: Option<String>,
    /// Region.
    pub region: Option<String>,
    /// Key prefix.
    pub prefix: Option<String>,
}

/// GC tuning section in the config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileGc {
    /// Disk name.
    pub disk_name: Option<String>,
    /// Table prefix.
    pub table_prefix: Option<String>,
    /// Cluster name.
    pub cluster: Option<String>,
    /// Shard count.
    pub samples: Option<u32>,
    /// Age gate in hours.
    pub age_hours: Option<u64>,
    /// Collect batch size.
    pub collect_batch_size: Option<usize>,
    /// Sweep block rows.
    pub sweep_block_rows: Option<usize>,
}
