use clap::Parser;

/// Connection arguments for the durable store (PostgreSQL + PostGIS).
#[derive(Parser, Debug, Clone)]
pub struct PostgresArgs {
    #[arg(long, env = "POSTGRES_HOST", default_value = "localhost")]
    pub postgres_host: String,

    #[arg(long, env = "POSTGRES_PORT", default_value_t = 5432)]
    pub postgres_port: u16,

    #[arg(long, env = "POSTGRES_DATABASE", default_value = "aislink")]
    pub postgres_database: String,

    #[arg(long, env = "POSTGRES_USERNAME", default_value = "aislink")]
    pub postgres_username: String,

    #[arg(long, env = "POSTGRES_PASSWORD")]
    pub postgres_password: Option<String>,

    /// PEM-encoded CA certificate bundle; when unset, connect over TLS using
    /// the platform's native trust store.
    #[arg(long, env = "POSTGRES_CA_CERT")]
    pub postgres_ca_cert: Option<String>,

    #[arg(long, env = "POSTGRES_SSL_MODE", default_value = "prefer")]
    pub postgres_ssl_mode: String,
}

/// Operator-configurable pipeline tuning knobs. All optional; every field
/// carries the documented default.
#[derive(Parser, Debug, Clone)]
pub struct PipelineArgs {
    #[arg(long, env = "TILE_ZOOM", default_value_t = 12)]
    pub tile_zoom: u8,

    #[arg(long, env = "VESSEL_TTL_SECONDS", default_value_t = 120)]
    pub vessel_ttl_seconds: u64,

    #[arg(long, env = "BATCH_SYNC_INTERVAL_MS", default_value_t = 5000)]
    pub batch_sync_interval_ms: u64,

    #[arg(long, env = "BATCH_SYNC_SIZE", default_value_t = 1000)]
    pub batch_sync_size: usize,

    #[arg(long, env = "INGEST_FLUSH_MS", default_value_t = 1000)]
    pub ingest_flush_ms: u64,

    #[arg(long, env = "DISPATCH_FLUSH_MS", default_value_t = 500)]
    pub dispatch_flush_ms: u64,

    #[arg(long, env = "HEARTBEAT_MS", default_value_t = 30_000)]
    pub heartbeat_ms: u64,

    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,
}

/// Credentials and filter for the upstream AIS feed.
#[derive(Parser, Debug, Clone)]
pub struct AisStreamArgs {
    #[arg(long, env = "AISSTREAM_API_KEY")]
    pub aisstream_api_key: String,

    /// `"lat1,lon1,lat2,lon2;…"` — one or more bounding boxes, semicolon
    /// separated. Omitted entirely from the upstream subscription if unset.
    #[arg(long, env = "AISSTREAM_BBOX")]
    pub aisstream_bbox: Option<String>,

    #[arg(
        long,
        env = "AISSTREAM_URL",
        default_value = "wss://stream.aisstream.io/v0/stream"
    )]
    pub aisstream_url: String,
}

impl AisStreamArgs {
    /// Parses `AISSTREAM_BBOX` into `[[lat1,lon1],[lat2,lon2]], …` pairs for
    /// the upstream subscription payload. Malformed entries are dropped with
    /// a warning rather than failing boot — a filter typo shouldn't prevent
    /// ingesting the unfiltered feed.
    pub fn bounding_boxes(&self) -> Vec<[[f64; 2]; 2]> {
        let Some(raw) = &self.aisstream_bbox else {
            return Vec::new();
        };
        raw.split(';')
            .filter(|s| !s.trim().is_empty())
            .filter_map(|entry| {
                let nums: Vec<f64> = entry
                    .split(',')
                    .filter_map(|n| n.trim().parse().ok())
                    .collect();
                if nums.len() == 4 {
                    Some([[nums[0], nums[1]], [nums[2], nums[3]]])
                } else {
                    tracing::warn!(entry, "ignoring malformed AISSTREAM_BBOX entry");
                    None
                }
            })
            .collect()
    }
}
