//! Durable store adapter (PostgreSQL + PostGIS) and the periodic batch
//! synchronizer that mirrors live state into it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use deadpool_postgres::Pool;
use tilemath::TileKey;
use tokio_util::sync::CancellationToken;

use crate::store::{Store, VesselRecord};

pub struct DurableStore {
    pool: Pool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UpsertStats {
    pub scanned: usize,
    pub upserted: usize,
    pub errors: usize,
    pub duration_ms: u64,
}

impl DurableStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(
                "CREATE EXTENSION IF NOT EXISTS postgis;
                 CREATE TABLE IF NOT EXISTS vessels_current (
                     mmsi BIGINT PRIMARY KEY,
                     geom geometry(Point, 4326) NOT NULL,
                     tile_z12 INTEGER NOT NULL,
                     lon DOUBLE PRECISION NOT NULL,
                     lat DOUBLE PRECISION NOT NULL,
                     cog DOUBLE PRECISION,
                     sog DOUBLE PRECISION,
                     heading INTEGER,
                     updated_at TIMESTAMPTZ NOT NULL,
                     created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                 );
                 CREATE INDEX IF NOT EXISTS vessels_current_tile_updated_idx
                     ON vessels_current (tile_z12, updated_at DESC);
                 CREATE INDEX IF NOT EXISTS vessels_current_geom_idx
                     ON vessels_current USING GIST (geom);
                 CREATE INDEX IF NOT EXISTS vessels_current_updated_idx
                     ON vessels_current (updated_at DESC);",
            )
            .await?;
        Ok(())
    }

    /// Bulk idempotent upsert keyed on `mmsi`, built as a single statement
    /// over `UNNEST` column arrays rather than one round trip per record.
    pub async fn upsert_batch(&self, records: &[VesselRecord]) -> anyhow::Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mmsi: Vec<i64> = records.iter().map(|r| r.mmsi as i64).collect();
        let lon: Vec<f64> = records.iter().map(|r| r.lon).collect();
        let lat: Vec<f64> = records.iter().map(|r| r.lat).collect();
        let cog: Vec<Option<f64>> = records.iter().map(|r| r.cog).collect();
        let sog: Vec<Option<f64>> = records.iter().map(|r| r.sog).collect();
        let heading: Vec<Option<i32>> = records.iter().map(|r| r.heading.map(i32::from)).collect();
        let tile_z12: Vec<i32> = records
            .iter()
            .map(|r| tile_z12_of(r.tile))
            .collect();
        let updated_at: Vec<chrono::DateTime<chrono::Utc>> =
            records.iter().map(|r| r.timestamp).collect();

        let client = self.pool.get().await?;
        let rows = client
            .execute(
                "INSERT INTO vessels_current (mmsi, geom, tile_z12, lon, lat, cog, sog, heading, updated_at)
                 SELECT mmsi, ST_SetSRID(ST_MakePoint(lon, lat), 4326), tile_z12, lon, lat, cog, sog, heading, updated_at
                 FROM UNNEST($1::bigint[], $2::double precision[], $3::double precision[], $4::integer[],
                              $5::double precision[], $6::double precision[], $7::integer[], $8::timestamptz[])
                     AS t(mmsi, lon, lat, tile_z12, cog, sog, heading, updated_at)
                 ON CONFLICT (mmsi) DO UPDATE SET
                     geom = EXCLUDED.geom,
                     tile_z12 = EXCLUDED.tile_z12,
                     lon = EXCLUDED.lon,
                     lat = EXCLUDED.lat,
                     cog = EXCLUDED.cog,
                     sog = EXCLUDED.sog,
                     heading = EXCLUDED.heading,
                     updated_at = EXCLUDED.updated_at",
                &[&mmsi, &lon, &lat, &tile_z12, &cog, &sog, &heading, &updated_at],
            )
            .await?;
        Ok(rows as usize)
    }
}

/// `tile_z12`'s wire definition is fixed at zoom 12 (`x * 4096 + y`)
/// regardless of the pipeline's configured `TILE_ZOOM`; a tile computed at
/// another zoom is reprojected down to 12 before packing.
fn tile_z12_of(tile: TileKey) -> i32 {
    let at_12 = if tile.z == 12 {
        tile
    } else {
        let scale = 2f64.powi(12 - i32::from(tile.z));
        TileKey::new(12, (tile.x as f64 * scale) as u32, (tile.y as f64 * scale) as u32)
    };
    (at_12.x * 4096 + at_12.y) as i32
}

pub struct BatchSynchronizer {
    store: Arc<Store>,
    durable: Arc<DurableStore>,
    batch_size: usize,
}

impl BatchSynchronizer {
    pub fn new(store: Arc<Store>, durable: Arc<DurableStore>, batch_size: usize) -> Self {
        Self { store, durable, batch_size }
    }

    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        let mut cursor = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    cursor = self.tick(cursor).await;
                }
            }
        }
    }

    async fn tick(&self, cursor: u64) -> u64 {
        let started = Instant::now();
        let (records, next_cursor) = self.store.scan(cursor, self.batch_size);
        let scanned = records.len();

        let stats = match self.durable.upsert_batch(&records).await {
            Ok(upserted) => UpsertStats {
                scanned,
                upserted,
                errors: 0,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            Err(err) => {
                tracing::warn!(error = %err, "batch sync upsert failed, retrying next tick");
                UpsertStats {
                    scanned,
                    upserted: 0,
                    errors: 1,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
        };
        tracing::debug!(
            scanned = stats.scanned,
            upserted = stats.upserted,
            errors = stats.errors,
            duration_ms = stats.duration_ms,
            "batch sync tick"
        );
        crate::metrics::batch_sync_tick(stats.scanned, stats.upserted, stats.errors, stats.duration_ms);

        next_cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_z12_of_passes_through_at_native_zoom() {
        let tile = TileKey::new(12, 3413, 1789);
        assert_eq!(tile_z12_of(tile), 3413 * 4096 + 1789);
    }

    #[test]
    fn tile_z12_of_reprojects_other_zooms_down_to_12() {
        let tile = TileKey::new(10, 853, 447); // one quarter of 3413/1789
        let packed = tile_z12_of(tile);
        assert_eq!(packed, (853 * 4) * 4096 + (447 * 4));
    }
}
