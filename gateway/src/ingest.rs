//! Upstream ingest client: connects to the AIS feed, subscribes, and turns
//! accepted position reports into `store.put_vessel` calls plus a local
//! dirty-tile set drained on a fixed cadence into the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use aislink_common::args::AisStreamArgs;
use aislink_common::backoff::Backoff;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rustc_hash::FxHashSet;
use serde::Deserialize;
use serde_json::json;
use tilemath::TileKey;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::store::{Store, VesselRecord};

#[derive(Debug, Deserialize, Default)]
struct PositionReport {
    #[serde(rename = "UserID")]
    user_id: Option<u64>,
    #[serde(rename = "Latitude")]
    latitude: Option<f64>,
    #[serde(rename = "Longitude")]
    longitude: Option<f64>,
    #[serde(rename = "Cog")]
    cog: Option<f64>,
    #[serde(rename = "Sog")]
    sog: Option<f64>,
    #[serde(rename = "TrueHeading")]
    true_heading: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
struct MetaData {
    #[serde(rename = "MMSI")]
    mmsi: Option<u64>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    time_utc: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct InboundMessage {
    #[serde(rename = "Message")]
    message: Option<InboundBody>,
    #[serde(rename = "MetaData")]
    meta_data: Option<MetaData>,
}

#[derive(Debug, Deserialize, Default)]
struct InboundBody {
    #[serde(rename = "PositionReport")]
    position_report: Option<PositionReport>,
}

/// A validated, fully-merged position ready for `store.put_vessel`.
struct VesselPosition {
    mmsi: u64,
    lat: f64,
    lon: f64,
    cog: Option<f64>,
    sog: Option<f64>,
    heading: Option<u16>,
    timestamp: DateTime<Utc>,
}

fn parse_position(raw: &str) -> Option<VesselPosition> {
    let msg: InboundMessage = serde_json::from_str(raw).ok()?;
    let report = msg.message.and_then(|m| m.position_report)?;
    let meta = msg.meta_data.unwrap_or_default();

    let mmsi = report.user_id.or(meta.mmsi)?;
    let lat = report.latitude.or(meta.latitude)?;
    let lon = report.longitude.or(meta.longitude)?;

    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }

    let heading = report.true_heading.filter(|&h| h != 511);
    let timestamp = meta
        .time_utc
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(VesselPosition {
        mmsi,
        lat,
        lon,
        cog: report.cog,
        sog: report.sog,
        heading,
        timestamp,
    })
}

fn subscription_message(args: &AisStreamArgs) -> Message {
    let boxes = args.bounding_boxes();
    let payload = if boxes.is_empty() {
        json!({
            "APIKey": args.aisstream_api_key,
            "FilterMessageTypes": ["PositionReport"],
        })
    } else {
        json!({
            "APIKey": args.aisstream_api_key,
            "FilterMessageTypes": ["PositionReport"],
            "BoundingBoxes": boxes,
        })
    };
    Message::Text(payload.to_string().into())
}

/// Runs the ingest state machine until `cancel` fires. Reconnects on every
/// socket error or close with exponential backoff, resetting the backoff on
/// each successful connection and suppressing reconnect entirely once
/// cancellation has been requested.
pub async fn run(
    args: AisStreamArgs,
    store: Arc<Store>,
    dispatcher: Arc<Dispatcher>,
    tile_zoom: u8,
    flush_interval: Duration,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::upstream_default();

    while !cancel.is_cancelled() {
        match run_session(&args, &store, &dispatcher, tile_zoom, flush_interval, &cancel).await {
            Ok(()) => {
                if cancel.is_cancelled() {
                    break;
                }
                backoff.reset();
                tracing::info!("upstream session ended cleanly, reconnecting");
            }
            Err(err) => {
                tracing::warn!(error = %err, "upstream session failed");
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        let delay = backoff.next_delay();
        tracing::info!(delay_ms = delay.as_millis() as u64, "reconnecting to upstream");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_session(
    args: &AisStreamArgs,
    store: &Arc<Store>,
    dispatcher: &Arc<Dispatcher>,
    tile_zoom: u8,
    flush_interval: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let (stream, _) = tokio_tungstenite::connect_async(&args.aisstream_url).await?;
    let (mut write, mut read) = stream.split();
    write.send(subscription_message(args)).await?;
    tracing::info!(url = %args.aisstream_url, "subscribed to upstream feed");

    let dirty: Mutex<FxHashSet<TileKey>> = Mutex::new(FxHashSet::default());
    let mut ticker = tokio::time::interval(flush_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                let drained: FxHashSet<TileKey> = {
                    let mut dirty = dirty.lock().await;
                    std::mem::take(&mut *dirty)
                };
                if !drained.is_empty() {
                    dispatcher.mark_dirty(drained);
                }
            }
            next = read.next() => {
                match next {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(pos) = parse_position(&text) {
                            let tile = tilemath::tile_of(pos.lat, pos.lon, tile_zoom);
                            let transition = store.put_vessel(VesselRecord {
                                mmsi: pos.mmsi,
                                lat: pos.lat,
                                lon: pos.lon,
                                cog: pos.cog,
                                sog: pos.sog,
                                heading: pos.heading,
                                timestamp: pos.timestamp,
                                tile,
                            });
                            let mut dirty = dirty.lock().await;
                            if let Some(old) = transition.old_tile {
                                dirty.insert(old);
                            }
                            dirty.insert(transition.new_tile);
                            crate::metrics::position_ingested();
                        } else {
                            crate::metrics::position_dropped();
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_lat_lon_from_metadata_when_position_report_omits_them() {
        let raw = r#"{
            "Message": {"PositionReport": {"UserID": 123456789, "Cog": 45.0, "Sog": 10.0, "TrueHeading": 511}},
            "MetaData": {"MMSI": 123456789, "latitude": 1.5, "longitude": 2.5, "time_utc": "2026-01-01T00:00:00Z"}
        }"#;
        let pos = parse_position(raw).unwrap();
        assert_eq!(pos.mmsi, 123456789);
        assert_eq!(pos.lat, 1.5);
        assert_eq!(pos.lon, 2.5);
        assert_eq!(pos.heading, None);
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        let raw = r#"{
            "Message": {"PositionReport": {"UserID": 1, "Latitude": 200.0, "Longitude": 0.0}},
            "MetaData": {}
        }"#;
        assert!(parse_position(raw).is_none());
    }

    #[test]
    fn rejects_missing_mmsi() {
        let raw = r#"{
            "Message": {"PositionReport": {"Latitude": 1.0, "Longitude": 1.0}},
            "MetaData": {}
        }"#;
        assert!(parse_position(raw).is_none());
    }

    #[test]
    fn subscription_message_omits_bounding_boxes_when_unset() {
        let args = AisStreamArgs {
            aisstream_api_key: "key".to_string(),
            aisstream_bbox: None,
            aisstream_url: "wss://example.invalid".to_string(),
        };
        let msg = subscription_message(&args);
        let text = msg.to_text().unwrap();
        assert!(!text.contains("BoundingBoxes"));
        assert!(text.contains("PositionReport"));
    }
}
