//! `/sse/db/:db/tables/:t/changes` changefeed endpoint (spec §4.8): an
//! `init` event immediately, `insert`/`update`/`delete` as they occur, a
//! bounded backlog while paused (cap 512, drop-newest once full), and a 20s
//! heartbeat that is either a `paused` event carrying the backlog size or a
//! bare `: ping` comment.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use guildnet_db::ChangefeedEvent;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::state::AppState;

const BACKLOG_CAP: usize = 512;
const HEARTBEAT: Duration = Duration::from_secs(20);

struct ActiveChangefeedGuard {
    gauge: prometheus_client::metrics::gauge::Gauge,
}

impl ActiveChangefeedGuard {
    fn new(gauge: prometheus_client::metrics::gauge::Gauge) -> Self {
        gauge.inc();
        Self { gauge }
    }
}

impl Drop for ActiveChangefeedGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

fn to_sse_event(event: &ChangefeedEvent) -> Event {
    Event::default()
        .event(serde_json::to_value(event.kind).unwrap_or_default().as_str().unwrap_or("update").to_string())
        .data(serde_json::to_string(event).unwrap_or_default())
}

fn paused_event(pending: usize) -> Event {
    let body = serde_json::json!({ "type": "paused", "pending": pending });
    Event::default().event("paused").data(body.to_string())
}

/// Drives the pause/backlog/heartbeat state machine over a raw
/// [`guildnet_db::Subscription`], emitting finished [`Event`]s onto `tx`.
async fn drive(
    mut subscription: guildnet_db::Subscription,
    paused: Arc<AtomicBool>,
    tx: mpsc::Sender<Event>,
) {
    let mut backlog: VecDeque<ChangefeedEvent> = VecDeque::new();
    let mut heartbeat = interval(HEARTBEAT);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            maybe_event = subscription.events.recv() => {
                let Some(event) = maybe_event else { break };
                if paused.load(Ordering::SeqCst) {
                    if backlog.len() < BACKLOG_CAP {
                        backlog.push_back(event);
                    }
                    continue;
                }
                while let Some(queued) = backlog.pop_front() {
                    if tx.send(to_sse_event(&queued)).await.is_err() {
                        subscription.cancel();
                        return;
                    }
                }
                if tx.send(to_sse_event(&event)).await.is_err() {
                    subscription.cancel();
                    return;
                }
            }
            _ = heartbeat.tick() => {
                let beat = if paused.load(Ordering::SeqCst) {
                    paused_event(backlog.len())
                } else {
                    Event::default().comment("ping")
                };
                if tx.send(beat).await.is_err() {
                    subscription.cancel();
                    return;
                }
            }
        }
    }
    debug!(msg = "changefeed subscription ended");
}

pub async fn changes(
    State(state): State<AppState>,
    Path((db_name, table_name)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: axum::http::HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let org_id = headers
        .get("x-org-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("default")
        .to_string();
    let paused = Arc::new(AtomicBool::new(
        query.get("pause").map(|v| v == "1" || v == "true").unwrap_or(false),
    ));

    let (tx, rx) = mpsc::channel(BACKLOG_CAP);
    match state.db.subscribe_table(&org_id, &db_name, &table_name).await {
        Ok(subscription) => {
            let guard = ActiveChangefeedGuard::new(state.metrics.active_changefeeds.clone());
            tokio::spawn(async move {
                let _guard = guard;
                drive(subscription, paused, tx).await;
            });
        }
        Err(e) => {
            let _ = tx
                .try_send(Event::default().event("error").data(e.to_string()));
        }
    }

    let stream = ReceiverStream::new(rx).map(Ok);
    Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT).text("ping"))
}
