//! Diff broadcaster (C15, §4.15): per-connection incremental graph diffs
//! over a websocket, with HTTP fallback endpoints for non-streaming
//! clients. The send-with-timeout idiom here mirrors the observability
//! server's websocket handler.

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, timeout};
use tracing::warn;

use crate::db::models::{GraphLinkRow, GraphNodeRow};
use crate::error::AppResult;
use crate::graph::types::{GraphLink, GraphNode};

const CLIENT_MESSAGE_MAX_BYTES: usize = 512;
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Version { version_id: i64, node_count: i64, link_count: i64 },
    Diff(DiffPayload),
    Ping,
    Advisory { message: String },
}

#[derive(Debug, Serialize)]
pub struct DiffPayload {
    pub action: DiffAction,
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
    pub version_id: i64,
}

#[derive(Debug, Serialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum DiffAction {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Version { version_id: i64 },
    Ping,
}

pub struct DiffBroadcaster {
    pool: PgPool,
    version_rx: watch::Receiver<i64>,
}

impl DiffBroadcaster {
    pub fn new(pool: PgPool, version_rx: watch::Receiver<i64>) -> Self {
        Self { pool, version_rx }
    }

    /// Drives one websocket connection end to end: initial version
    /// announce, then poll-and-diff plus heartbeats until the client
    /// disconnects.
    pub async fn serve(&self, mut socket: WebSocket) {
        let mut known_version = match self.current_version_snapshot().await {
            Ok((v, nodes, links)) => {
                if send_with_timeout(
                    &mut socket,
                    &ServerMessage::Version { version_id: v, node_count: nodes, link_count: links },
                )
                .await
                .is_err()
                {
                    return;
                }
                v
            }
            Err(e) => {
                warn!(error = %e, "failed to read initial precalc state");
                return;
            }
        };

        let mut version_rx = self.version_rx.clone();
        let mut poll = interval(POLL_INTERVAL);
        let mut heartbeat = interval(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.push_diff_if_newer(&mut socket, &mut known_version).await {
                        warn!(error = %e, "diff push failed");
                        return;
                    }
                }
                _ = heartbeat.tick() => {
                    if send_with_timeout(&mut socket, &ServerMessage::Ping).await.is_err() {
                        return;
                    }
                }
                changed = version_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if let Err(e) = self.push_diff_if_newer(&mut socket, &mut known_version).await {
                        warn!(error = %e, "diff push failed");
                        return;
                    }
                }
                msg = socket.recv() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if text.len() > CLIENT_MESSAGE_MAX_BYTES {
                                continue;
                            }
                            if let Ok(ClientMessage::Version { version_id }) = serde_json::from_str(&text) {
                                known_version = version_id;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return,
                        Some(Err(_)) => return,
                        _ => {}
                    }
                }
            }
        }
    }

    async fn push_diff_if_newer(&self, socket: &mut WebSocket, known_version: &mut i64) -> AppResult<()> {
        let (latest, _, _) = self.current_version_snapshot().await?;
        if latest <= *known_version {
            return Ok(());
        }

        match self.compute_diff(*known_version).await? {
            Some(payload) => {
                let _ = send_with_timeout(socket, &ServerMessage::Diff(payload)).await;
            }
            None => {
                // Gap too large to diff cheaply (e.g. spans a full rebuild);
                // tell the client to refetch instead of enumerating everything.
                let _ = send_with_timeout(
                    socket,
                    &ServerMessage::Advisory { message: "version gap too large, refetch".into() },
                )
                .await;
            }
        }
        *known_version = latest;
        Ok(())
    }

    async fn current_version_snapshot(&self) -> AppResult<(i64, i64, i64)> {
        let row = sqlx::query!(
            "SELECT version_id, total_nodes, total_links FROM precalc_state WHERE singleton = true",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((row.version_id, row.total_nodes, row.total_links))
    }

    /// Computes the diff since `since_version`. A full rebuild between
    /// `since_version` and the latest version makes an incremental diff
    /// meaningless (everything changed), so `None` signals the caller to
    /// fall back to an advisory instead.
    pub async fn compute_diff(&self, since_version: i64) -> AppResult<Option<DiffPayload>> {
        let full_rebuild_since = sqlx::query_scalar!(
            "SELECT exists(SELECT 1 FROM precalc_versions WHERE version_id > $1 AND full_rebuild = true)",
            since_version,
        )
        .fetch_one(&self.pool)
        .await?
        .unwrap_or(true);

        if full_rebuild_since {
            return Ok(None);
        }

        let since_at: Option<DateTime<Utc>> = sqlx::query_scalar!(
            "SELECT created_at FROM precalc_versions WHERE version_id = $1",
            since_version,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(since_at) = since_at else { return Ok(None) };

        let latest_version = sqlx::query_scalar!("SELECT version_id FROM precalc_state WHERE singleton = true")
            .fetch_one(&self.pool)
            .await?;

        let node_rows = sqlx::query_as!(
            GraphNodeRow,
            "SELECT id, name, val, type, pos_x, pos_y, pos_z FROM graph_nodes WHERE updated_at > $1",
            since_at,
        )
        .fetch_all(&self.pool)
        .await?;

        let link_rows = sqlx::query_as!(
            GraphLinkRow,
            "SELECT id, source_node_id as source, target_node_id as target, val FROM graph_links WHERE updated_at > $1",
            since_at,
        )
        .fetch_all(&self.pool)
        .await?;

        let nodes = node_rows
            .into_iter()
            .map(|r| GraphNode {
                id: r.id,
                name: r.name,
                val: r.val.parse().unwrap_or(0.0),
                node_type: r.r#type,
                pos_x: r.pos_x,
                pos_y: r.pos_y,
                pos_z: r.pos_z,
            })
            .collect();

        let links = link_rows
            .into_iter()
            .map(|r| GraphLink { id: r.id, source: r.source, target: r.target, val: r.val })
            .collect();

        Ok(Some(DiffPayload { action: DiffAction::Update, nodes, links, version_id: latest_version }))
    }
}

async fn send_with_timeout(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), ()> {
    let Ok(text) = serde_json::to_string(message) else { return Err(()) };
    match timeout(SEND_TIMEOUT, socket.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(()),
        Err(_) => {
            warn!("websocket send timed out");
            Err(())
        }
    }
}
