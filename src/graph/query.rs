//! Graph query layer (C13, §4.13): the read operations served over HTTP,
//! each capped, cancelable, and bounded by a per-call timeout.

use sqlx::PgPool;
use std::time::Duration;
use tokio::time::timeout;

use crate::db::models::{Bundle, GraphLinkRow, GraphNodeRow};
use crate::error::{AppError, AppResult};
use crate::graph::types::{decode_cursor, encode_cursor, GraphLink, GraphNode, GraphPayload};

pub struct GraphQueryLayer {
    pool: PgPool,
    query_timeout: Duration,
}

#[derive(Debug, Default)]
pub struct GraphQueryParams {
    pub max_nodes: i64,
    pub max_links: i64,
    pub types: Option<Vec<String>>,
    pub with_positions: bool,
}

fn row_to_node(row: GraphNodeRow, with_positions: bool) -> GraphNode {
    GraphNode {
        id: row.id,
        name: row.name,
        val: row.val.parse().unwrap_or(0.0),
        node_type: row.r#type,
        pos_x: if with_positions { row.pos_x } else { None },
        pos_y: if with_positions { row.pos_y } else { None },
        pos_z: if with_positions { row.pos_z } else { None },
    }
}

fn row_to_link(row: GraphLinkRow) -> GraphLink {
    GraphLink { id: row.id, source: row.source, target: row.target, val: row.val }
}

impl GraphQueryLayer {
    pub fn new(pool: PgPool, query_timeout: Duration) -> Self {
        Self { pool, query_timeout }
    }

    async fn with_timeout<T>(&self, fut: impl std::future::Future<Output = AppResult<T>>) -> AppResult<T> {
        timeout(self.query_timeout, fut)
            .await
            .map_err(|_| AppError::GraphTimeout)?
    }

    /// §4.13 op 1: top `max_nodes` by weight (filtered by type), links
    /// whose endpoints are both selected, deterministic `weight DESC, id
    /// ASC` tie-break. Weight is `max(val, degree_in_selected_subgraph)`
    /// (§4.9) — a node with few `val` points but many edges inside the
    /// selected set still ranks up.
    pub async fn get_graph(&self, params: GraphQueryParams) -> AppResult<GraphPayload> {
        self.with_timeout(async {
            let max_nodes = params.max_nodes.clamp(1, 50_000);
            let max_links = params.max_links.clamp(1, 50_000);

            let rows = match &params.types {
                Some(types) => {
                    sqlx::query_as!(
                        GraphNodeRow,
                        r#"
                        SELECT id, name, val, type, pos_x, pos_y, pos_z
                        FROM graph_nodes n
                        WHERE type = ANY($1)
                        ORDER BY GREATEST(
                            val::float8,
                            (
                                SELECT count(*)::float8
                                FROM graph_links l
                                WHERE (l.source_node_id = n.id OR l.target_node_id = n.id)
                                  AND l.source_node_id IN (SELECT id FROM graph_nodes WHERE type = ANY($1))
                                  AND l.target_node_id IN (SELECT id FROM graph_nodes WHERE type = ANY($1))
                            )
                        ) DESC, id ASC
                        LIMIT $2
                        "#,
                        types,
                        max_nodes,
                    )
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as!(
                        GraphNodeRow,
                        r#"
                        SELECT id, name, val, type, pos_x, pos_y, pos_z
                        FROM graph_nodes n
                        ORDER BY GREATEST(
                            val::float8,
                            (SELECT count(*)::float8 FROM graph_links l WHERE l.source_node_id = n.id OR l.target_node_id = n.id)
                        ) DESC, id ASC
                        LIMIT $1
                        "#,
                        max_nodes,
                    )
                    .fetch_all(&self.pool)
                    .await?
                }
            };

            let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
            let links = sqlx::query_as!(
                GraphLinkRow,
                r#"
                SELECT id, source_node_id as source, target_node_id as target, val
                FROM graph_links
                WHERE source_node_id = ANY($1) AND target_node_id = ANY($1)
                ORDER BY val DESC NULLS LAST, id ASC
                LIMIT $2
                "#,
                &ids,
                max_links,
            )
            .fetch_all(&self.pool)
            .await?;

            Ok(GraphPayload {
                nodes: rows.into_iter().map(|r| row_to_node(r, params.with_positions)).collect(),
                links: links.into_iter().map(row_to_link).collect(),
                next_cursor: None,
            })
        })
        .await
    }

    /// §4.13 op 2: cursor pagination over `(weight, id)`, `weight =
    /// max(val, degree_in_selected_subgraph)` (§4.9) computed across the
    /// whole graph, since this operation carries no type/region filter to
    /// scope the selected set to.
    pub async fn get_graph_paginated(
        &self,
        cursor: Option<String>,
        page_size: i64,
        with_positions: bool,
    ) -> AppResult<GraphPayload> {
        self.with_timeout(async {
            let page_size = page_size.clamp(1, 50_000);
            let (after_weight, after_id) = match &cursor {
                Some(c) => {
                    let (w, id) = decode_cursor(c)
                        .ok_or_else(|| AppError::GraphInvalidParams("invalid cursor".into()))?;
                    (Some(w), Some(id))
                }
                None => (None, None),
            };

            let fetch_limit = page_size + 1;
            let rows = sqlx::query!(
                r#"
                WITH degrees AS (
                    SELECT id, count(*) AS degree
                    FROM (
                        SELECT source_node_id AS id FROM graph_links
                        UNION ALL
                        SELECT target_node_id AS id FROM graph_links
                    ) endpoints
                    GROUP BY id
                )
                SELECT n.id, n.name, n.val, n.type, n.pos_x, n.pos_y, n.pos_z,
                       GREATEST(n.val::float8, COALESCE(d.degree, 0)::float8) as "weight!"
                FROM graph_nodes n
                LEFT JOIN degrees d ON d.id = n.id
                WHERE ($1::float8 IS NULL)
                   OR (GREATEST(n.val::float8, COALESCE(d.degree, 0)::float8), n.id) < ($1::float8, $2::text)
                ORDER BY weight DESC, n.id ASC
                LIMIT $3
                "#,
                after_weight,
                after_id,
                fetch_limit,
            )
            .fetch_all(&self.pool)
            .await?;

            let has_more = rows.len() as i64 > page_size;
            let page: Vec<_> = rows.into_iter().take(page_size as usize).collect();

            let next_cursor = if has_more {
                page.last().map(|r| encode_cursor(r.weight, &r.id))
            } else {
                None
            };

            let ids: Vec<String> = page.iter().map(|r| r.id.clone()).collect();
            let links = sqlx::query_as!(
                GraphLinkRow,
                r#"
                SELECT id, source_node_id as source, target_node_id as target, val
                FROM graph_links
                WHERE source_node_id = ANY($1) AND target_node_id = ANY($1)
                "#,
                &ids,
            )
            .fetch_all(&self.pool)
            .await?;

            Ok(GraphPayload {
                nodes: page
                    .into_iter()
                    .map(|r| GraphNode {
                        id: r.id,
                        name: r.name,
                        val: r.val.parse().unwrap_or(0.0),
                        node_type: r.r#type,
                        pos_x: if with_positions { r.pos_x } else { None },
                        pos_y: if with_positions { r.pos_y } else { None },
                        pos_z: if with_positions { r.pos_z } else { None },
                    })
                    .collect(),
                links: links.into_iter().map(row_to_link).collect(),
                next_cursor,
            })
        })
        .await
    }

    /// §4.13 op 3: nodes whose position lies in the closed bounding box,
    /// ranked by `weight = max(val, degree_in_selected_subgraph)` (§4.9)
    /// with degree scoped to edges that stay inside the box.
    /// Positions are always included regardless of `with_positions`.
    pub async fn get_region(
        &self,
        bbox: (f64, f64, f64, f64, f64, f64),
        max_nodes: i64,
        max_links: i64,
    ) -> AppResult<GraphPayload> {
        self.with_timeout(async {
            let (x_min, x_max, y_min, y_max, z_min, z_max) = bbox;
            let max_nodes = max_nodes.clamp(1, 50_000);
            let max_links = max_links.clamp(1, 50_000);

            let rows = sqlx::query_as!(
                GraphNodeRow,
                r#"
                SELECT id, name, val, type, pos_x, pos_y, pos_z
                FROM graph_nodes n
                WHERE pos_x BETWEEN $1 AND $2 AND pos_y BETWEEN $3 AND $4 AND pos_z BETWEEN $5 AND $6
                ORDER BY GREATEST(
                    val::float8,
                    (
                        SELECT count(*)::float8
                        FROM graph_links l
                        WHERE (l.source_node_id = n.id OR l.target_node_id = n.id)
                          AND l.source_node_id IN (
                              SELECT id FROM graph_nodes
                              WHERE pos_x BETWEEN $1 AND $2 AND pos_y BETWEEN $3 AND $4 AND pos_z BETWEEN $5 AND $6
                          )
                          AND l.target_node_id IN (
                              SELECT id FROM graph_nodes
                              WHERE pos_x BETWEEN $1 AND $2 AND pos_y BETWEEN $3 AND $4 AND pos_z BETWEEN $5 AND $6
                          )
                    )
                ) DESC, id ASC
                LIMIT $7
                "#,
                x_min,
                x_max,
                y_min,
                y_max,
                z_min,
                z_max,
                max_nodes,
            )
            .fetch_all(&self.pool)
            .await?;

            let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
            let links = sqlx::query_as!(
                GraphLinkRow,
                r#"
                SELECT id, source_node_id as source, target_node_id as target, val
                FROM graph_links
                WHERE source_node_id = ANY($1) AND target_node_id = ANY($1)
                LIMIT $2
                "#,
                &ids,
                max_links,
            )
            .fetch_all(&self.pool)
            .await?;

            Ok(GraphPayload {
                nodes: rows.into_iter().map(|r| row_to_node(r, true)).collect(),
                links: links.into_iter().map(row_to_link).collect(),
                next_cursor: None,
            })
        })
        .await
    }

    /// §4.13 op 4: community supernodes and inter-community links.
    pub async fn get_overview(
        &self,
        max_nodes: i64,
        max_links: i64,
        with_positions: bool,
    ) -> AppResult<GraphPayload> {
        self.with_timeout(async {
            let max_nodes = max_nodes.clamp(1, 50_000);
            let max_links = max_links.clamp(1, 50_000);

            let communities = sqlx::query!(
                r#"
                SELECT id, label, size
                FROM communities
                ORDER BY size DESC, id ASC
                LIMIT $1
                "#,
                max_nodes,
            )
            .fetch_all(&self.pool)
            .await?;

            let nodes = communities
                .iter()
                .map(|c| GraphNode {
                    id: format!("community_{}", c.id),
                    name: c.label.clone(),
                    val: c.size as f64,
                    node_type: "community".to_string(),
                    pos_x: None,
                    pos_y: None,
                    pos_z: None,
                })
                .collect::<Vec<_>>();

            let bundles = sqlx::query_as!(
                Bundle,
                r#"
                SELECT source_community_id, target_community_id, weight, avg_strength, control_x, control_y, control_z
                FROM bundles
                ORDER BY weight DESC
                LIMIT $1
                "#,
                max_links,
            )
            .fetch_all(&self.pool)
            .await?;

            let links = bundles
                .into_iter()
                .enumerate()
                .map(|(i, b)| GraphLink {
                    id: i as i64,
                    source: format!("community_{}", b.source_community_id),
                    target: format!("community_{}", b.target_community_id),
                    val: Some(b.weight as f64),
                })
                .collect();

            let _ = with_positions; // overview never carries node positions
            Ok(GraphPayload { nodes, links, next_cursor: None })
        })
        .await
    }

    /// §4.13 op 5: full membership and induced links for one community,
    /// ranked by `weight = max(val, degree_in_selected_subgraph)` (§4.9)
    /// with degree scoped to the community's own induced subgraph.
    pub async fn get_community_subgraph(
        &self,
        community_id: i64,
        max_nodes: i64,
        max_links: i64,
        with_positions: bool,
    ) -> AppResult<GraphPayload> {
        self.with_timeout(async {
            let max_nodes = max_nodes.clamp(1, 50_000);
            let max_links = max_links.clamp(1, 50_000);

            let rows = sqlx::query_as!(
                GraphNodeRow,
                r#"
                SELECT n.id, n.name, n.val, n.type, n.pos_x, n.pos_y, n.pos_z
                FROM graph_nodes n
                JOIN community_members m ON m.node_id = n.id
                WHERE m.community_id = $1
                ORDER BY GREATEST(
                    n.val::float8,
                    (
                        SELECT count(*)::float8
                        FROM graph_links l
                        WHERE (l.source_node_id = n.id OR l.target_node_id = n.id)
                          AND l.source_node_id IN (SELECT node_id FROM community_members WHERE community_id = $1)
                          AND l.target_node_id IN (SELECT node_id FROM community_members WHERE community_id = $1)
                    )
                ) DESC, n.id ASC
                LIMIT $2
                "#,
                community_id,
                max_nodes,
            )
            .fetch_all(&self.pool)
            .await?;

            if rows.is_empty() {
                return Err(AppError::ResourceNotFound(format!("community {community_id}")));
            }

            let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
            let links = sqlx::query_as!(
                GraphLinkRow,
                r#"
                SELECT id, source_node_id as source, target_node_id as target, val
                FROM graph_links
                WHERE source_node_id = ANY($1) AND target_node_id = ANY($1)
                LIMIT $2
                "#,
                &ids,
                max_links,
            )
            .fetch_all(&self.pool)
            .await?;

            Ok(GraphPayload {
                nodes: rows.into_iter().map(|r| row_to_node(r, with_positions)).collect(),
                links: links.into_iter().map(row_to_link).collect(),
                next_cursor: None,
            })
        })
        .await
    }

    /// §4.13 op 6: bundle rows above `min_weight`, descending weight.
    pub async fn get_bundles(&self, min_weight: i64) -> AppResult<Vec<Bundle>> {
        self.with_timeout(async {
            let bundles = sqlx::query_as!(
                Bundle,
                r#"
                SELECT source_community_id, target_community_id, weight, avg_strength, control_x, control_y, control_z
                FROM bundles
                WHERE weight >= $1
                ORDER BY weight DESC
                "#,
                min_weight,
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(bundles)
        })
        .await
    }

    /// §4.13 op 7: current precalc version, node/link totals.
    pub async fn get_version(&self) -> AppResult<(i64, i64, i64)> {
        self.with_timeout(async {
            let row = sqlx::query!(
                "SELECT version_id, total_nodes, total_links FROM precalc_state WHERE singleton = true",
            )
            .fetch_one(&self.pool)
            .await?;
            Ok((row.version_id, row.total_nodes, row.total_links))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_clamp_to_hard_caps() {
        let p = GraphQueryParams { max_nodes: 1_000_000, max_links: 1_000_000, ..Default::default() };
        assert_eq!(p.max_nodes.clamp(1, 50_000), 50_000);
        assert_eq!(p.max_links.clamp(1, 50_000), 50_000);
    }
}
