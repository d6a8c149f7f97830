//! Force-directed layout engine (C10, §4.10).
//!
//! Same force model as the interactive cluster simulator this is grounded
//! on — inverse-square repulsion, center attraction, soft boundary
//! containment, velocity damping — run headless over plain `f64` positions
//! instead of `egui` types, and written back to the database rather than
//! drawn.

use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Instant;
use tracing::info;

use crate::error::AppResult;
use crate::graph::types::Point3;

#[derive(Debug, Clone)]
pub struct LayoutConfig {
    pub repulsion: f64,
    pub center_attraction: f64,
    pub damping: f64,
    pub min_distance: f64,
    pub max_velocity: f64,
    pub boundary_stiffness: f64,
    pub iterations: u32,
    pub max_nodes: i64,
    pub write_batch_size: usize,
    pub epsilon: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            repulsion: 8000.0,
            center_attraction: 0.02,
            damping: 0.9,
            min_distance: 50.0,
            max_velocity: 500.0,
            boundary_stiffness: 0.5,
            iterations: 400,
            max_nodes: 5000,
            write_batch_size: 5000,
            epsilon: 0.5,
        }
    }
}

struct LayoutNode {
    id: String,
    pos: Point3,
    vel: Point3,
}

pub struct LayoutReport {
    pub nodes_updated: usize,
    pub epsilon_skipped: usize,
    pub compute_duration_ms: u64,
    pub write_duration_ms: u64,
}

pub struct LayoutEngine {
    pool: PgPool,
    config: LayoutConfig,
}

impl LayoutEngine {
    pub fn new(pool: PgPool, config: LayoutConfig) -> Self {
        Self { pool, config }
    }

    pub async fn run(&self) -> AppResult<LayoutReport> {
        let compute_started = Instant::now();

        let rows = sqlx::query!(
            r#"
            SELECT id, pos_x, pos_y, pos_z
            FROM graph_nodes
            ORDER BY val::float8 DESC
            LIMIT $1
            "#,
            self.config.max_nodes,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(LayoutReport {
                nodes_updated: 0,
                epsilon_skipped: 0,
                compute_duration_ms: 0,
                write_duration_ms: 0,
            });
        }

        let n = rows.len();
        let scale = 40.0;
        let radius = (n as f64).sqrt() * scale;

        let old_positions: HashMap<String, Point3> = rows
            .iter()
            .filter_map(|r| {
                Some((
                    r.id.clone(),
                    Point3 {
                        x: r.pos_x?,
                        y: r.pos_y?,
                        z: r.pos_z.unwrap_or(0.0),
                    },
                ))
            })
            .collect();

        let mut nodes: Vec<LayoutNode> = rows
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let pos = match (r.pos_x, r.pos_y) {
                    (Some(x), Some(y)) => Point3 { x, y, z: r.pos_z.unwrap_or(0.0) },
                    _ => {
                        let angle = i as f64 * 2.39996; // golden angle
                        Point3 { x: angle.cos() * radius, y: angle.sin() * radius, z: 0.0 }
                    }
                };
                LayoutNode { id: r.id.clone(), pos, vel: Point3::ZERO }
            })
            .collect();

        let index: HashMap<String, usize> =
            nodes.iter().enumerate().map(|(i, n)| (n.id.clone(), i)).collect();

        let link_rows = sqlx::query!(
            "SELECT source_node_id, target_node_id FROM graph_links WHERE source_node_id = ANY($1) AND target_node_id = ANY($1)",
            &nodes.iter().map(|n| n.id.clone()).collect::<Vec<_>>(),
        )
        .fetch_all(&self.pool)
        .await?;

        let edges: Vec<(usize, usize)> = link_rows
            .iter()
            .filter_map(|l| {
                Some((
                    *index.get(&l.source_node_id)?,
                    *index.get(&l.target_node_id)?,
                ))
            })
            .collect();

        for _ in 0..self.config.iterations {
            self.tick(&mut nodes, &edges, radius);
        }

        let compute_duration_ms = compute_started.elapsed().as_millis() as u64;
        let write_started = Instant::now();

        let mut updates = Vec::new();
        let mut epsilon_skipped = 0;
        for node in &nodes {
            let moved = match old_positions.get(&node.id) {
                Some(old) => old.distance(&node.pos) >= self.config.epsilon,
                None => true,
            };
            if moved {
                updates.push(node);
            } else {
                epsilon_skipped += 1;
            }
        }

        for batch in updates.chunks(self.config.write_batch_size) {
            let mut tx = self.pool.begin().await?;
            for node in batch {
                sqlx::query!(
                    "UPDATE graph_nodes SET pos_x = $2, pos_y = $3, pos_z = $4 WHERE id = $1",
                    node.id,
                    node.pos.x,
                    node.pos.y,
                    node.pos.z,
                )
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }

        let write_duration_ms = write_started.elapsed().as_millis() as u64;

        info!(
            nodes_updated = updates.len(),
            epsilon_skipped,
            compute_duration_ms,
            write_duration_ms,
            "layout pass complete"
        );

        Ok(LayoutReport {
            nodes_updated: updates.len(),
            epsilon_skipped,
            compute_duration_ms,
            write_duration_ms,
        })
    }

    fn tick(&self, nodes: &mut [LayoutNode], edges: &[(usize, usize)], boundary_radius: f64) {
        let n = nodes.len();
        let mut forces = vec![Point3::ZERO; n];

        for i in 0..n {
            for j in (i + 1)..n {
                let dx = nodes[i].pos.x - nodes[j].pos.x;
                let dy = nodes[i].pos.y - nodes[j].pos.y;
                let dz = nodes[i].pos.z - nodes[j].pos.z;
                let dist = (dx * dx + dy * dy + dz * dz).sqrt().max(self.config.min_distance);
                let force_mag = self.config.repulsion / (dist * dist);
                let (ux, uy, uz) = (dx / dist, dy / dist, dz / dist);
                forces[i].x += ux * force_mag;
                forces[i].y += uy * force_mag;
                forces[i].z += uz * force_mag;
                forces[j].x -= ux * force_mag;
                forces[j].y -= uy * force_mag;
                forces[j].z -= uz * force_mag;
            }
        }

        // Link attraction pulls connected nodes together (Hooke's law, k=0.01).
        for &(a, b) in edges {
            let dx = nodes[b].pos.x - nodes[a].pos.x;
            let dy = nodes[b].pos.y - nodes[a].pos.y;
            let dz = nodes[b].pos.z - nodes[a].pos.z;
            let k = 0.01;
            forces[a].x += dx * k;
            forces[a].y += dy * k;
            forces[a].z += dz * k;
            forces[b].x -= dx * k;
            forces[b].y -= dy * k;
            forces[b].z -= dz * k;
        }

        for (i, node) in nodes.iter().enumerate() {
            forces[i].x += -node.pos.x * self.config.center_attraction;
            forces[i].y += -node.pos.y * self.config.center_attraction;
            forces[i].z += -node.pos.z * self.config.center_attraction;

            let dist_from_center = (node.pos.x.powi(2) + node.pos.y.powi(2) + node.pos.z.powi(2)).sqrt();
            if dist_from_center > boundary_radius && dist_from_center > 0.0 {
                let overshoot = dist_from_center - boundary_radius;
                let push = overshoot * self.config.boundary_stiffness / dist_from_center;
                forces[i].x += -node.pos.x * push;
                forces[i].y += -node.pos.y * push;
                forces[i].z += -node.pos.z * push;
            }
        }

        let dt = 1.0 / 60.0f64;
        for (i, node) in nodes.iter_mut().enumerate() {
            node.vel.x = (node.vel.x + forces[i].x * dt) * self.config.damping;
            node.vel.y = (node.vel.y + forces[i].y * dt) * self.config.damping;
            node.vel.z = (node.vel.z + forces[i].z * dt) * self.config.damping;

            let speed = (node.vel.x.powi(2) + node.vel.y.powi(2) + node.vel.z.powi(2)).sqrt();
            if speed > self.config.max_velocity {
                let scale = self.config.max_velocity / speed;
                node.vel.x *= scale;
                node.vel.y *= scale;
                node.vel.z *= scale;
            }

            node.pos.x += node.vel.x * dt;
            node.pos.y += node.vel.y * dt;
            node.pos.z += node.vel.z * dt;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_config_defaults_match_spec() {
        let cfg = LayoutConfig::default();
        assert_eq!(cfg.iterations, 400);
        assert_eq!(cfg.max_nodes, 5000);
        assert_eq!(cfg.write_batch_size, 5000);
    }
}
