//! Edge bundle computer (C12, §4.12): control points for rendering
//! aggregated inter-community edges instead of every individual link.

use sqlx::PgPool;
use std::collections::HashMap;

use crate::error::AppResult;
use crate::graph::types::Point3;

pub struct BundleComputer {
    pool: PgPool,
}

impl BundleComputer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run(&self) -> AppResult<usize> {
        let top_level = sqlx::query_scalar!("SELECT max(level) FROM community_hierarchy")
            .fetch_one(&self.pool)
            .await?;
        let Some(top_level) = top_level else { return Ok(0) };

        let rows = sqlx::query!(
            "SELECT node_id, community_id, centroid_x, centroid_y, centroid_z FROM community_hierarchy WHERE level = $1",
            top_level,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut centroid_of: HashMap<i64, Point3> = HashMap::new();
        let mut node_to_community: HashMap<String, i64> = HashMap::new();
        for row in &rows {
            node_to_community.insert(row.node_id.clone(), row.community_id);
            if let (Some(x), Some(y)) = (row.centroid_x, row.centroid_y) {
                centroid_of.insert(row.community_id, Point3 { x, y, z: row.centroid_z.unwrap_or(0.0) });
            }
        }

        let links = sqlx::query!("SELECT source_node_id, target_node_id, val FROM graph_links")
            .fetch_all(&self.pool)
            .await?;

        let mut pair_weight: HashMap<(i64, i64), (i64, f64)> = HashMap::new();
        for link in &links {
            let (Some(&a), Some(&b)) = (
                node_to_community.get(&link.source_node_id),
                node_to_community.get(&link.target_node_id),
            ) else {
                continue;
            };
            if a == b {
                continue;
            }
            let key = if a < b { (a, b) } else { (b, a) };
            let entry = pair_weight.entry(key).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += link.val.unwrap_or(1.0);
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query!("TRUNCATE bundles").execute(&mut *tx).await?;

        let mut written = 0usize;
        for ((a, b), (count, sum)) in &pair_weight {
            if *count == 0 {
                continue;
            }
            let (Some(ca), Some(cb)) = (centroid_of.get(a), centroid_of.get(b)) else {
                continue;
            };

            let mid = Point3 {
                x: (ca.x + cb.x) / 2.0,
                y: (ca.y + cb.y) / 2.0,
                z: (ca.z + cb.z) / 2.0,
            };
            let dx = cb.x - ca.x;
            let dy = cb.y - ca.y;
            let dist = (dx * dx + dy * dy).sqrt();
            let (perp_x, perp_y) = if dist > 1e-9 { (-dy / dist, dx / dist) } else { (0.0, 0.0) };
            let offset = 0.2 * dist;

            let control_x = mid.x + perp_x * offset;
            let control_y = mid.y + perp_y * offset;
            let avg_strength = sum / *count as f64;

            sqlx::query!(
                r#"
                INSERT INTO bundles (source_community_id, target_community_id, weight, avg_strength, control_x, control_y, control_z)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (source_community_id, target_community_id)
                DO UPDATE SET weight = EXCLUDED.weight, avg_strength = EXCLUDED.avg_strength,
                              control_x = EXCLUDED.control_x, control_y = EXCLUDED.control_y, control_z = EXCLUDED.control_z
                "#,
                a,
                b,
                count,
                avg_strength,
                control_x,
                control_y,
                mid.z,
            )
            .execute(&mut *tx)
            .await?;
            written += 1;
        }

        tx.commit().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perpendicular_offset_is_orthogonal_to_segment() {
        let a = Point3 { x: 0.0, y: 0.0, z: 0.0 };
        let b = Point3 { x: 10.0, y: 0.0, z: 0.0 };
        let dx = b.x - a.x;
        let dy = b.y - a.y;
        let dist = (dx * dx + dy * dy).sqrt();
        let (perp_x, perp_y) = (-dy / dist, dx / dist);
        // segment is along x, perpendicular should be along y
        assert!(perp_x.abs() < 1e-9);
        assert!((perp_y - 1.0).abs() < 1e-9);
    }
}
