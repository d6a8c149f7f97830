//! Hierarchical multi-level community detector (C11, §4.11).
//!
//! Single-pass Louvain modularity optimization run level by level: level 0
//! is every leaf node in its own community, each subsequent level runs
//! Louvain over the meta-graph of the previous level's communities.

use sqlx::PgPool;
use std::collections::HashMap;
use tracing::info;

use crate::error::AppResult;
use crate::graph::types::Point3;

pub struct CommunityConfig {
    pub max_nodes: i64,
    pub max_iter: u32,
    pub max_levels: u32,
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            max_nodes: 50_000,
            max_iter: 50,
            max_levels: 4,
        }
    }
}

struct LevelGraph {
    /// node index -> community id at this level (assigned by Louvain)
    node_ids: Vec<String>,
    /// adjacency as id -> Vec<(neighbor_idx, weight)>
    adjacency: Vec<Vec<(usize, f64)>>,
    degree: Vec<f64>,
    total_weight: f64,
}

pub struct CommunityDetector {
    pool: PgPool,
    config: CommunityConfig,
}

impl CommunityDetector {
    pub fn new(pool: PgPool, config: CommunityConfig) -> Self {
        Self { pool, config }
    }

    pub async fn run(&self) -> AppResult<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query!("TRUNCATE community_hierarchy, community_members, communities, community_links")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut graph = self.load_level0().await?;
        if graph.node_ids.is_empty() {
            return Ok(0);
        }

        let leaf_node_ids = graph.node_ids.clone();

        // level 0: identity partition, one community per leaf. Its
        // `parent_community_id` is filled in once level 1 exists below.
        let level0_assignment: Vec<i64> = (0..graph.node_ids.len() as i64).collect();
        self.persist_level(0, &leaf_node_ids, &level0_assignment).await?;

        // tracks, for each leaf, its community index within the *current*
        // meta-graph so the next Louvain pass's assignment can be composed
        // back down to leaf granularity.
        let mut leaf_to_current_idx: Vec<usize> = (0..leaf_node_ids.len()).collect();
        let mut level = 1u32;
        let mut prev_level = 0i32;

        while level <= self.config.max_levels {
            let assignment = self.louvain_pass(&graph);
            let distinct: std::collections::HashSet<i64> = assignment.iter().copied().collect();

            if distinct.len() < 3 || distinct.len() == graph.node_ids.len() || distinct.len() == 1 {
                break;
            }

            let leaf_to_level: Vec<i64> = leaf_to_current_idx
                .iter()
                .map(|&idx| assignment[idx])
                .collect();

            // this level is the *parent* of the previously persisted one —
            // point the prior level's rows up at it, then persist this
            // level's own rows with parent left NULL until a coarser level
            // (if any) fills it in on the next iteration.
            self.update_parent_pointers(prev_level, &leaf_node_ids, &leaf_to_level).await?;
            self.persist_level(level as i32, &leaf_node_ids, &leaf_to_level).await?;

            let (meta, community_to_meta_idx) = self.build_meta_graph(&graph, &assignment);

            leaf_to_current_idx = leaf_to_level
                .iter()
                .map(|comm| community_to_meta_idx[comm])
                .collect();

            graph = meta;
            prev_level = level as i32;
            level += 1;
        }

        self.persist_top_level_communities().await?;

        info!(levels = level, "community detection complete");
        Ok(level as usize)
    }

    async fn load_level0(&self) -> AppResult<LevelGraph> {
        let nodes = sqlx::query_scalar!(
            "SELECT id FROM graph_nodes ORDER BY val::float8 DESC LIMIT $1",
            self.config.max_nodes,
        )
        .fetch_all(&self.pool)
        .await?;

        let index: HashMap<String, usize> =
            nodes.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();

        let links = sqlx::query!(
            "SELECT source_node_id, target_node_id, val FROM graph_links WHERE source_node_id = ANY($1) AND target_node_id = ANY($1)",
            &nodes,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut adjacency = vec![Vec::new(); nodes.len()];
        let mut degree = vec![0.0; nodes.len()];
        let mut total_weight = 0.0;

        for link in &links {
            let (Some(&a), Some(&b)) =
                (index.get(&link.source_node_id), index.get(&link.target_node_id))
            else {
                continue;
            };
            if a == b {
                continue;
            }
            let w = link.val.unwrap_or(1.0);
            adjacency[a].push((b, w));
            adjacency[b].push((a, w));
            degree[a] += w;
            degree[b] += w;
            total_weight += w;
        }

        Ok(LevelGraph { node_ids: nodes, adjacency, degree, total_weight })
    }

    /// Single-pass Louvain: repeatedly move each node into the neighboring
    /// community with maximum modularity gain, ties broken by ascending
    /// community id, until a full pass makes no move (§4.11).
    fn louvain_pass(&self, graph: &LevelGraph) -> Vec<i64> {
        let n = graph.node_ids.len();
        let mut community: Vec<i64> = (0..n as i64).collect();
        let mut community_weight: Vec<f64> = graph.degree.clone();
        let m2 = (graph.total_weight * 2.0).max(1.0);

        for _ in 0..self.config.max_iter {
            let mut moved = false;

            for node in 0..n {
                let current_comm = community[node];
                community_weight[current_comm as usize] -= graph.degree[node];

                let mut gains: HashMap<i64, f64> = HashMap::new();
                for &(neighbor, weight) in &graph.adjacency[node] {
                    *gains.entry(community[neighbor]).or_insert(0.0) += weight;
                }

                let mut best_comm = current_comm;
                let mut best_gain = gains.get(&current_comm).copied().unwrap_or(0.0)
                    - graph.degree[node] * community_weight[current_comm as usize] / m2;

                let mut candidates: Vec<i64> = gains.keys().copied().collect();
                candidates.sort();

                for comm in candidates {
                    let k_i_in = gains[&comm];
                    let sigma_tot = community_weight[comm as usize];
                    let gain = k_i_in - graph.degree[node] * sigma_tot / m2;
                    if gain > best_gain || (gain == best_gain && comm < best_comm) {
                        best_gain = gain;
                        best_comm = comm;
                    }
                }

                community_weight[best_comm as usize] += graph.degree[node];
                if best_comm != current_comm {
                    moved = true;
                }
                community[node] = best_comm;
            }

            if !moved {
                break;
            }
        }

        community
    }

    fn build_meta_graph(&self, graph: &LevelGraph, assignment: &[i64]) -> (LevelGraph, HashMap<i64, usize>) {
        let mut community_to_idx: HashMap<i64, usize> = HashMap::new();
        for &c in assignment {
            let next = community_to_idx.len();
            community_to_idx.entry(c).or_insert(next);
        }
        let m = community_to_idx.len();
        let mut node_ids = vec![String::new(); m];
        for (&comm, &idx) in &community_to_idx {
            node_ids[idx] = format!("meta_{comm}");
        }

        let mut weight_map: HashMap<(usize, usize), f64> = HashMap::new();
        let mut degree = vec![0.0; m];
        let mut total_weight = 0.0;

        for (node, adj) in graph.adjacency.iter().enumerate() {
            let a = community_to_idx[&assignment[node]];
            for &(neighbor, w) in adj {
                let b = community_to_idx[&assignment[neighbor]];
                if a == b {
                    continue;
                }
                let key = if a < b { (a, b) } else { (b, a) };
                *weight_map.entry(key).or_insert(0.0) += w / 2.0; // each undirected edge counted from both ends
                degree[a] += w / 2.0;
                total_weight += w / 2.0;
            }
        }

        let mut adjacency = vec![Vec::new(); m];
        for (&(a, b), &w) in &weight_map {
            adjacency[a].push((b, w));
            adjacency[b].push((a, w));
        }

        (LevelGraph { node_ids, adjacency, degree, total_weight }, community_to_idx)
    }

    async fn persist_level(
        &self,
        level: i32,
        leaf_node_ids: &[String],
        assignment: &[i64],
    ) -> AppResult<()> {
        if level == 0 {
            let mut tx = self.pool.begin().await?;
            for (i, node_id) in leaf_node_ids.iter().enumerate() {
                sqlx::query!(
                    r#"
                    INSERT INTO community_hierarchy (node_id, level, community_id, parent_community_id)
                    VALUES ($1, 0, $2, NULL)
                    "#,
                    node_id,
                    assignment[i],
                )
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            return Ok(());
        }

        let positions = self.member_positions(leaf_node_ids).await?;
        let mut sums: HashMap<i64, (f64, f64, f64, usize)> = HashMap::new();
        for (i, node_id) in leaf_node_ids.iter().enumerate() {
            if let Some(p) = positions.get(node_id) {
                let entry = sums.entry(assignment[i]).or_insert((0.0, 0.0, 0.0, 0));
                entry.0 += p.x;
                entry.1 += p.y;
                entry.2 += p.z;
                entry.3 += 1;
            }
        }
        let centroids: HashMap<i64, Point3> = sums
            .into_iter()
            .map(|(comm, (sx, sy, sz, n))| (comm, Point3 { x: sx / n as f64, y: sy / n as f64, z: sz / n as f64 }))
            .collect();

        let mut tx = self.pool.begin().await?;
        for (i, node_id) in leaf_node_ids.iter().enumerate() {
            let parent: Option<i64> = None;
            let centroid = centroids.get(&assignment[i]);
            sqlx::query!(
                r#"
                INSERT INTO community_hierarchy (node_id, level, community_id, parent_community_id, centroid_x, centroid_y, centroid_z)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (node_id, level) DO UPDATE SET community_id = EXCLUDED.community_id
                "#,
                node_id,
                level,
                assignment[i],
                parent,
                centroid.map(|c| c.x),
                centroid.map(|c| c.y),
                centroid.map(|c| c.z),
            )
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Points every leaf's row at `level` at its community in the next
    /// coarser level, once that coarser level has been computed (§8 P-11:
    /// `parent_community_id` refers up the hierarchy, never down).
    async fn update_parent_pointers(
        &self,
        level: i32,
        leaf_node_ids: &[String],
        parent_assignment: &[i64],
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        for (i, node_id) in leaf_node_ids.iter().enumerate() {
            sqlx::query!(
                "UPDATE community_hierarchy SET parent_community_id = $1 WHERE node_id = $2 AND level = $3",
                parent_assignment[i],
                node_id,
                level,
            )
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn member_positions(&self, node_ids: &[String]) -> AppResult<HashMap<String, Point3>> {
        let rows = sqlx::query!(
            "SELECT id, pos_x, pos_y, pos_z FROM graph_nodes WHERE id = ANY($1)",
            node_ids,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| Some((r.id, Point3 { x: r.pos_x?, y: r.pos_y?, z: r.pos_z.unwrap_or(0.0) })))
            .collect())
    }

    /// Flat `communities` table kept for clients that only understand a
    /// single tier, populated from the highest persisted hierarchy level.
    async fn persist_top_level_communities(&self) -> AppResult<()> {
        let top_level = sqlx::query_scalar!("SELECT max(level) FROM community_hierarchy")
            .fetch_one(&self.pool)
            .await?;
        let Some(top_level) = top_level else { return Ok(()) };

        let members = sqlx::query!(
            "SELECT node_id, community_id FROM community_hierarchy WHERE level = $1",
            top_level,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_community: HashMap<i64, Vec<String>> = HashMap::new();
        for m in &members {
            by_community.entry(m.community_id).or_default().push(m.node_id.clone());
        }

        let mut tx = self.pool.begin().await?;
        for (community_id, node_ids) in &by_community {
            sqlx::query!(
                r#"
                INSERT INTO communities (id, label, size, modularity, created_at)
                VALUES ($1, $2, $3, 0.0, now())
                ON CONFLICT (id) DO UPDATE SET size = EXCLUDED.size
                "#,
                community_id,
                format!("community_{community_id}"),
                node_ids.len() as i32,
            )
            .execute(&mut *tx)
            .await?;

            for node_id in node_ids {
                sqlx::query!(
                    "INSERT INTO community_members (community_id, node_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                    community_id,
                    node_id,
                )
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}
