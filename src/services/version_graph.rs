//! Branch tree and version DAG: lineage queries, next-version allocation,
//! merges, and fitness recomputation from comparison feedback.
//!
//! `getLineage`/`getDescendants` walk the DAG by identifier, BFS'ing over
//! `parent_ids` against a snapshot pulled from the store — never a
//! long-lived in-memory pointer graph, since the DAG can have diamond
//! shapes from merges.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::domain::{Branch, Fitness, Preference, PromptVersion};
use crate::error::{EngineError, EngineResult};
use crate::store::{NewPromptVersion, Store};

pub struct VersionGraph {
    store: Arc<dyn Store>,
}

impl VersionGraph {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get_main_branch(&self, agent_id: &str) -> EngineResult<Branch> {
        self.store.get_main_branch(agent_id).await
    }

    pub async fn create_branch(
        &self,
        agent_id: &str,
        name: &str,
        parent_branch_id: Uuid,
    ) -> EngineResult<Branch> {
        self.store
            .create_branch(Branch::child(agent_id, name, parent_branch_id))
            .await
    }

    pub async fn list_branches(&self, agent_id: &str) -> EngineResult<Vec<Branch>> {
        self.store.list_branches(agent_id).await
    }

    pub async fn delete_branch(&self, id: Uuid) -> EngineResult<()> {
        if self.store.branch_has_versions(id).await? {
            return Err(EngineError::BranchNotEmpty(id));
        }
        self.store.delete_branch(id).await
    }

    pub async fn create_version(
        &self,
        agent_id: &str,
        branch_id: Uuid,
        content: crate::domain::PromptContent,
        parent_ids: Vec<Uuid>,
        mutation_type: Option<String>,
        mutation_details: Option<String>,
        created_by: crate::domain::CreatedBy,
    ) -> EngineResult<PromptVersion> {
        self.store
            .create_prompt_version(
                agent_id,
                branch_id,
                NewPromptVersion {
                    id: Uuid::new_v4(),
                    content,
                    parent_ids,
                    mutation_type,
                    mutation_details,
                    created_by,
                    created_at: Utc::now(),
                },
            )
            .await
    }

    /// Ancestors of `version_id`, BFS over `parent_ids`, nearest first.
    pub async fn get_lineage(&self, version_id: Uuid) -> EngineResult<Vec<PromptVersion>> {
        let root = self
            .store
            .get_prompt_version(version_id)
            .await?
            .ok_or(EngineError::VersionNotFound(version_id))?;
        let all = self.store.list_versions_for_agent(&root.agent_id).await?;
        let by_id: std::collections::HashMap<Uuid, PromptVersion> =
            all.into_iter().map(|v| (v.id, v)).collect();

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut lineage = Vec::new();
        queue.push_back(version_id);
        visited.insert(version_id);

        while let Some(id) = queue.pop_front() {
            let Some(version) = by_id.get(&id) else { continue };
            for parent_id in &version.parent_ids {
                if visited.insert(*parent_id) {
                    if let Some(parent) = by_id.get(parent_id) {
                        lineage.push(parent.clone());
                        queue.push_back(*parent_id);
                    }
                }
            }
        }
        Ok(lineage)
    }

    /// Descendants of `version_id`, BFS over the reverse adjacency (any
    /// version whose `parent_ids` contains an already-visited ancestor).
    pub async fn get_descendants(&self, version_id: Uuid) -> EngineResult<Vec<PromptVersion>> {
        let root = self
            .store
            .get_prompt_version(version_id)
            .await?
            .ok_or(EngineError::VersionNotFound(version_id))?;
        let all = self.store.list_versions_for_agent(&root.agent_id).await?;

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut descendants = Vec::new();
        queue.push_back(version_id);
        visited.insert(version_id);

        loop {
            let Some(current) = queue.pop_front() else { break };
            for candidate in &all {
                if candidate.parent_ids.contains(&current) && visited.insert(candidate.id) {
                    descendants.push(candidate.clone());
                    queue.push_back(candidate.id);
                }
            }
        }
        Ok(descendants)
    }

    /// Most recent common ancestor of `a` and `b` by creation time, or
    /// `None` if they share no ancestor.
    pub async fn find_common_ancestor(
        &self,
        a: Uuid,
        b: Uuid,
    ) -> EngineResult<Option<PromptVersion>> {
        let mut lineage_a = self.get_lineage(a).await?;
        lineage_a.push(self.store.get_prompt_version(a).await?.ok_or(EngineError::VersionNotFound(a))?);
        let ancestors_a: HashSet<Uuid> = lineage_a.iter().map(|v| v.id).collect();

        let mut lineage_b = self.get_lineage(b).await?;
        lineage_b.push(self.store.get_prompt_version(b).await?.ok_or(EngineError::VersionNotFound(b))?);

        let mut common: Vec<PromptVersion> = lineage_b
            .into_iter()
            .filter(|v| ancestors_a.contains(&v.id))
            .collect();
        common.sort_by_key(|v| std::cmp::Reverse(v.created_at));
        Ok(common.into_iter().next())
    }

    pub async fn can_merge(&self, src_branch: Uuid, tgt_branch: Uuid) -> EngineResult<bool> {
        let src_tip = self.branch_tip(src_branch).await?;
        let tgt_tip = self.branch_tip(tgt_branch).await?;
        Ok(src_tip.is_some() && tgt_tip.is_some() && src_tip.map(|v| v.id) != tgt_tip.map(|v| v.id))
    }

    /// Creates a new version on `tgt_branch` whose content equals the source
    /// tip's content and whose `parent_ids = [targetTip, sourceTip]`.
    pub async fn merge_branch(
        &self,
        agent_id: &str,
        src_branch: Uuid,
        tgt_branch: Uuid,
    ) -> EngineResult<PromptVersion> {
        let src_tip = self
            .branch_tip(src_branch)
            .await?
            .ok_or(EngineError::EmptyBranch(src_branch))?;
        let tgt_tip = self
            .branch_tip(tgt_branch)
            .await?
            .ok_or(EngineError::EmptyBranch(tgt_branch))?;
        if src_tip.id == tgt_tip.id {
            return Err(EngineError::AlreadyMerged);
        }
        self.create_version(
            agent_id,
            tgt_branch,
            src_tip.content.clone(),
            vec![tgt_tip.id, src_tip.id],
            Some("merge".to_string()),
            None,
            crate::domain::CreatedBy::Manual,
        )
        .await
    }

    async fn branch_tip(&self, branch_id: Uuid) -> EngineResult<Option<PromptVersion>> {
        let mut versions = self.store.list_versions_for_branch(branch_id).await?;
        versions.sort_by_key(|v| v.version);
        Ok(versions.into_iter().next_back())
    }

    /// Recomputes `fitness` for `version_id` from comparison feedback and
    /// trajectories. Idempotent — safe to call on demand or lazily.
    pub async fn recompute_fitness(&self, version_id: Uuid) -> EngineResult<Fitness> {
        let feedback = self
            .store
            .list_comparison_feedback_for_version(version_id)
            .await?;

        let mut wins = 0u64;
        let mut losses = 0u64;
        let mut ties = 0u64;
        for f in &feedback {
            if f.skipped {
                continue;
            }
            let involves_a = f.version_a_id == version_id;
            match f.preference {
                Some(Preference::Tie) => ties += 1,
                Some(Preference::A) if involves_a => wins += 1,
                Some(Preference::B) if !involves_a => wins += 1,
                Some(_) => losses += 1,
                None => {}
            }
        }
        let comparison_count = wins + losses + ties;
        let win_rate = if comparison_count > 0 {
            Some((wins as f64 + 0.5 * ties as f64) / comparison_count as f64)
        } else {
            None
        };

        let trajectories = self.store.list_trajectories_for_version(version_id).await?;
        let success_rate = if trajectories.is_empty() {
            None
        } else {
            let successes = trajectories.iter().filter(|t| t.success).count();
            Some(successes as f64 / trajectories.len() as f64)
        };
        let efficiencies: Vec<f64> = trajectories.iter().filter_map(|t| t.efficiency).collect();
        let avg_efficiency = if efficiencies.is_empty() {
            None
        } else {
            Some(efficiencies.iter().sum::<f64>() / efficiencies.len() as f64)
        };

        let fitness = Fitness {
            win_rate,
            success_rate,
            avg_efficiency,
            comparison_count,
        };
        self.store.update_fitness(version_id, fitness.clone()).await?;
        Ok(fitness)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ComparisonFeedback, PromptContent, Trajectory};
    use crate::store::memory::InMemoryStore;

    fn content() -> PromptContent {
        PromptContent {
            system_prompt: "you are helpful".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn next_version_is_sequential_per_branch() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let graph = VersionGraph::new(store.clone());
        let branch = graph.get_main_branch("agent-1").await.unwrap();

        let v1 = graph
            .create_version(
                "agent-1",
                branch.id,
                content(),
                vec![],
                None,
                None,
                crate::domain::CreatedBy::Manual,
            )
            .await
            .unwrap();
        assert_eq!(v1.version, 1);

        let v2 = graph
            .create_version(
                "agent-1",
                branch.id,
                content(),
                vec![v1.id],
                None,
                None,
                crate::domain::CreatedBy::Manual,
            )
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
    }

    #[tokio::test]
    async fn lineage_walks_merge_diamonds() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let graph = VersionGraph::new(store.clone());
        let branch = graph.get_main_branch("agent-1").await.unwrap();

        let root = graph
            .create_version("agent-1", branch.id, content(), vec![], None, None, crate::domain::CreatedBy::Manual)
            .await
            .unwrap();
        let left = graph
            .create_version("agent-1", branch.id, content(), vec![root.id], None, None, crate::domain::CreatedBy::Manual)
            .await
            .unwrap();
        let right = graph
            .create_version("agent-1", branch.id, content(), vec![root.id], None, None, crate::domain::CreatedBy::Manual)
            .await
            .unwrap();
        let merge = graph
            .create_version(
                "agent-1",
                branch.id,
                content(),
                vec![left.id, right.id],
                None,
                None,
                crate::domain::CreatedBy::Manual,
            )
            .await
            .unwrap();

        let lineage = graph.get_lineage(merge.id).await.unwrap();
        let ids: HashSet<Uuid> = lineage.iter().map(|v| v.id).collect();
        assert!(ids.contains(&left.id));
        assert!(ids.contains(&right.id));
        assert!(ids.contains(&root.id));
    }

    #[tokio::test]
    async fn fitness_win_rate_counts_ties_as_half() {
        let store = InMemoryStore::new();
        let v_a = Uuid::new_v4();
        let v_b = Uuid::new_v4();
        store
            .seed_feedback(ComparisonFeedback {
                id: Uuid::new_v4(),
                version_a_id: v_a,
                version_b_id: v_b,
                preference: Some(Preference::A),
                skipped: false,
                created_at: Utc::now(),
            })
            .await;
        store
            .seed_feedback(ComparisonFeedback {
                id: Uuid::new_v4(),
                version_a_id: v_a,
                version_b_id: v_b,
                preference: Some(Preference::Tie),
                skipped: false,
                created_at: Utc::now(),
            })
            .await;
        store
            .seed_trajectory(Trajectory {
                id: Uuid::new_v4(),
                agent_id: "agent-1".to_string(),
                version_id: v_a,
                success: true,
                error: false,
                efficiency: Some(0.8),
                steps: 3,
                duration_ms: 500,
                occurred_at: Utc::now(),
            })
            .await;

        let store: Arc<dyn Store> = Arc::new(store);
        let graph = VersionGraph::new(store);
        let fitness = graph.recompute_fitness(v_a).await.unwrap();
        assert_eq!(fitness.comparison_count, 2);
        assert_eq!(fitness.win_rate, Some(0.75));
        assert_eq!(fitness.success_rate, Some(1.0));
    }
}
