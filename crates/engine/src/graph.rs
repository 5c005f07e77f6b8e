//! The stage chain of a pipeline as an explicit arena.
//!
//! Stages are indexed by id and each holds an optional successor. Rules
//! enforced by [`StageGraph::verify`]:
//! 1. Every stage belongs to the graph's pipeline.
//! 2. Every successor id refers to a stage in the graph.
//! 3. No stage has more than one predecessor.
//! 4. There is exactly one head and walking from it visits every stage
//!    (no cycles, no detached fragments).
//!
//! Insertion and removal are split into a pure `plan_*` step, whose result
//! is handed to the store as one atomic write, and an `apply_*` step that
//! mutates the arena the same way.

use std::collections::{HashMap, HashSet};

use ports::{PipelineId, PipelineStage, StageId, StageLink};

use crate::PipelineError;

/// Where a new stage goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertPlan {
    pub stage_id: StageId,
    /// Successor the new stage starts with.
    pub next_stage_id: Option<StageId>,
    /// Existing stage re-pointed at the new one.
    pub link: Option<StageLink>,
}

/// What changes when a stage is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalPlan {
    pub stage_id: StageId,
    /// Predecessor re-pointed at the removed stage's successor.
    pub rewire: Option<StageLink>,
}

#[derive(Debug, Clone)]
pub struct StageGraph {
    pipeline_id: PipelineId,
    stages: HashMap<StageId, PipelineStage>,
}

impl StageGraph {
    pub fn new(pipeline_id: PipelineId) -> Self {
        Self { pipeline_id, stages: HashMap::new() }
    }

    /// Build the arena from stored rows. Nothing is checked here; call
    /// [`verify`](Self::verify) before relying on the chain shape.
    pub fn from_stages(pipeline_id: PipelineId, stages: Vec<PipelineStage>) -> Self {
        Self {
            pipeline_id,
            stages: stages.into_iter().map(|s| (s.id, s)).collect(),
        }
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    pub fn get(&self, id: StageId) -> Option<&PipelineStage> {
        self.stages.get(&id)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The stage whose successor is `id`.
    pub fn predecessor_of(&self, id: StageId) -> Option<StageId> {
        self.stages
            .values()
            .find(|s| s.next_stage_id == Some(id))
            .map(|s| s.id)
    }

    /// Check the chain invariant and return stage ids in chain order.
    ///
    /// # Errors
    /// [`PipelineError::InvalidStage`] naming the first violation found.
    pub fn verify(&self) -> Result<Vec<StageId>, PipelineError> {
        let mut predecessors: HashMap<StageId, usize> = HashMap::new();

        for stage in self.stages.values() {
            if stage.pipeline_id != self.pipeline_id {
                return Err(PipelineError::invalid_stage(
                    format!("stage '{}' belongs to another pipeline", stage.id),
                    400,
                ));
            }
            if let Some(next) = stage.next_stage_id {
                if !self.stages.contains_key(&next) {
                    return Err(PipelineError::invalid_stage(
                        format!("stage '{}' links to unknown stage '{next}'", stage.id),
                        400,
                    ));
                }
                let count = predecessors.entry(next).or_insert(0);
                *count += 1;
                if *count > 1 {
                    return Err(PipelineError::invalid_stage(
                        format!("stage '{next}' has more than one predecessor"),
                        400,
                    ));
                }
            }
        }

        let mut heads = self.stages.keys().filter(|id| !predecessors.contains_key(*id));
        let head = match (heads.next(), heads.next()) {
            (None, _) if self.stages.is_empty() => return Ok(Vec::new()),
            (None, _) => {
                return Err(PipelineError::invalid_stage("stage chain contains a cycle", 400))
            }
            (Some(_), Some(_)) => {
                return Err(PipelineError::invalid_stage("stage chain has more than one head", 400))
            }
            (Some(head), None) => *head,
        };

        let mut order = Vec::with_capacity(self.stages.len());
        let mut seen = HashSet::new();
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            if !seen.insert(id) {
                return Err(PipelineError::invalid_stage("stage chain contains a cycle", 400));
            }
            order.push(id);
            cursor = self.stages.get(&id).and_then(|s| s.next_stage_id);
        }

        // A cycle detached from the head chain leaves stages unvisited.
        if order.len() != self.stages.len() {
            return Err(PipelineError::invalid_stage("stage chain contains a cycle", 400));
        }

        Ok(order)
    }

    /// Stages in chain order.
    pub fn ordered(&self) -> Result<Vec<&PipelineStage>, PipelineError> {
        Ok(self
            .verify()?
            .into_iter()
            .filter_map(|id| self.stages.get(&id))
            .collect())
    }

    pub fn head(&self) -> Result<Option<StageId>, PipelineError> {
        Ok(self.verify()?.first().copied())
    }

    pub fn tail(&self) -> Result<Option<StageId>, PipelineError> {
        Ok(self.verify()?.last().copied())
    }

    /// Plan linking a new stage `stage_id`.
    ///
    /// With a `source` the new stage goes right after it and takes over the
    /// source's old successor. Without one it is appended after the tail.
    pub fn plan_insert(
        &self,
        stage_id: StageId,
        source: Option<StageId>,
    ) -> Result<InsertPlan, PipelineError> {
        self.verify()?;

        match source {
            Some(source_id) => {
                let source = self.stages.get(&source_id).ok_or_else(|| {
                    PipelineError::invalid_stage("Source stage must be part of the same pipeline", 400)
                })?;
                Ok(InsertPlan {
                    stage_id,
                    next_stage_id: source.next_stage_id,
                    link: Some(StageLink {
                        stage_id: source_id,
                        expected_next: source.next_stage_id,
                        next_stage_id: Some(stage_id),
                    }),
                })
            }
            None => Ok(InsertPlan {
                stage_id,
                next_stage_id: None,
                link: self
                    .tail()?
                    .map(|tail| StageLink {
                        stage_id: tail,
                        expected_next: None,
                        next_stage_id: Some(stage_id),
                    }),
            }),
        }
    }

    /// Plan unlinking stage `id`.
    pub fn plan_removal(&self, id: StageId) -> Result<RemovalPlan, PipelineError> {
        let stage = self
            .stages
            .get(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("Stage '{id}' not found")))?;
        Ok(RemovalPlan {
            stage_id: id,
            rewire: self
                .predecessor_of(id)
                .map(|prev| StageLink {
                    stage_id: prev,
                    expected_next: Some(id),
                    next_stage_id: stage.next_stage_id,
                }),
        })
    }

    pub fn apply_insert(&mut self, mut stage: PipelineStage, plan: &InsertPlan) {
        stage.id = plan.stage_id;
        stage.next_stage_id = plan.next_stage_id;
        self.stages.insert(stage.id, stage);
        self.apply_link(plan.link);
    }

    pub fn apply_removal(&mut self, plan: &RemovalPlan) {
        self.stages.remove(&plan.stage_id);
        self.apply_link(plan.rewire);
    }

    fn apply_link(&mut self, link: Option<StageLink>) {
        if let Some(link) = link {
            if let Some(stage) = self.stages.get_mut(&link.stage_id) {
                stage.next_stage_id = link.next_stage_id;
            }
        }
    }
}
