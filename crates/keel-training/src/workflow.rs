//! Train/validation workflow assembly.
//!
//! The validation split is built with the *training* pipeline: before the
//! validation descriptor is built, its pipeline is replaced by the training
//! one. The replacement is done on a copy; the resolved config keeps the
//! validation pipeline it was written with.

use crate::config::{ConcatDataset, DatasetConfig, DatasetSpec, PipelineStage, TrainConfig, WorkflowPhase};
use crate::dataset::{Dataset, DatasetFactory, DatasetSummary};
use crate::error::{LaunchError, LaunchResult};
use tracing::debug;

/// Which datasets a workflow needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowShape {
    TrainOnly,
    TrainVal,
}

impl WorkflowShape {
    pub fn from_phases(phases: &[WorkflowPhase]) -> LaunchResult<Self> {
        match phases.len() {
            1 => Ok(Self::TrainOnly),
            2 => Ok(Self::TrainVal),
            n => Err(LaunchError::config(format!("workflow must have 1 or 2 phases, got {n}"))),
        }
    }
}

/// Pipeline the validation split inherits: the training descriptor's, or its
/// first member's when training is a concatenation.
#[must_use]
pub fn source_pipeline(train: &DatasetConfig) -> &[PipelineStage] {
    match train {
        DatasetConfig::Single(spec) => &spec.pipeline,
        DatasetConfig::Concat(ConcatDataset { datasets, .. }) | DatasetConfig::List(datasets) => {
            datasets.first().map_or(&[][..], |spec| spec.pipeline.as_slice())
        }
    }
}

/// Copy of `val` whose pipeline, or every member's pipeline for a
/// concatenation, is `pipeline`.
#[must_use]
pub fn with_pipeline(val: &DatasetConfig, pipeline: &[PipelineStage]) -> DatasetConfig {
    let replace = |spec: &DatasetSpec| DatasetSpec { pipeline: pipeline.to_vec(), ..spec.clone() };
    match val {
        DatasetConfig::Single(spec) => DatasetConfig::Single(replace(spec)),
        DatasetConfig::List(list) => DatasetConfig::List(list.iter().map(replace).collect()),
        DatasetConfig::Concat(concat) => DatasetConfig::Concat(ConcatDataset {
            kind: concat.kind,
            datasets: concat.datasets.iter().map(replace).collect(),
            extra: concat.extra.clone(),
        }),
    }
}

/// `[train]` or `[train, val]`.
#[derive(Debug)]
pub struct DatasetBundle {
    datasets: Vec<Box<dyn Dataset>>,
}

impl DatasetBundle {
    #[must_use]
    pub fn train(&self) -> &dyn Dataset {
        self.datasets[0].as_ref()
    }

    #[must_use]
    pub fn val(&self) -> Option<&dyn Dataset> {
        self.datasets.get(1).map(|ds| &**ds)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Class names of the run, taken from the training dataset.
    #[must_use]
    pub fn classes(&self) -> Vec<String> {
        self.train().classes().to_vec()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Dataset> {
        self.datasets.iter().map(|ds| &**ds)
    }

    #[must_use]
    pub fn summaries(&self) -> Vec<DatasetSummary> {
        self.iter().map(|ds| ds.summary()).collect()
    }
}

pub struct WorkflowAssembler<'a> {
    factory: &'a DatasetFactory,
}

impl<'a> WorkflowAssembler<'a> {
    #[must_use]
    pub fn new(factory: &'a DatasetFactory) -> Self {
        Self { factory }
    }

    pub fn assemble(&self, config: &TrainConfig) -> LaunchResult<DatasetBundle> {
        let shape = WorkflowShape::from_phases(&config.workflow)?;
        let mut datasets = vec![self.factory.build(&config.data.train)?];

        if shape == WorkflowShape::TrainVal {
            let val = config.data.val.as_ref().ok_or_else(|| {
                LaunchError::config("workflow has a second phase but data.val is not configured")
            })?;
            let val = with_pipeline(val, source_pipeline(&config.data.train));
            debug!(members = val.members().len(), "validation split uses the training pipeline");
            datasets.push(self.factory.build(&val)?);
        }

        Ok(DatasetBundle { datasets })
    }
}
