//! Typed training configuration.
//!
//! Config files are TOML documents that may inherit from other files through
//! `_base_` (see [`loader`]). Command-line overrides are merged into the raw
//! table first ([`overrides`]), and only then is the result deserialized into
//! [`TrainConfig`], so unknown top-level keys and mistyped values are rejected
//! before anything is launched.

pub mod loader;
pub mod overrides;
pub mod resolver;

use crate::error::{LaunchError, LaunchResult};
use crate::seed::SeedPolicy;
use crate::workflow::WorkflowShape;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use toml::Table;

pub use overrides::ConfigOverride;
pub use resolver::{ConfigResolver, ResolveRequest, ResolvedConfig};

/// Key injected into the first pipeline stage by a memory-cache fragment.
pub const FILE_CLIENT_ARGS_KEY: &str = "file_client_args";

/// Root of a training configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainConfig {
    pub model: ComponentConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_cfg: Option<Table>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_cfg: Option<Table>,
    pub data: DataConfig,
    #[serde(default = "default_workflow")]
    pub workflow: Vec<WorkflowPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_from: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpu_ids: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default)]
    pub seed_policy: SeedPolicy,
    #[serde(default)]
    pub dist_params: DistParams,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub cudnn_benchmark: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_config: Option<CheckpointConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_epochs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<Table>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer_config: Option<Table>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lr_config: Option<Table>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<Table>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Table>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_config: Option<Table>,
}

fn default_workflow() -> Vec<WorkflowPhase> {
    vec![WorkflowPhase(Phase::Train, 1)]
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl TrainConfig {
    /// Deserialize a merged raw table into the typed schema.
    pub fn from_table(table: Table) -> LaunchResult<Self> {
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| LaunchError::config(format!("invalid config: {e}")))
    }

    pub fn validate(&self) -> LaunchResult<()> {
        WorkflowShape::from_phases(&self.workflow)?;
        for phase in &self.workflow {
            if phase.1 == 0 {
                return Err(LaunchError::config(format!(
                    "workflow phase `{}` must run for at least one epoch",
                    phase.0
                )));
            }
        }
        if self.model.kind.trim().is_empty() {
            return Err(LaunchError::config("model.type is required"));
        }
        self.data.train.validate("data.train")?;
        if let Some(val) = &self.data.val {
            val.validate("data.val")?;
        }
        if let Some(test) = &self.data.test {
            test.validate("data.test")?;
        }
        Ok(())
    }
}

/// A registry-built component: a `type` name plus free-form arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub args: Table,
}

impl ComponentConfig {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), args: Table::new() }
    }
}

/// One data-loading stage, e.g. `{ type = "LoadImageFromFile" }`.
pub type PipelineStage = ComponentConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_per_gpu")]
    pub samples_per_gpu: u32,
    #[serde(default = "default_per_gpu")]
    pub workers_per_gpu: u32,
    pub train: DatasetConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val: Option<DatasetConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<DatasetConfig>,
    #[serde(flatten)]
    pub extra: Table,
}

fn default_per_gpu() -> u32 {
    2
}

/// Descriptor of the dataset(s) used for one split.
///
/// A bare array of descriptors is an implicit concatenation, the same as an
/// explicit `ConcatDataset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatasetConfig {
    Concat(ConcatDataset),
    List(Vec<DatasetSpec>),
    Single(DatasetSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcatDataset {
    #[serde(rename = "type")]
    pub kind: ConcatKind,
    pub datasets: Vec<DatasetSpec>,
    #[serde(flatten)]
    pub extra: Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcatKind {
    ConcatDataset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline: Vec<PipelineStage>,
    #[serde(flatten)]
    pub extra: Table,
}

impl DatasetSpec {
    #[must_use]
    pub fn new(kind: impl Into<String>, pipeline: Vec<PipelineStage>) -> Self {
        Self { kind: kind.into(), pipeline, extra: Table::new() }
    }
}

impl DatasetConfig {
    #[must_use]
    pub fn is_concat(&self) -> bool {
        !matches!(self, Self::Single(_))
    }

    /// Member descriptors in order; a single descriptor is its own only member.
    #[must_use]
    pub fn members(&self) -> Vec<&DatasetSpec> {
        match self {
            Self::Concat(concat) => concat.datasets.iter().collect(),
            Self::List(list) => list.iter().collect(),
            Self::Single(spec) => vec![spec],
        }
    }

    /// Returns a copy with `f` applied to every member descriptor.
    pub fn map_members<F>(&self, mut f: F) -> LaunchResult<Self>
    where
        F: FnMut(&DatasetSpec) -> LaunchResult<DatasetSpec>,
    {
        Ok(match self {
            Self::Concat(concat) => Self::Concat(ConcatDataset {
                kind: concat.kind,
                datasets: concat.datasets.iter().map(&mut f).collect::<LaunchResult<_>>()?,
                extra: concat.extra.clone(),
            }),
            Self::List(list) => Self::List(list.iter().map(&mut f).collect::<LaunchResult<_>>()?),
            Self::Single(spec) => Self::Single(f(spec)?),
        })
    }

    /// Returns a copy whose member descriptors all carry `file_client_args`
    /// in their first pipeline stage.
    pub fn with_file_client_args(&self, args: &Table) -> LaunchResult<Self> {
        self.map_members(|spec| {
            let mut spec = spec.clone();
            let Some(first) = spec.pipeline.first_mut() else {
                return Err(LaunchError::config(format!(
                    "dataset `{}` has no pipeline stage to receive {FILE_CLIENT_ARGS_KEY}",
                    spec.kind
                )));
            };
            first
                .args
                .insert(FILE_CLIENT_ARGS_KEY.to_string(), toml::Value::Table(args.clone()));
            Ok(spec)
        })
    }

    fn validate(&self, field: &str) -> LaunchResult<()> {
        match self {
            Self::Single(spec) if spec.kind == "ConcatDataset" => Err(LaunchError::config(format!(
                "{field}: ConcatDataset requires a `datasets` array of dataset descriptors"
            ))),
            Self::Single(spec) if spec.kind.trim().is_empty() => {
                Err(LaunchError::config(format!("{field}.type is required")))
            }
            Self::Concat(ConcatDataset { datasets, .. }) | Self::List(datasets)
                if datasets.is_empty() =>
            {
                Err(LaunchError::config(format!("{field}: concatenation has no member datasets")))
            }
            _ => Ok(()),
        }
    }
}

/// `[phase, epochs]`, e.g. `["train", 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowPhase(pub Phase, pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Train,
    Val,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Train => f.write_str("train"),
            Self::Val => f.write_str("val"),
        }
    }
}

/// Parameters handed to the process-group join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistParams {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_addr: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_backend() -> String {
    "nccl".to_string()
}

fn default_timeout_secs() -> u64 {
    1800
}

impl Default for DistParams {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            port: None,
            master_addr: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_interval")]
    pub interval: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<CheckpointMeta>,
    #[serde(flatten)]
    pub extra: Table,
}

fn default_interval() -> u32 {
    1
}

/// Provenance stored in every checkpoint the trainer writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub keel_version: String,
    pub classes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
workflow = [["train", 1], ["val", 1]]

[model]
type = "DBNet"
backbone = { type = "ResNet", depth = 18 }

[data.train]
type = "IcdarDataset"
ann_file = "train.json"
pipeline = [{ type = "LoadImageFromFile" }, { type = "Resize", scale = [640, 640] }]

[data.val]
type = "IcdarDataset"
ann_file = "val.json"
pipeline = [{ type = "LoadImageFromFile" }]
"#;

    fn parse(text: &str) -> TrainConfig {
        TrainConfig::from_table(toml::from_str(text).unwrap()).unwrap()
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = parse(MINIMAL);
        assert_eq!(config.model.kind, "DBNet");
        assert_eq!(config.workflow.len(), 2);
        assert_eq!(config.workflow[1], WorkflowPhase(Phase::Val, 1));
        assert_eq!(config.log_level, "INFO");
        assert_eq!(config.seed_policy, SeedPolicy::Random);
        assert_eq!(config.dist_params.backend, "nccl");

        let DatasetConfig::Single(train) = &config.data.train else {
            panic!("expected a single train descriptor");
        };
        assert_eq!(train.pipeline.len(), 2);
        assert_eq!(train.pipeline[1].kind, "Resize");
        assert!(train.extra.contains_key("ann_file"));
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let text = format!("{MINIMAL}\n[mystery]\nvalue = 1\n");
        let table: Table = toml::from_str(&text).unwrap();
        let err = TrainConfig::from_table(table).unwrap_err();
        assert!(matches!(err, LaunchError::Configuration(_)));
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let text = MINIMAL.replace("workflow = [[\"train\", 1], [\"val\", 1]]", "workflow = 3");
        let table: Table = toml::from_str(&text).unwrap();
        assert!(TrainConfig::from_table(table).is_err());
    }

    #[test]
    fn test_concat_and_list_forms() {
        let text = r#"
[model]
type = "DBNet"

[data.train]
type = "ConcatDataset"
datasets = [
  { type = "A", pipeline = [{ type = "Load" }] },
  { type = "B", pipeline = [{ type = "Load" }] },
]

[[data.val]]
type = "C"
pipeline = [{ type = "Other" }]
"#;
        let config = parse(text);
        assert!(matches!(config.data.train, DatasetConfig::Concat(_)));
        assert_eq!(config.data.train.members().len(), 2);
        let val = config.data.val.as_ref().unwrap();
        assert!(matches!(val, DatasetConfig::List(_)));
        assert!(val.is_concat());
    }

    #[test]
    fn test_file_client_args_injected_into_first_stage_only() {
        let config = parse(MINIMAL);
        let mut args = Table::new();
        args.insert("backend".to_string(), toml::Value::String("memcached".to_string()));

        let train = config.data.train.with_file_client_args(&args).unwrap();
        let spec = train.members()[0];
        assert_eq!(
            spec.pipeline[0].args.get(FILE_CLIENT_ARGS_KEY),
            Some(&toml::Value::Table(args))
        );
        assert!(!spec.pipeline[1].args.contains_key(FILE_CLIENT_ARGS_KEY));
        // The original descriptor is untouched.
        assert!(!config.data.train.members()[0].pipeline[0].args.contains_key(FILE_CLIENT_ARGS_KEY));
    }

    #[test]
    fn test_file_client_args_requires_a_stage() {
        let dataset = DatasetConfig::Single(DatasetSpec::new("Empty", vec![]));
        assert!(dataset.with_file_client_args(&Table::new()).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_epoch_phase() {
        let mut config = parse(MINIMAL);
        config.workflow = vec![WorkflowPhase(Phase::Train, 0)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pretty_round_trip_through_toml() {
        let config = parse(MINIMAL);
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(parse(&text), config);
    }
}
