//! Datasets as the launcher sees them: a class list and a sample pipeline.
//!
//! Sample loading lives with the trainer. The launcher only needs to build
//! dataset handles from descriptors, read their classes, and hand them on.

use crate::config::{DatasetConfig, DatasetSpec, PipelineStage};
use crate::error::{LaunchError, LaunchResult};
use crate::registry::Registry;
use serde::{Deserialize, Serialize};

/// Descriptor key holding the class names of a dataset.
pub const CLASSES_KEY: &str = "classes";

pub trait Dataset: Send + Sync + std::fmt::Debug {
    /// Registry name the dataset was built from.
    fn kind(&self) -> &str;

    fn classes(&self) -> &[String];

    fn pipeline(&self) -> &[PipelineStage];

    fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            kind: self.kind().to_string(),
            classes: self.classes().to_vec(),
            pipeline: self.pipeline().iter().map(|stage| stage.kind.clone()).collect(),
            members: Vec::new(),
        }
    }
}

/// What the hand-off manifest records about a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSummary {
    #[serde(rename = "type")]
    pub kind: String,
    pub classes: Vec<String>,
    pub pipeline: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<DatasetSummary>,
}

/// Dataset backed directly by its descriptor.
#[derive(Debug, Clone)]
pub struct DescriptorDataset {
    spec: DatasetSpec,
    classes: Vec<String>,
}

impl DescriptorDataset {
    pub fn from_spec(spec: &DatasetSpec) -> LaunchResult<Self> {
        let classes = match spec.extra.get(CLASSES_KEY) {
            None => Vec::new(),
            Some(toml::Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        LaunchError::Dataset(format!("`{}`: class names must be strings, got {item}", spec.kind))
                    })
                })
                .collect::<LaunchResult<_>>()?,
            Some(other) => {
                return Err(LaunchError::Dataset(format!(
                    "`{}`: {CLASSES_KEY} must be an array of strings, got {}",
                    spec.kind,
                    other.type_str()
                )));
            }
        };
        Ok(Self { spec: spec.clone(), classes })
    }

    #[must_use]
    pub fn spec(&self) -> &DatasetSpec {
        &self.spec
    }
}

impl Dataset for DescriptorDataset {
    fn kind(&self) -> &str {
        &self.spec.kind
    }

    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn pipeline(&self) -> &[PipelineStage] {
        &self.spec.pipeline
    }
}

/// Member datasets presented as one. Classes and pipeline are the first
/// member's.
#[derive(Debug)]
pub struct ConcatDatasets {
    members: Vec<Box<dyn Dataset>>,
}

impl ConcatDatasets {
    pub fn new(members: Vec<Box<dyn Dataset>>) -> LaunchResult<Self> {
        if members.is_empty() {
            return Err(LaunchError::Dataset("cannot concatenate zero datasets".to_string()));
        }
        Ok(Self { members })
    }

    #[must_use]
    pub fn members(&self) -> &[Box<dyn Dataset>] {
        &self.members
    }
}

impl Dataset for ConcatDatasets {
    fn kind(&self) -> &str {
        "ConcatDataset"
    }

    fn classes(&self) -> &[String] {
        self.members[0].classes()
    }

    fn pipeline(&self) -> &[PipelineStage] {
        self.members[0].pipeline()
    }

    fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            kind: self.kind().to_string(),
            classes: self.classes().to_vec(),
            pipeline: self.pipeline().iter().map(|stage| stage.kind.clone()).collect(),
            members: self.members.iter().map(|m| m.summary()).collect(),
        }
    }
}

/// Builds datasets from descriptors through a registry of dataset types.
/// Types without a registered builder become [`DescriptorDataset`]s.
#[derive(Debug)]
pub struct DatasetFactory {
    registry: Registry<DatasetSpec, LaunchResult<Box<dyn Dataset>>>,
}

impl Default for DatasetFactory {
    fn default() -> Self {
        let mut registry: Registry<DatasetSpec, LaunchResult<Box<dyn Dataset>>> = Registry::new();
        registry.set_fallback(|spec: &DatasetSpec| {
            DescriptorDataset::from_spec(spec).map(|ds| Box::new(ds) as Box<dyn Dataset>)
        });
        Self { registry }
    }
}

impl DatasetFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, build: F) -> &mut Self
    where
        F: Fn(&DatasetSpec) -> LaunchResult<Box<dyn Dataset>> + Send + Sync + 'static,
    {
        self.registry.register(kind, build);
        self
    }

    pub fn build(&self, config: &DatasetConfig) -> LaunchResult<Box<dyn Dataset>> {
        match config {
            DatasetConfig::Single(spec) => self.build_member(spec),
            DatasetConfig::Concat(_) | DatasetConfig::List(_) => {
                let members = config
                    .members()
                    .into_iter()
                    .map(|spec| self.build_member(spec))
                    .collect::<LaunchResult<Vec<_>>>()?;
                Ok(Box::new(ConcatDatasets::new(members)?))
            }
        }
    }

    fn build_member(&self, spec: &DatasetSpec) -> LaunchResult<Box<dyn Dataset>> {
        self.registry
            .build(&spec.kind, spec)
            .unwrap_or_else(|| Err(LaunchError::Dataset(format!("unknown dataset type `{}`", spec.kind))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConcatDataset, ConcatKind, PipelineStage};

    fn spec(kind: &str, classes: &[&str]) -> DatasetSpec {
        let mut spec = DatasetSpec::new(kind, vec![PipelineStage::new("LoadImageFromFile")]);
        spec.extra.insert(
            CLASSES_KEY.to_string(),
            toml::Value::Array(classes.iter().map(|c| toml::Value::String((*c).to_string())).collect()),
        );
        spec
    }

    #[test]
    fn test_descriptor_dataset_reads_classes() {
        let ds = DescriptorDataset::from_spec(&spec("IcdarDataset", &["text"])).unwrap();
        assert_eq!(ds.kind(), "IcdarDataset");
        assert_eq!(ds.classes(), ["text".to_string()]);
        assert_eq!(ds.pipeline()[0].kind, "LoadImageFromFile");
    }

    #[test]
    fn test_descriptor_dataset_rejects_non_string_classes() {
        let mut bad = DatasetSpec::new("IcdarDataset", vec![]);
        bad.extra.insert(CLASSES_KEY.to_string(), toml::Value::Array(vec![toml::Value::Integer(1)]));
        let err = DescriptorDataset::from_spec(&bad).unwrap_err();
        assert!(matches!(err, LaunchError::Dataset(_)));

        bad.extra.insert(CLASSES_KEY.to_string(), toml::Value::String("text".to_string()));
        assert!(DescriptorDataset::from_spec(&bad).is_err());
    }

    #[test]
    fn test_factory_concat_takes_first_member_classes() {
        let config = DatasetConfig::Concat(ConcatDataset {
            kind: ConcatKind::ConcatDataset,
            datasets: vec![spec("A", &["text"]), spec("B", &["word", "char"])],
            extra: toml::Table::new(),
        });
        let ds = DatasetFactory::new().build(&config).unwrap();
        assert_eq!(ds.kind(), "ConcatDataset");
        assert_eq!(ds.classes(), ["text".to_string()]);

        let summary = ds.summary();
        assert_eq!(summary.members.len(), 2);
        assert_eq!(summary.members[1].classes, vec!["word".to_string(), "char".to_string()]);
    }

    #[test]
    fn test_factory_uses_registered_builder() {
        #[derive(Debug)]
        struct Fixed;
        impl Dataset for Fixed {
            fn kind(&self) -> &str {
                "Fixed"
            }
            fn classes(&self) -> &[String] {
                &[]
            }
            fn pipeline(&self) -> &[PipelineStage] {
                &[]
            }
        }

        let mut factory = DatasetFactory::new();
        factory.register("Fixed", |_| Ok(Box::new(Fixed)));
        let ds = factory.build(&DatasetConfig::Single(spec("Fixed", &["x"]))).unwrap();
        assert!(ds.classes().is_empty());
    }
}
