//! Final config values from the config file plus command-line inputs.

use crate::config::loader::load_table;
use crate::config::overrides::{apply_override, ConfigOverride};
use crate::config::TrainConfig;
use crate::distributed::DistributedContext;
use crate::error::{LaunchError, LaunchResult};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Default parent of derived work directories.
pub const DEFAULT_WORK_DIRS: &str = "./work_dirs";

/// Table a memory-cache fragment must define.
pub const MC_FILE_CLIENT_ARGS_KEY: &str = "mc_file_client_args";

/// Everything the caller supplies on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    pub config_path: PathBuf,
    pub work_dir: Option<PathBuf>,
    pub load_from: Option<PathBuf>,
    pub resume_from: Option<PathBuf>,
    pub gpus: Option<usize>,
    pub gpu_ids: Option<Vec<usize>>,
    /// Deprecated spelling of `cfg_options`.
    pub options: Vec<ConfigOverride>,
    pub cfg_options: Vec<ConfigOverride>,
    pub mc_config: Option<PathBuf>,
}

impl ResolveRequest {
    #[must_use]
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self { config_path: config_path.into(), ..Self::default() }
    }
}

/// A fully merged configuration ready to launch.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub config: TrainConfig,
    /// Path of the config file the run was started from.
    pub source: PathBuf,
    work_dir: PathBuf,
}

impl ResolvedConfig {
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// File name of the source config, used for the config dump and as the
    /// experiment name.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "config.toml".to_string())
    }

    /// The resolved config rendered as TOML.
    pub fn pretty_text(&self) -> LaunchResult<String> {
        Ok(toml::to_string_pretty(&self.config)?)
    }

    /// In a distributed run every rank of the group is a worker.
    pub fn apply_distributed(&mut self, context: &DistributedContext) {
        if context.is_distributed {
            self.config.gpu_ids = context.gpu_ids();
        }
    }

    pub fn record_seed(&mut self, seed: u64) {
        self.config.seed = Some(seed);
    }
}

#[derive(Debug, Clone)]
pub struct ConfigResolver {
    work_dirs_root: PathBuf,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new(DEFAULT_WORK_DIRS)
    }
}

impl ConfigResolver {
    #[must_use]
    pub fn new(work_dirs_root: impl Into<PathBuf>) -> Self {
        Self { work_dirs_root: work_dirs_root.into() }
    }

    pub fn resolve(&self, request: &ResolveRequest) -> LaunchResult<ResolvedConfig> {
        let overrides = select_overrides(request)?;

        let mut table = load_table(&request.config_path)?;
        for over in overrides {
            apply_override(&mut table, over)?;
        }
        let mut config = TrainConfig::from_table(table)?;

        if let Some(mc_path) = &request.mc_config {
            let fragment = load_table(mc_path)?;
            let args = fragment
                .get(MC_FILE_CLIENT_ARGS_KEY)
                .and_then(toml::Value::as_table)
                .ok_or_else(|| {
                    LaunchError::config(format!(
                        "memory-cache config {} does not define a [{MC_FILE_CLIENT_ARGS_KEY}] table",
                        mc_path.display()
                    ))
                })?;
            config.data.train = config.data.train.with_file_client_args(args)?;
        }

        let work_dir = resolve_work_dir(
            request.work_dir.as_deref(),
            config.work_dir.as_deref(),
            &request.config_path,
            &self.work_dirs_root,
        );
        config.work_dir = Some(work_dir.clone());

        if let Some(load_from) = &request.load_from {
            config.load_from = Some(load_from.clone());
        }
        if let Some(resume_from) = &request.resume_from {
            config.resume_from = Some(resume_from.clone());
        }
        config.gpu_ids = resolve_gpu_ids(request.gpu_ids.as_deref(), request.gpus, &config.gpu_ids)?;

        config.validate()?;
        Ok(ResolvedConfig { config, source: request.config_path.clone(), work_dir })
    }
}

/// Pick the override list to merge. The deprecated list is accepted on its
/// own with a warning; supplying both is an error.
pub fn select_overrides(request: &ResolveRequest) -> LaunchResult<&[ConfigOverride]> {
    match (request.options.is_empty(), request.cfg_options.is_empty()) {
        (false, false) => Err(LaunchError::config(
            "--options and --cfg-options cannot be both specified, --options is deprecated in favor of --cfg-options",
        )),
        (false, true) => {
            warn!("--options is deprecated in favor of --cfg-options");
            Ok(&request.options)
        }
        _ => Ok(&request.cfg_options),
    }
}

/// Command line, then the config file, then `<root>/<config stem>`.
#[must_use]
pub fn resolve_work_dir(
    cli: Option<&Path>,
    from_config: Option<&Path>,
    config_path: &Path,
    work_dirs_root: &Path,
) -> PathBuf {
    if let Some(dir) = cli {
        return dir.to_path_buf();
    }
    if let Some(dir) = from_config {
        return dir.to_path_buf();
    }
    let stem = config_path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    work_dirs_root.join(stem)
}

/// Explicit ids, then a worker count, then the config value, then `[0]`.
pub fn resolve_gpu_ids(
    cli_ids: Option<&[usize]>,
    cli_gpus: Option<usize>,
    from_config: &[usize],
) -> LaunchResult<Vec<usize>> {
    match (cli_ids, cli_gpus) {
        (Some(_), Some(_)) => Err(LaunchError::config("--gpus and --gpu-ids are mutually exclusive")),
        (Some([]), None) => Err(LaunchError::config("--gpu-ids needs at least one id")),
        (Some(ids), None) => Ok(ids.to_vec()),
        (None, Some(0)) => Err(LaunchError::config("--gpus must be at least 1")),
        (None, Some(count)) => Ok((0..count).collect()),
        (None, None) if from_config.is_empty() => Ok(vec![0]),
        (None, None) => Ok(from_config.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatasetConfig, FILE_CLIENT_ARGS_KEY};
    use tempfile::TempDir;

    const CONFIG: &str = r#"
[model]
type = "DBNet"

[data.train]
type = "IcdarDataset"
pipeline = [{ type = "LoadImageFromFile" }, { type = "Normalize" }]

[optimizer]
type = "SGD"
lr = 0.007
"#;

    fn write(temp: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = temp.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn over(arg: &str) -> ConfigOverride {
        arg.parse().unwrap()
    }

    #[test]
    fn test_both_override_mechanisms_rejected() {
        let temp = TempDir::new().unwrap();
        let mut request = ResolveRequest::new(write(&temp, "dbnet.toml", CONFIG));
        request.options = vec![over("optimizer.lr=0.1")];
        request.cfg_options = vec![over("optimizer.lr=0.2")];

        let err = ConfigResolver::default().resolve(&request).unwrap_err();
        assert!(matches!(err, LaunchError::Configuration(_)));
    }

    #[test]
    fn test_deprecated_options_applied_alone() {
        let temp = TempDir::new().unwrap();
        let mut request = ResolveRequest::new(write(&temp, "dbnet.toml", CONFIG));
        request.options = vec![over("optimizer.lr=0.1")];

        let resolved = ConfigResolver::default().resolve(&request).unwrap();
        let lr = resolved.config.optimizer.as_ref().unwrap()["lr"].as_float();
        assert_eq!(lr, Some(0.1));
    }

    #[test]
    fn test_unknown_override_key_rejected() {
        let temp = TempDir::new().unwrap();
        let mut request = ResolveRequest::new(write(&temp, "dbnet.toml", CONFIG));
        request.cfg_options = vec![over("not_a_field=1")];
        assert!(ConfigResolver::default().resolve(&request).is_err());
    }

    #[test]
    fn test_work_dir_precedence() {
        let config_path = Path::new("configs/textdet/dbnet_r18.toml");
        let root = Path::new("./work_dirs");

        assert_eq!(
            resolve_work_dir(Some(Path::new("cli")), Some(Path::new("cfg")), config_path, root),
            PathBuf::from("cli")
        );
        assert_eq!(
            resolve_work_dir(None, Some(Path::new("cfg")), config_path, root),
            PathBuf::from("cfg")
        );
        assert_eq!(
            resolve_work_dir(None, None, config_path, root),
            PathBuf::from("./work_dirs/dbnet_r18")
        );
    }

    #[test]
    fn test_work_dir_from_config_file_and_cli() {
        let temp = TempDir::new().unwrap();
        let with_dir = format!("work_dir = \"from_config\"\n{CONFIG}");
        let mut request = ResolveRequest::new(write(&temp, "dbnet.toml", &with_dir));

        let resolved = ConfigResolver::new(temp.path()).resolve(&request).unwrap();
        assert_eq!(resolved.work_dir(), Path::new("from_config"));

        request.work_dir = Some(PathBuf::from("from_cli"));
        let resolved = ConfigResolver::new(temp.path()).resolve(&request).unwrap();
        assert_eq!(resolved.work_dir(), Path::new("from_cli"));
        assert_eq!(resolved.config.work_dir.as_deref(), Some(Path::new("from_cli")));
    }

    #[test]
    fn test_gpu_ids_resolution() {
        assert_eq!(resolve_gpu_ids(None, None, &[]).unwrap(), vec![0]);
        assert_eq!(resolve_gpu_ids(None, Some(3), &[5]).unwrap(), vec![0, 1, 2]);
        assert_eq!(resolve_gpu_ids(Some(&[2, 3]), None, &[5]).unwrap(), vec![2, 3]);
        assert_eq!(resolve_gpu_ids(None, None, &[5]).unwrap(), vec![5]);
        assert!(resolve_gpu_ids(Some(&[1]), Some(2), &[]).is_err());
        assert!(resolve_gpu_ids(None, Some(0), &[]).is_err());
    }

    #[test]
    fn test_checkpoint_paths_cli_wins() {
        let temp = TempDir::new().unwrap();
        let text = format!("load_from = \"a.pth\"\nresume_from = \"b.pth\"\n{CONFIG}");
        let mut request = ResolveRequest::new(write(&temp, "dbnet.toml", &text));
        request.resume_from = Some(PathBuf::from("latest.pth"));

        let resolved = ConfigResolver::new(temp.path()).resolve(&request).unwrap();
        assert_eq!(resolved.config.load_from.as_deref(), Some(Path::new("a.pth")));
        assert_eq!(resolved.config.resume_from.as_deref(), Some(Path::new("latest.pth")));
    }

    #[test]
    fn test_memory_cache_applied_to_each_concat_member() {
        let temp = TempDir::new().unwrap();
        let text = r#"
[model]
type = "DBNet"

[[data.train]]
type = "IcdarDataset"
pipeline = [{ type = "LoadImageFromFile" }, { type = "Resize" }]

[[data.train]]
type = "TextDetDataset"
pipeline = [{ type = "LoadImageFromFile" }]

[[data.train]]
type = "IcdarDataset"
pipeline = [{ type = "LoadImageFromLmdb" }, { type = "Normalize" }]
"#;
        let mut request = ResolveRequest::new(write(&temp, "concat.toml", text));
        request.mc_config = Some(write(
            &temp,
            "mc.toml",
            "[mc_file_client_args]\nbackend = \"memcached\"\nserver_list_cfg = \"/mc/server_list.conf\"\n",
        ));

        let resolved = ConfigResolver::new(temp.path()).resolve(&request).unwrap();
        let DatasetConfig::List(members) = &resolved.config.data.train else {
            panic!("expected list form");
        };
        assert_eq!(members.len(), 3);
        for member in members {
            let args = member.pipeline[0].args[FILE_CLIENT_ARGS_KEY].as_table().unwrap();
            assert_eq!(args["backend"].as_str(), Some("memcached"));
            assert!(member.pipeline.iter().skip(1).all(|s| !s.args.contains_key(FILE_CLIENT_ARGS_KEY)));
        }
    }

    #[test]
    fn test_memory_cache_without_table_rejected() {
        let temp = TempDir::new().unwrap();
        let mut request = ResolveRequest::new(write(&temp, "dbnet.toml", CONFIG));
        request.mc_config = Some(write(&temp, "mc.toml", "backend = \"memcached\"\n"));
        assert!(ConfigResolver::default().resolve(&request).is_err());
    }

    #[test]
    fn test_apply_distributed_overrides_gpu_ids() {
        let temp = TempDir::new().unwrap();
        let request = ResolveRequest { gpus: Some(1), ..ResolveRequest::new(write(&temp, "dbnet.toml", CONFIG)) };
        let mut resolved = ConfigResolver::new(temp.path()).resolve(&request).unwrap();
        assert_eq!(resolved.config.gpu_ids, vec![0]);

        let ctx = DistributedContext::new(crate::distributed::Launcher::Pytorch, 1, 4, 1).unwrap();
        resolved.apply_distributed(&ctx);
        assert_eq!(resolved.config.gpu_ids, vec![0, 1, 2, 3]);
        assert_eq!(resolved.file_name(), "dbnet.toml");
    }
}
