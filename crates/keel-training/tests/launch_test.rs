use keel_training::{
    CommandTrainer, EnvSnapshot, LaunchDriver, LaunchError, LaunchEvent, LaunchOptions, Launcher, MemoryConnector,
    ProgressSink, ResolveRequest, RunManifest,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const CONFIG: &str = r#"
workflow = [["train", 1], ["val", 1]]
total_epochs = 12

[model]
type = "DBNet"
backbone = { type = "ResNet", depth = 18 }

[data]
samples_per_gpu = 8

[data.train]
type = "IcdarDataset"
classes = ["text"]
ann_file = "instances_training.json"
pipeline = [{ type = "LoadImageFromFile" }, { type = "Resize" }, { type = "Normalize" }]

[data.val]
type = "IcdarDataset"
ann_file = "instances_test.json"
pipeline = [{ type = "OtherOp" }]

[checkpoint_config]
interval = 5
"#;

#[derive(Default)]
struct RecordingSink(Mutex<Vec<LaunchEvent>>);

impl ProgressSink for RecordingSink {
    fn on_event(&self, event: &LaunchEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

fn write_config(temp: &TempDir, text: &str) -> PathBuf {
    let path = temp.path().join("dbnet_r18.toml");
    std::fs::write(&path, text).unwrap();
    path
}

fn options(config: &Path, work_dir: &Path) -> LaunchOptions {
    let mut request = ResolveRequest::new(config);
    request.work_dir = Some(work_dir.to_path_buf());
    LaunchOptions { request, ..LaunchOptions::default() }
}

#[tokio::test]
async fn test_single_process_launch_writes_run_artifacts() {
    let temp = TempDir::new().unwrap();
    let config = write_config(&temp, CONFIG);
    let work_dir = temp.path().join("work");
    let sink = Arc::new(RecordingSink::default());

    let mut opts = options(&config, &work_dir);
    opts.seed = Some(42);
    let report = LaunchDriver::new()
        .with_env(EnvSnapshot::default())
        .with_progress(sink.clone())
        .launch(&opts)
        .await
        .unwrap();

    assert!(!report.context.is_distributed);
    assert_eq!(report.seed.seed, 42);
    assert_eq!(report.timestamp.len(), "20240101_120000".len());
    assert_eq!(report.config_file, work_dir.join("dbnet_r18.toml"));
    assert!(report.config_file.is_file());
    assert_eq!(report.log_file, work_dir.join(format!("{}.log", report.timestamp)));

    let events = sink.0.lock().unwrap().clone();
    assert!(matches!(&events[0], LaunchEvent::WorkDirReady { rank: 0, log_level, .. } if log_level == "INFO"));
    assert!(events.contains(&LaunchEvent::SeedAgreed { seed: 42 }));
    assert!(matches!(events.last(), Some(LaunchEvent::TrainerFinished { .. })));

    let handoff = report.outcome.handoff.expect("rank 0 writes the hand-off manifest");
    assert_eq!(handoff, work_dir.join(format!("{}.handoff.json", report.timestamp)));
    let manifest = RunManifest::read(&handoff).unwrap();
    assert_eq!(manifest.meta.seed, 42);
    assert_eq!(manifest.meta.exp_name, "dbnet_r18.toml");
    assert!(manifest.validate);
    assert_eq!(manifest.model.classes, vec!["text".to_string()]);
    assert!(manifest.model.init_seed.is_some());
    assert_eq!(manifest.datasets.len(), 2);
    assert_eq!(manifest.datasets[1].pipeline, vec!["LoadImageFromFile", "Resize", "Normalize"]);
    assert_eq!(manifest.config_sha256, keel_training::sha256_file(&report.config_file).unwrap());

    let meta = manifest.checkpoint_meta.unwrap();
    assert_eq!(meta.classes, vec!["text".to_string()]);
    assert!(meta.keel_version.starts_with(env!("CARGO_PKG_VERSION")));
}

#[tokio::test]
async fn test_no_validate_and_train_only_workflow() {
    let temp = TempDir::new().unwrap();
    let text = CONFIG.replace(r#"workflow = [["train", 1], ["val", 1]]"#, r#"workflow = [["train", 1]]"#);
    let config = write_config(&temp, &text);
    let work_dir = temp.path().join("work");

    let mut opts = options(&config, &work_dir);
    opts.no_validate = true;
    let report = LaunchDriver::new().with_env(EnvSnapshot::default()).launch(&opts).await.unwrap();

    let manifest = RunManifest::read(&report.outcome.handoff.unwrap()).unwrap();
    assert!(!manifest.validate);
    assert_eq!(manifest.datasets.len(), 1);
}

#[tokio::test]
async fn test_fixed_seed_policy_beats_command_line_seed() {
    let temp = TempDir::new().unwrap();
    let text = format!("seed_policy = {{ fixed = 3407 }}\n{CONFIG}");
    let config = write_config(&temp, &text);

    let mut opts = options(&config, &temp.path().join("work"));
    opts.seed = Some(1);
    let report = LaunchDriver::new().with_env(EnvSnapshot::default()).launch(&opts).await.unwrap();
    assert_eq!(report.seed.seed, 3407);
}

#[tokio::test]
async fn test_every_rank_agrees_on_the_seed() {
    let temp = TempDir::new().unwrap();
    let config = write_config(&temp, CONFIG);
    let work_dir = temp.path().join("work");
    let world = 3;
    let connector = Arc::new(MemoryConnector::new(world));

    let mut handles = Vec::new();
    for rank in 0..world {
        let connector = connector.clone();
        let mut opts = options(&config, &work_dir);
        opts.launcher = Launcher::Pytorch;
        handles.push(tokio::spawn(async move {
            let env = EnvSnapshot::from_pairs([
                ("RANK", rank.to_string()),
                ("WORLD_SIZE", world.to_string()),
                ("LOCAL_RANK", rank.to_string()),
                ("MASTER_ADDR", "127.0.0.1".to_string()),
            ]);
            LaunchDriver::new().with_env(env).with_connector(connector).launch(&opts).await.unwrap()
        }));
    }

    let mut reports = Vec::new();
    for handle in handles {
        reports.push(handle.await.unwrap());
    }
    let seed = reports[0].seed.seed;
    for (rank, report) in reports.iter().enumerate() {
        assert!(report.context.is_distributed);
        assert_eq!(report.context.rank, rank);
        assert_eq!(report.seed.seed, seed);
        assert_eq!(report.outcome.handoff.is_some(), rank == 0);
    }

    let manifest = RunManifest::read(reports[0].outcome.handoff.as_ref().unwrap()).unwrap();
    assert_eq!(manifest.distributed.world_size, world);
}

#[tokio::test]
async fn test_work_dir_creation_failure_is_fatal() {
    let temp = TempDir::new().unwrap();
    let config = write_config(&temp, CONFIG);
    let blocker = temp.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();

    let err = LaunchDriver::new()
        .with_env(EnvSnapshot::default())
        .launch(&options(&config, &blocker.join("work")))
        .await
        .unwrap_err();
    assert!(matches!(err, LaunchError::ResourceSetup { .. }));
}

#[tokio::test]
async fn test_distributed_launch_without_environment_fails() {
    let temp = TempDir::new().unwrap();
    let config = write_config(&temp, CONFIG);
    let mut opts = options(&config, &temp.path().join("work"));
    opts.launcher = Launcher::Slurm;

    let err = LaunchDriver::new().with_env(EnvSnapshot::default()).launch(&opts).await.unwrap_err();
    assert!(matches!(err, LaunchError::DistributedCoordination(_)));
    assert!(!temp.path().join("work").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_trainer_receives_run_environment() {
    let temp = TempDir::new().unwrap();
    let config = write_config(&temp, CONFIG);
    let mut opts = options(&config, &temp.path().join("work"));
    opts.seed = Some(7);

    let script = r#"test "$KEEL_SEED" = 7 && test "$KEEL_RANK" = 0 && test "$KEEL_WORLD_SIZE" = 1 && test -f "$KEEL_HANDOFF" && test -f "$KEEL_CONFIG""#;
    let trainer = CommandTrainer::new("sh", vec!["-c".to_string(), script.to_string()]);
    let report = LaunchDriver::new()
        .with_env(EnvSnapshot::default())
        .with_trainer(Arc::new(trainer))
        .launch(&opts)
        .await
        .unwrap();
    assert!(report.outcome.handoff.is_some());
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_trainer_failure_is_reported() {
    let temp = TempDir::new().unwrap();
    let config = write_config(&temp, CONFIG);

    let trainer = CommandTrainer::new("sh", vec!["-c".to_string(), "exit 3".to_string()]);
    let err = LaunchDriver::new()
        .with_env(EnvSnapshot::default())
        .with_trainer(Arc::new(trainer))
        .launch(&options(&config, &temp.path().join("work")))
        .await
        .unwrap_err();
    assert!(matches!(err, LaunchError::Trainer(_)));
}
