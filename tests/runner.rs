#![cfg(unix)]

use std::{fs, path::Path, sync::Arc};

use tempfile::TempDir;
use vocal_remover_core::{
    core::memory::NoAccelerator,
    io::progress::silent,
    types::{ArchitectureKind, StemKind},
    InferenceAdapter, MemoryMonitor, ModePolicy, ModelDescriptor, ModelRegistry, ResidencyCache,
    RunnerAdapter, RunnerSettings, StemError, WorkerPool,
};

const MODEL: &str = "UVR_MDXNET_KARA_2.onnx";

struct Fixture {
    dir: TempDir,
    adapter: RunnerAdapter,
    descriptor: ModelDescriptor,
}

impl Fixture {
    /// Runner driven by `sh` with the given script body.
    fn new(script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("runner.sh");
        fs::write(&script_path, script).unwrap();
        fs::create_dir_all(dir.path().join("models")).unwrap();
        fs::write(dir.path().join("models").join(MODEL), b"weights").unwrap();

        let adapter = RunnerAdapter::new(RunnerSettings {
            program: "sh".into(),
            script: script_path,
        })
        .with_progress(silent());
        let descriptor = ModelDescriptor {
            id: MODEL.into(),
            url: "http://127.0.0.1:9/unused".into(),
            architecture: ArchitectureKind::MdxNet,
            primary_stem: StemKind::Vocals,
            description: String::new(),
            sha256: None,
        };
        Self {
            dir,
            adapter,
            descriptor,
        }
    }

    fn model_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("models")
    }

    fn out_dir(&self) -> std::path::PathBuf {
        let out = self.dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        out
    }
}

#[test]
fn successful_separation_joins_relative_paths() {
    let fx = Fixture::new(
        r#"echo "loading weights"
echo '{"event":"ready"}'
while read line; do
  echo '{"ok":true,"files":[{"path":"1_(Vocals).wav","label":"Vocals"},{"path":"/abs/2.wav","label":"Instrumental"}]}'
done
"#,
    );

    let weights = fx.adapter.load(&fx.descriptor, &fx.model_dir()).unwrap();
    let out = fx.out_dir();
    let artifacts = fx
        .adapter
        .separate(&fx.descriptor, &weights, Path::new("/in.wav"), &out)
        .unwrap();

    assert_eq!(artifacts.len(), 2);
    assert_eq!(artifacts[0].path, out.join("1_(Vocals).wav"));
    assert_eq!(artifacts[0].label, "Vocals");
    assert_eq!(artifacts[1].path, Path::new("/abs/2.wav"));

    // Second request on the same process.
    let again = fx
        .adapter
        .separate(&fx.descriptor, &weights, Path::new("/in.wav"), &out)
        .unwrap();
    assert_eq!(again, artifacts);

    fx.adapter.release(&fx.descriptor, weights);
}

#[test]
fn out_of_memory_response_is_typed() {
    let fx = Fixture::new(
        r#"echo '{"event":"ready"}'
while read line; do
  echo '{"ok":false,"kind":"out_of_memory","message":"CUDA out of memory"}'
done
"#,
    );

    let weights = fx.adapter.load(&fx.descriptor, &fx.model_dir()).unwrap();
    let err = fx
        .adapter
        .separate(&fx.descriptor, &weights, Path::new("/in.wav"), &fx.out_dir())
        .unwrap_err();

    assert!(err.is_out_of_memory());
    assert!(err.to_string().contains("CUDA out of memory"));
}

#[test]
fn startup_error_is_a_load_failure() {
    let fx = Fixture::new(
        r#"echo '{"event":"error","kind":"corrupt_checkpoint","message":"bad header"}'
read line
"#,
    );

    let err = fx
        .adapter
        .load(&fx.descriptor, &fx.model_dir())
        .err()
        .unwrap();
    assert!(matches!(err, StemError::ModelLoad { ref model_id, .. } if model_id == MODEL));
    assert!(err.to_string().contains("bad header"));
}

#[test]
fn startup_oom_keeps_its_kind() {
    let fx = Fixture::new(
        r#"echo '{"event":"error","kind":"out_of_memory","message":"no room"}'
"#,
    );

    let err = fx
        .adapter
        .load(&fx.descriptor, &fx.model_dir())
        .err()
        .unwrap();
    assert!(err.is_out_of_memory());
}

#[test]
fn exit_before_ready_is_a_load_failure() {
    let fx = Fixture::new("echo 'import failed'\nexit 3\n");

    let err = fx
        .adapter
        .load(&fx.descriptor, &fx.model_dir())
        .err()
        .unwrap();
    assert!(matches!(err, StemError::ModelLoad { .. }));
    assert!(err.to_string().contains("exited before becoming ready"));
}

#[test]
fn runner_exiting_mid_request_is_an_error() {
    let fx = Fixture::new(
        r#"echo '{"event":"ready"}'
read line
exit 1
"#,
    );

    let weights = fx.adapter.load(&fx.descriptor, &fx.model_dir()).unwrap();
    let err = fx
        .adapter
        .separate(&fx.descriptor, &weights, Path::new("/in.wav"), &fx.out_dir())
        .unwrap_err();
    assert!(!err.is_out_of_memory());
    assert!(err.to_string().contains("mid-request"));
    assert!(!fx.adapter.is_alive(&fx.descriptor, &weights));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cache_replaces_a_runner_that_died() {
    let fx = Fixture::new(
        r#"echo '{"event":"ready"}'
read line
exit 1
"#,
    );
    let adapter = Arc::new(RunnerAdapter::new(fx.adapter.settings().clone()).with_progress(silent()));
    let cache = ResidencyCache::new(
        Arc::new(ModelRegistry::builtin().unwrap()),
        adapter.clone() as Arc<dyn InferenceAdapter>,
        Arc::new(MemoryMonitor::new(Arc::new(NoAccelerator), 6.0)),
        WorkerPool::new(1, 1),
        fx.model_dir(),
        ModePolicy::default(),
    );

    let first = cache.acquire(MODEL).await.unwrap();
    let first_loaded = first.loaded_at();
    assert!(adapter.is_alive(first.descriptor(), first.weights()));
    let err = adapter
        .separate(first.descriptor(), first.weights(), Path::new("/in.wav"), &fx.out_dir())
        .unwrap_err();
    assert!(err.to_string().contains("mid-request"));
    drop(first);

    let second = cache.acquire(MODEL).await.unwrap();
    assert!(second.loaded_at() > first_loaded);
    assert!(adapter.is_alive(second.descriptor(), second.weights()));
    drop(second);

    let stats = cache.stats();
    assert_eq!(stats.loads, 2);
    assert_eq!(stats.evictions, 1);
    assert_eq!(cache.resident_ids(), vec![MODEL.to_string()]);
}

#[test]
fn missing_program_is_a_load_failure() {
    let fx = Fixture::new("");
    let adapter = RunnerAdapter::new(RunnerSettings {
        program: "definitely-not-a-python".into(),
        script: fx.dir.path().join("runner.sh"),
    })
    .with_progress(silent());

    let err = adapter
        .load(&fx.descriptor, &fx.model_dir())
        .err()
        .unwrap();
    assert!(matches!(err, StemError::ModelLoad { .. }));
}
