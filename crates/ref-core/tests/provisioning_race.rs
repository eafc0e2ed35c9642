//! Concurrent `ensure` calls: one create per derived path, distinct paths in parallel.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ref_core::errors::{RefError, RefResult};
use ref_core::providers::EnvironmentSpec;
use ref_core::provisioner::{EnvironmentManager, Provisioner};

#[derive(Default)]
struct SlowCountingManager {
    creates: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl EnvironmentManager for SlowCountingManager {
    async fn create(&self, _spec: &EnvironmentSpec, target: &Path) -> RefResult<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let created = tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| RefError::provision(target, e.to_string()));

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        created
    }

    fn command(&self, _env: &Path, args: &[String]) -> Vec<String> {
        args.to_vec()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ensure_creates_once() {
    let dir = tempfile::tempdir().unwrap();
    let spec_path = dir.path().join("conda-lock.yml");
    std::fs::write(&spec_path, "dependencies: [numpy, xarray]\n").unwrap();

    let manager = Arc::new(SlowCountingManager::default());
    let provisioner = Arc::new(Provisioner::new(dir.path().join("envs"), manager.clone()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let provisioner = provisioner.clone();
        let spec = EnvironmentSpec::new(&spec_path);
        handles.push(tokio::spawn(async move { provisioner.ensure(&spec).await }));
    }

    let mut paths = Vec::new();
    for h in handles {
        paths.push(h.await.unwrap().unwrap());
    }

    assert_eq!(manager.creates.load(Ordering::SeqCst), 1);
    assert!(paths.windows(2).all(|w| w[0] == w[1]));
    assert!(paths[0].is_dir());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_specs_provision_in_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.yml");
    let b = dir.path().join("b.yml");
    std::fs::write(&a, "dependencies: [numpy]\n").unwrap();
    std::fs::write(&b, "dependencies: [scipy]\n").unwrap();

    let manager = Arc::new(SlowCountingManager::default());
    let provisioner = Arc::new(Provisioner::new(dir.path().join("envs"), manager.clone()));

    let pa = {
        let provisioner = provisioner.clone();
        tokio::spawn(async move { provisioner.ensure(&EnvironmentSpec::new(a)).await })
    };
    let pb = {
        let provisioner = provisioner.clone();
        tokio::spawn(async move { provisioner.ensure(&EnvironmentSpec::new(b)).await })
    };

    let pa = pa.await.unwrap().unwrap();
    let pb = pb.await.unwrap().unwrap();

    assert_ne!(pa, pb);
    assert_eq!(manager.creates.load(Ordering::SeqCst), 2);
    assert_eq!(manager.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn existing_environment_is_reused_across_provisioners() {
    let dir = tempfile::tempdir().unwrap();
    let spec_path = dir.path().join("conda-lock.yml");
    std::fs::write(&spec_path, "dependencies: [numpy]\n").unwrap();
    let spec = EnvironmentSpec::new(&spec_path);

    let first = Arc::new(SlowCountingManager::default());
    let path = Provisioner::new(dir.path().join("envs"), first.clone())
        .ensure(&spec)
        .await
        .unwrap();

    // A later process sees the directory and never calls the manager.
    let second = Arc::new(SlowCountingManager::default());
    let again = Provisioner::new(dir.path().join("envs"), second.clone())
        .ensure(&spec)
        .await
        .unwrap();

    assert_eq!(path, again);
    assert_eq!(first.creates.load(Ordering::SeqCst), 1);
    assert_eq!(second.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identical_spec_contents_share_one_environment() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("provider-a").join("conda-lock.yml");
    let second = dir.path().join("provider-b").join("conda-lock.yml");
    for path in [&first, &second] {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "dependencies: [esmvaltool]\n").unwrap();
    }

    let manager = Arc::new(SlowCountingManager::default());
    let provisioner = Arc::new(Provisioner::new(dir.path().join("envs"), manager.clone()));

    let a = {
        let provisioner = provisioner.clone();
        tokio::spawn(async move { provisioner.ensure(&EnvironmentSpec::new(first)).await })
    };
    let b = {
        let provisioner = provisioner.clone();
        tokio::spawn(async move { provisioner.ensure(&EnvironmentSpec::new(second)).await })
    };

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    assert_eq!(a, b);
    assert_eq!(manager.creates.load(Ordering::SeqCst), 1);
}
