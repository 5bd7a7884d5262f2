// src/remote/mod.rs

//! Remote builds
//!
//! The project directory is bundled, uploaded once, and one build job is
//! dispatched per requested architecture. Jobs are awaited concurrently,
//! each on its own scoped thread polling the job status; the results are
//! then reduced in dispatch order. An interrupted wait leaves the jobs
//! running on the service and can be picked up with `remote resume`.

pub mod bundle;
pub mod client;
pub mod protocol;

pub use client::HttpTransport;
pub use protocol::{
    AgentInfo, Architecture, ArtifactResponse, BuildRequest, BuildResponse, BuildStatus,
    StatusResponse, UploadResponse,
};

use crate::error::{Error, Result};
use crate::progress::{Pipeline, StepStatus};
use crate::signal::CancelToken;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Status poll cadence
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Transport to a remote build service
pub trait RemoteTransport: Send + Sync {
    fn upload_bundle(&self, bundle: &Path) -> Result<UploadResponse>;

    fn build(&self, request: &BuildRequest) -> Result<BuildResponse>;

    fn status(&self, job_id: &str) -> Result<StatusResponse>;

    fn artifact(&self, job_id: &str) -> Result<ArtifactResponse>;

    fn list_agents(&self) -> Result<Vec<AgentInfo>>;

    fn agent_info(&self, name: &str) -> Result<AgentInfo>;

    /// Store the artifact at `url` in `dest`; returns the byte count
    fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// A dispatched job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteJob {
    pub job_id: String,
    pub arch: Architecture,
}

fn stage(job_id: &str) -> String {
    format!("remote/{}", job_id)
}

fn pipeline_status(status: BuildStatus) -> StepStatus {
    match status {
        BuildStatus::Unknown | BuildStatus::Queued => StepStatus::Waiting,
        BuildStatus::Sourcing | BuildStatus::Building | BuildStatus::Packing => {
            StepStatus::Working
        }
        BuildStatus::Done => StepStatus::Done,
        BuildStatus::Failed => StepStatus::Failed,
    }
}

pub struct RemoteBuilder<'a> {
    transport: &'a dyn RemoteTransport,
    cancel: CancelToken,
    poll_interval: Duration,
}

impl<'a> RemoteBuilder<'a> {
    pub fn new(transport: &'a dyn RemoteTransport) -> Self {
        Self {
            transport,
            cancel: CancelToken::new(),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bundle and upload the project, then dispatch one job per architecture
    pub fn submit(
        &self,
        project_dir: &Path,
        recipe: &str,
        platform: &str,
        archs: &[String],
    ) -> Result<Vec<RemoteJob>> {
        let archs = archs
            .iter()
            .map(|arch| {
                Architecture::from_arch(arch).ok_or_else(|| {
                    Error::Usage(format!("architecture '{}' cannot be built remotely", arch))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if archs.is_empty() {
            return Err(Error::Usage("no architecture to build".to_string()));
        }

        let bundle = tempfile::Builder::new()
            .prefix("bake-bundle-")
            .suffix(".tar.gz")
            .tempfile()?;
        let stats = bundle::write_bundle(project_dir, bundle.as_file())?;
        info!(
            "Uploading source bundle ({} files, {} bytes)",
            stats.files, stats.bytes
        );
        let upload = self.transport.upload_bundle(bundle.path())?;
        self.cancel.check()?;

        let mut jobs = Vec::with_capacity(archs.len());
        for arch in archs {
            let response = self.transport.build(&BuildRequest {
                bundle_id: upload.bundle_id.clone(),
                recipe: recipe.to_string(),
                platform: platform.to_string(),
                arch,
            })?;
            info!("Dispatched {} build as job {}", arch, response.job_id);
            jobs.push(RemoteJob {
                job_id: response.job_id,
                arch,
            });
        }
        Ok(jobs)
    }

    /// Poll one job until it reaches a terminal status
    fn await_job(&self, job_id: &str, pipeline: &dyn Pipeline) -> Result<StatusResponse> {
        let stage = stage(job_id);
        let mut last = None;
        loop {
            self.cancel.check()?;
            let status = self.transport.status(job_id)?;
            if last != Some(status.status) {
                debug!("Job {} is {}", job_id, status.status);
                pipeline.update(&stage, pipeline_status(status.status));
                last = Some(status.status);
            }
            if status.status.is_terminal() {
                return Ok(status);
            }
            let deadline = Instant::now() + self.poll_interval;
            while Instant::now() < deadline {
                if self.cancel.is_cancelled() {
                    break;
                }
                std::thread::sleep(self.poll_interval.min(Duration::from_millis(100)));
            }
        }
    }

    /// Wait for every job; fails when any job failed
    pub fn wait(&self, job_ids: &[String], pipeline: &dyn Pipeline) -> Result<Vec<StatusResponse>> {
        let stages: Vec<String> = job_ids.iter().map(|id| stage(id)).collect();
        pipeline.begin(&stages);

        let results: Vec<Result<StatusResponse>> = std::thread::scope(|scope| {
            let handles: Vec<_> = job_ids
                .iter()
                .map(|id| scope.spawn(move || self.await_job(id, pipeline)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(Error::Fatal("job waiter panicked".to_string())))
                })
                .collect()
        });

        let mut statuses = Vec::with_capacity(results.len());
        let mut failed = Vec::new();
        for result in results {
            let status = match result {
                Ok(status) => status,
                Err(e) => {
                    pipeline.finish(None);
                    return Err(e);
                }
            };
            if status.status == BuildStatus::Failed {
                warn!(
                    "Job {} ({}) failed: {}",
                    status.job_id,
                    status.arch,
                    status.message.as_deref().unwrap_or("no details")
                );
                failed.push(status.job_id.clone());
            }
            statuses.push(status);
        }
        pipeline.finish(None);

        if !failed.is_empty() {
            return Err(Error::RemoteError(format!(
                "job(s) failed: {}",
                failed.join(", ")
            )));
        }
        Ok(statuses)
    }

    /// Fetch the artifacts of a finished job into `out_dir`
    pub fn download(&self, job_id: &str, out_dir: &Path) -> Result<Vec<PathBuf>> {
        let status = self.transport.status(job_id)?;
        if status.status != BuildStatus::Done {
            return Err(Error::RemoteError(format!(
                "job {} is {}, not done",
                job_id, status.status
            )));
        }
        let artifacts = self.transport.artifact(job_id)?;
        fs::create_dir_all(out_dir)?;

        let mut paths = Vec::with_capacity(artifacts.urls.len());
        for url in &artifacts.urls {
            let name = artifact_name(url)?;
            let dest = out_dir.join(name);
            let bytes = self.transport.download(url, &dest)?;
            info!("Downloaded {} ({} bytes)", dest.display(), bytes);
            paths.push(dest);
        }
        Ok(paths)
    }
}

/// File name of an artifact URL
fn artifact_name(url: &str) -> Result<String> {
    let parsed =
        url::Url::parse(url).map_err(|e| Error::RemoteError(format!("artifact URL {}: {}", url, e)))?;
    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty() && *name != "..")
        .map(str::to_string)
        .ok_or_else(|| Error::RemoteError(format!("artifact URL {} has no file name", url)))
}

/// Command line that resumes waiting for `jobs`
pub fn resume_hint(jobs: &[String]) -> String {
    format!("bake remote resume {}", jobs.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentPipeline;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Scripted service: each status call pops the next status of the job
    #[derive(Default)]
    struct FakeService {
        uploads: Mutex<Vec<usize>>,
        requests: Mutex<Vec<BuildRequest>>,
        statuses: Mutex<HashMap<String, Vec<BuildStatus>>>,
        arches: Mutex<HashMap<String, Architecture>>,
    }

    impl FakeService {
        fn script(&self, job: &str, arch: Architecture, statuses: &[BuildStatus]) {
            self.statuses
                .lock()
                .unwrap()
                .insert(job.to_string(), statuses.to_vec());
            self.arches.lock().unwrap().insert(job.to_string(), arch);
        }
    }

    impl RemoteTransport for FakeService {
        fn upload_bundle(&self, bundle: &Path) -> Result<UploadResponse> {
            let size = fs::metadata(bundle)?.len() as usize;
            self.uploads.lock().unwrap().push(size);
            Ok(UploadResponse {
                bundle_id: "b1".to_string(),
            })
        }

        fn build(&self, request: &BuildRequest) -> Result<BuildResponse> {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            Ok(BuildResponse {
                job_id: format!("job{}", requests.len()),
            })
        }

        fn status(&self, job_id: &str) -> Result<StatusResponse> {
            let mut statuses = self.statuses.lock().unwrap();
            let queue = statuses
                .get_mut(job_id)
                .ok_or_else(|| Error::NotFound(job_id.to_string()))?;
            let status = if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue[0]
            };
            Ok(StatusResponse {
                job_id: job_id.to_string(),
                status,
                arch: self.arches.lock().unwrap()[job_id],
                message: None,
            })
        }

        fn artifact(&self, job_id: &str) -> Result<ArtifactResponse> {
            Ok(ArtifactResponse {
                job_id: job_id.to_string(),
                urls: vec!["https://builds.example.org/out/zlib-1.3.pack".to_string()],
            })
        }

        fn list_agents(&self) -> Result<Vec<AgentInfo>> {
            Ok(Vec::new())
        }

        fn agent_info(&self, name: &str) -> Result<AgentInfo> {
            Err(Error::NotFound(format!("agent {}", name)))
        }

        fn download(&self, _url: &str, dest: &Path) -> Result<u64> {
            fs::write(dest, b"pack")?;
            Ok(4)
        }
    }

    fn builder(service: &FakeService) -> RemoteBuilder<'_> {
        RemoteBuilder::new(service).with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_submit_dispatches_one_job_per_arch() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("recipe.yaml"), "project: {}").unwrap();
        let service = FakeService::default();
        let jobs = builder(&service)
            .submit(
                dir.path(),
                "recipe.yaml",
                "linux",
                &["amd64".to_string(), "aarch64".to_string()],
            )
            .unwrap();

        assert_eq!(service.uploads.lock().unwrap().len(), 1);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].arch, Architecture::Arm64);
        let requests = service.requests.lock().unwrap();
        assert!(requests.iter().all(|r| r.bundle_id == "b1" && r.platform == "linux"));
    }

    #[test]
    fn test_unknown_arch_is_rejected_before_upload() {
        let dir = TempDir::new().unwrap();
        let service = FakeService::default();
        let result = builder(&service).submit(dir.path(), "recipe.yaml", "linux", &["sparc".to_string()]);
        assert!(matches!(result, Err(Error::Usage(_))));
        assert!(service.uploads.lock().unwrap().is_empty());
    }

    #[test]
    fn test_wait_reduces_in_dispatch_order() {
        let service = FakeService::default();
        service.script(
            "a",
            Architecture::X64,
            &[BuildStatus::Queued, BuildStatus::Building, BuildStatus::Done],
        );
        service.script("b", Architecture::Arm64, &[BuildStatus::Sourcing, BuildStatus::Done]);
        let pipeline = SilentPipeline::new();
        let statuses = builder(&service)
            .wait(&["a".to_string(), "b".to_string()], &pipeline)
            .unwrap();
        assert_eq!(statuses[0].job_id, "a");
        assert_eq!(statuses[1].arch, Architecture::Arm64);
        assert_eq!(pipeline.status("remote/a"), Some(StepStatus::Done));
        assert_eq!(pipeline.status("remote/b"), Some(StepStatus::Done));
    }

    #[test]
    fn test_wait_reports_failed_jobs() {
        let service = FakeService::default();
        service.script("a", Architecture::X64, &[BuildStatus::Done]);
        service.script("b", Architecture::Riscv64, &[BuildStatus::Building, BuildStatus::Failed]);
        let pipeline = SilentPipeline::new();
        let err = builder(&service)
            .wait(&["a".to_string(), "b".to_string()], &pipeline)
            .unwrap_err();
        assert!(err.to_string().contains("b"));
        assert_eq!(pipeline.status("remote/b"), Some(StepStatus::Failed));
    }

    #[test]
    fn test_cancelled_wait() {
        let service = FakeService::default();
        service.script("a", Architecture::X64, &[BuildStatus::Building]);
        let cancel = CancelToken::new();
        cancel.cancel(2);
        let result = builder(&service)
            .with_cancel(cancel)
            .wait(&["a".to_string()], &SilentPipeline::new());
        assert!(matches!(result, Err(Error::Cancelled(2))));
        assert_eq!(resume_hint(&["a".to_string()]), "bake remote resume a");
    }

    #[test]
    fn test_download_requires_done() {
        let dir = TempDir::new().unwrap();
        let service = FakeService::default();
        service.script("a", Architecture::X64, &[BuildStatus::Packing]);
        assert!(builder(&service).download("a", dir.path()).is_err());

        service.script("a", Architecture::X64, &[BuildStatus::Done]);
        let paths = builder(&service).download("a", dir.path()).unwrap();
        assert_eq!(paths, vec![dir.path().join("zlib-1.3.pack")]);
        assert_eq!(fs::read(&paths[0]).unwrap(), b"pack");
    }

    #[test]
    fn test_artifact_name() {
        assert_eq!(artifact_name("https://x.org/a/b.pack?sig=1").unwrap(), "b.pack");
        assert!(artifact_name("https://x.org/").is_err());
    }
}
