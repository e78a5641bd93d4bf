//! Concurrent script execution.
//!
//! Every planned execution gets its own tokio task. Before dispatching, a task enters the lane
//! of its resource (at most one execution per resource at a time) and then takes a permit from
//! the optional global limiter. Lane first, so a task queued behind a busy resource never sits
//! on global capacity. Tasks report back over a channel tagged with their input index, which is
//! how results come out in input order whatever order they finish in.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::descriptor::{template_registry, ExecutionDescriptor};
use crate::directory::ResourceDirectory;
use crate::dispatch::{CommandOutput, Dispatch};
use crate::error::{ErrorKind, MeshError};
use crate::resolver::{Cardinality, TargetResolver};
use crate::resource::Resource;
use crate::result::ExecutionResult;
use crate::sync::Lanes;

/// Message sent from a worker task when its execution is over.
#[derive(Debug)]
struct JobCompletion {
    /// Position of the execution in the plan.
    index: usize,
    result: ExecutionResult,
}

/// A resolved execution, or the result explaining why there is nothing to run.
enum Planned {
    Ready {
        descriptor: ExecutionDescriptor,
        resource: Resource,
    },
    Rejected(ExecutionResult),
}

/// Everything a worker task needs. Cheap to clone.
#[derive(Clone)]
struct Workers {
    dispatcher: Arc<dyn Dispatch>,
    limiter: Option<Arc<Semaphore>>,
    lanes: Arc<Lanes>,
    cancel: CancellationToken,
}

pub struct Engine {
    directory: Arc<ResourceDirectory>,
    workers: Workers,
}

impl Engine {
    pub fn new(directory: Arc<ResourceDirectory>, dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            directory,
            workers: Workers {
                dispatcher,
                limiter: None,
                lanes: Arc::new(Lanes::new()),
                cancel: CancellationToken::new(),
            },
        }
    }

    /// Caps how many executions run at once across all resources. `None` means no cap
    /// beyond one execution per resource; a cap of zero is treated as one.
    pub fn with_max_concurrency(mut self, max_concurrency: Option<usize>) -> Self {
        self.workers.limiter =
            max_concurrency.map(|max| Arc::new(Semaphore::new(max.max(1))));
        self
    }

    /// Kills in-flight executions and turns every unfinished one into a cancelled result.
    /// Results that were already complete are kept.
    pub fn cancel(&self) {
        tracing::warn!("cancelling in-flight executions");
        self.workers.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.workers.cancel.clone()
    }

    /// Runs each descriptor against the single resource it names.
    ///
    /// `result[i]` always answers `descriptors[i]`. A label matching several resources is an
    /// ambiguity error for that descriptor.
    pub async fn execute(&self, descriptors: &[ExecutionDescriptor]) -> Vec<ExecutionResult> {
        let resolver = TargetResolver::new(&self.directory);
        let plan = descriptors
            .iter()
            .map(|descriptor| match resolver.resolve(descriptor) {
                Ok(resource) => Planned::Ready {
                    descriptor: descriptor.clone(),
                    resource,
                },
                Err(e) => Planned::Rejected(rejected(descriptor, &e)),
            })
            .collect();
        self.run(plan).await
    }

    /// Runs each descriptor against every resource it selects.
    ///
    /// Results follow descriptor order, then directory order within one descriptor. A selector
    /// matching nothing still yields one dispatch error result.
    pub async fn fan_out(&self, descriptors: &[ExecutionDescriptor]) -> Vec<ExecutionResult> {
        let resolver = TargetResolver::new(&self.directory);
        let mut plan = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            match resolver.resolve_with(descriptor, Cardinality::Many) {
                Ok(resources) => {
                    plan.extend(resources.into_iter().map(|resource| Planned::Ready {
                        descriptor: descriptor.pinned_to(&resource.name),
                        resource,
                    }))
                }
                Err(e) => plan.push(Planned::Rejected(rejected(descriptor, &e))),
            }
        }
        self.run(plan).await
    }

    async fn run(&self, plan: Vec<Planned>) -> Vec<ExecutionResult> {
        let total = plan.len();
        let mut slots: Vec<Option<ExecutionResult>> = vec![None; total];
        let mut names = Vec::with_capacity(total);

        let (completion_tx, completion_rx) = flume::unbounded::<JobCompletion>();
        let mut tasks = Vec::new();
        for (index, planned) in plan.into_iter().enumerate() {
            match planned {
                Planned::Rejected(result) => {
                    names.push(result.resource().to_owned());
                    slots[index] = Some(result);
                }
                Planned::Ready {
                    descriptor,
                    resource,
                } => {
                    names.push(resource.name.clone());
                    tasks.push(spawn_execution(
                        self.workers.clone(),
                        index,
                        descriptor,
                        resource,
                        completion_tx.clone(),
                    ));
                }
            }
        }
        // The loop below ends once every worker has dropped its sender.
        drop(completion_tx);

        while let Ok(JobCompletion { index, result }) = completion_rx.recv_async().await {
            slots[index] = Some(result);
        }
        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "execution worker died");
            }
        }

        // A worker that panicked never reported; it still gets a result.
        slots
            .into_iter()
            .zip(names)
            .map(|(slot, name)| {
                slot.unwrap_or_else(|| {
                    ExecutionResult::dispatch_error(
                        name,
                        ErrorKind::Internal,
                        "execution worker exited without reporting a result".to_string(),
                    )
                })
            })
            .collect()
    }
}

fn rejected(descriptor: &ExecutionDescriptor, error: &MeshError) -> ExecutionResult {
    tracing::warn!(selector = %descriptor.selector(), error = %error, "resolution failed");
    ExecutionResult::from_error(descriptor.selector().to_string(), error)
}

fn spawn_execution(
    workers: Workers,
    index: usize,
    descriptor: ExecutionDescriptor,
    resource: Resource,
    completion_tx: flume::Sender<JobCompletion>,
) -> tokio::task::JoinHandle<()> {
    let span = tracing::info_span!("execution", resource = %resource.name, index);
    tokio::spawn(
        async move {
            let name = resource.name.clone();
            let work = async {
                let _lane = workers.lanes.enter(&name).await;
                let _permit = match &workers.limiter {
                    Some(limiter) => match Arc::clone(limiter).acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            return ExecutionResult::dispatch_error(
                                name.clone(),
                                ErrorKind::Internal,
                                "concurrency limiter was closed".to_string(),
                            )
                        }
                    },
                    None => None,
                };
                run_on(workers.dispatcher.as_ref(), &descriptor, &resource).await
            };
            let result = tokio::select! {
                biased;
                _ = workers.cancel.cancelled() => {
                    tracing::warn!("cancelled");
                    ExecutionResult::dispatch_error(
                        name.clone(),
                        ErrorKind::Cancelled,
                        "cancelled before the execution finished".to_string(),
                    )
                }
                result = work => result,
            };
            // The receiver only goes away if the engine itself was dropped.
            let _ = completion_tx.send(JobCompletion { index, result });
        }
        .instrument(span),
    )
}

/// Resolves the target, prepares the script and dispatches it.
async fn run_on(
    dispatcher: &dyn Dispatch,
    descriptor: &ExecutionDescriptor,
    resource: &Resource,
) -> ExecutionResult {
    let outcome: Result<CommandOutput, MeshError> = async {
        let target = descriptor.target_for(resource)?;
        let script = descriptor.script().load().await?;
        let script = descriptor.render(&mut template_registry(), script, resource)?;
        tracing::info!(kind = %target.kind(), script = %descriptor.script(), "dispatching");
        dispatcher.dispatch(resource, &target, &script).await
    }
    .await;

    match outcome {
        Ok(output) => {
            tracing::info!(exit_code = ?output.exit_code, "finished");
            ExecutionResult::completed(resource.name.clone(), output)
        }
        Err(e) => {
            let detail = resource.redact(&e.to_string());
            tracing::warn!(error = %detail, "dispatch failed");
            ExecutionResult::dispatch_error(resource.name.clone(), e.kind(), detail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Script;
    use crate::resource::{ConnectionSpec, Kind, Target};
    use crate::result::Status;
    use async_trait::async_trait;

    /// Echoes the script back as stdout; `fail` exits 1, `panic` panics.
    struct EchoDispatcher;

    #[async_trait]
    impl Dispatch for EchoDispatcher {
        async fn dispatch(
            &self,
            resource: &Resource,
            _target: &Target,
            script: &str,
        ) -> Result<CommandOutput, MeshError> {
            match script {
                "panic" => panic!("dispatcher blew up"),
                "unreachable" => Err(MeshError::Connection {
                    target: resource.name.clone(),
                    detail: "No route to host".to_string(),
                }),
                _ => Ok(CommandOutput {
                    exit_code: Some(if script == "fail" { 1 } else { 0 }),
                    stdout: format!("{}:{}", resource.name, script).into_bytes(),
                    stderr: Vec::new(),
                }),
            }
        }
    }

    fn engine() -> Engine {
        let directory = ResourceDirectory::new();
        for name in ["web1", "web2"] {
            directory
                .put(
                    name,
                    ConnectionSpec {
                        labels: vec!["prod".to_string()],
                        kind: Kind::Remote,
                        username: Some("ubuntu".to_string()),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        Engine::new(Arc::new(directory), Arc::new(EchoDispatcher))
    }

    fn descriptor(selector: &str, script: &str) -> ExecutionDescriptor {
        ExecutionDescriptor::new(selector.parse().unwrap(), Script::Inline(script.into()))
    }

    #[tokio::test]
    async fn test_results_are_index_correlated() {
        let results = engine()
            .execute(&[
                descriptor("web2", "a"),
                descriptor("ghost", "b"),
                descriptor("web1", "fail"),
                descriptor("label:prod", "c"),
            ])
            .await;
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].resource(), "web2");
        assert_eq!(results[0].stdout(), b"web2:a");
        assert_eq!(results[1].status(), Status::DispatchError);
        assert_eq!(results[1].error_kind(), Some(ErrorKind::NotFound));
        assert_eq!(results[2].status(), Status::Failed);
        assert_eq!(results[2].exit_code(), Some(1));
        assert_eq!(results[3].error_kind(), Some(ErrorKind::AmbiguousTarget));
        assert_eq!(results[3].resource(), "label:prod");
    }

    #[tokio::test]
    async fn test_connection_failure_is_captured() {
        let results = engine().execute(&[descriptor("web1", "unreachable")]).await;
        assert_eq!(results[0].status(), Status::DispatchError);
        assert_eq!(results[0].error_kind(), Some(ErrorKind::Connection));
    }

    #[tokio::test]
    async fn test_panicking_worker_still_yields_result() {
        let results = engine()
            .execute(&[descriptor("web1", "panic"), descriptor("web2", "ok")])
            .await;
        assert_eq!(results[0].status(), Status::DispatchError);
        assert_eq!(results[0].error_kind(), Some(ErrorKind::Internal));
        assert_eq!(results[0].resource(), "web1");
        assert!(results[1].succeeded());
    }

    #[tokio::test]
    async fn test_fan_out_expands_labels() {
        let results = engine()
            .fan_out(&[descriptor("label:prod", "uptime"), descriptor("label:none", "x")])
            .await;
        let names: Vec<_> = results.iter().map(|r| r.resource()).collect();
        assert_eq!(names, vec!["web1", "web2", "label:none"]);
        assert!(results[0].succeeded() && results[1].succeeded());
        assert_eq!(results[2].error_kind(), Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_empty_plan() {
        assert!(engine().execute(&[]).await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_engine_runs_nothing() {
        let engine = engine();
        engine.cancel();
        let results = engine.execute(&[descriptor("web1", "ok")]).await;
        assert_eq!(results[0].error_kind(), Some(ErrorKind::Cancelled));
        assert!(!results[0].succeeded());
    }
}
