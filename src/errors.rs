use std::error::Error as StdError;
use std::fmt;
use std::path::Path;

use thiserror::Error;

use crate::types::{PodKey, CAPTURE_ANNOTATION};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Cli(String),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("failed to wait for pod cache sync: {0}")]
    CacheSync(String),

    #[error("{0}")]
    Other(String),
}

/// Classifies a [`CaptureError`] for callers that branch on the failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureErrorKind {
    AnnotationMissing,
    ContainerNotFound,
    MalformedContainerId,
    ProcessNotFound,
    TcpdumpExecutionFailed,
    FileCleanupFailed,
    AnnotationParseFailed,
}

type Cause = Box<dyn StdError + Send + Sync + 'static>;

/// A capture failure carrying the operation, a human reason, and a hint the
/// operator can act on.
#[derive(Debug)]
pub struct CaptureError {
    kind: CaptureErrorKind,
    operation: &'static str,
    reason: String,
    hint: String,
    source: Option<Cause>,
}

impl CaptureError {
    pub fn new(
        kind: CaptureErrorKind,
        operation: &'static str,
        reason: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation,
            reason: reason.into(),
            hint: hint.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, err: impl Into<Cause>) -> Self {
        self.source = Some(err.into());
        self
    }

    pub fn kind(&self) -> CaptureErrorKind {
        self.kind
    }

    pub fn operation(&self) -> &str {
        self.operation
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn hint(&self) -> &str {
        &self.hint
    }

    pub fn annotation_missing(pod: &PodKey) -> Self {
        Self::new(
            CaptureErrorKind::AnnotationMissing,
            "Capture start",
            format!("Pod {pod} does not carry the {CAPTURE_ANNOTATION} annotation"),
            format!("Annotate the pod to request a capture: kubectl annotate pod -n {} {} {CAPTURE_ANNOTATION}=\"5\"", pod.namespace, pod.name),
        )
    }

    pub fn container_not_found(pod: &PodKey) -> Self {
        Self::new(
            CaptureErrorKind::ContainerNotFound,
            "Container discovery",
            format!("Could not find container for pod {pod}"),
            format!(
                "Ensure the pod is running and has at least one container. Check pod status with: kubectl describe pod -n {} {}",
                pod.namespace, pod.name
            ),
        )
    }

    pub fn malformed_container_id(pod: &PodKey, container_id: &str) -> Self {
        Self::new(
            CaptureErrorKind::MalformedContainerId,
            "Container discovery",
            format!("Invalid container ID format {container_id:?} for pod {pod}"),
            "Expected <runtime>://<id>. The container may not have started yet; it will be retried.",
        )
    }

    pub fn process_not_found(container_id: &str) -> Self {
        Self::new(
            CaptureErrorKind::ProcessNotFound,
            "Process discovery",
            format!("Could not find process for container {container_id}"),
            "The container may have just started or terminated. Verify with: kubectl get pod -o jsonpath='{.status.containerStatuses[0].state}'",
        )
    }

    pub fn tcpdump_execution(pod: &PodKey) -> Self {
        Self::new(
            CaptureErrorKind::TcpdumpExecutionFailed,
            "Tcpdump execution",
            format!("Failed to start tcpdump for pod {pod}"),
            "Ensure the agent has privileged access and nsenter/tcpdump are installed. Check the DaemonSet security context.",
        )
    }

    pub fn file_cleanup(path: &Path) -> Self {
        Self::new(
            CaptureErrorKind::FileCleanupFailed,
            "File cleanup",
            format!("Failed to remove capture file {}", path.display()),
            "Check file permissions and disk space. The file may have been manually deleted.",
        )
    }

    pub fn annotation_parse(value: &str) -> Self {
        Self::new(
            CaptureErrorKind::AnnotationParseFailed,
            "Annotation parsing",
            format!("Invalid annotation value: {value}"),
            format!("The annotation value must be a positive integer representing max capture files. Example: kubectl annotate pod <name> {CAPTURE_ANNOTATION}=\"5\""),
        )
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}. {}", self.operation, self.reason, self.hint)?;
        if let Some(source) = &self.source {
            write!(f, " (underlying error: {source})")?;
        }
        Ok(())
    }
}

impl StdError for CaptureError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}
