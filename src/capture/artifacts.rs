//! Capture output naming and cleanup.
//!
//! tcpdump writes `capture-<namespace>-<name>.pcap` and, once rotation kicks
//! in, numbered siblings (`.pcap1`, `.pcap2`, ...). Cleanup globs for all of
//! them.

use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;

use crate::errors::CaptureError;
use crate::types::PodKey;

fn stem(pod: &PodKey) -> String {
    format!("capture-{}-{}.pcap", pod.namespace, pod.name)
}

/// Path of the live capture file.
pub fn live_file(dir: &Path, pod: &PodKey) -> PathBuf {
    dir.join(stem(pod))
}

/// Glob matching the live file and every rotated sibling.
pub fn cleanup_pattern(dir: &Path, pod: &PodKey) -> String {
    let dir = Pattern::escape(&dir.to_string_lossy());
    format!("{dir}/{}*", Pattern::escape(&stem(pod)))
}

/// Removes every artifact for `pod`. Failures are logged, never returned.
/// Returns how many files were removed.
pub fn remove_artifacts(dir: &Path, pod: &PodKey) -> usize {
    let pattern = cleanup_pattern(dir, pod);
    let paths = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(e) => {
            tracing::error!(pattern = %pattern, error = %e, "failed to glob capture files");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in paths {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                let err = CaptureError::file_cleanup(e.path()).with_source(e.into_error());
                tracing::error!(error = %err, "failed to read capture file entry");
                continue;
            }
        };

        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                tracing::debug!(file = %path.display(), "removed capture file");
            }
            Err(e) => {
                let err = CaptureError::file_cleanup(&path).with_source(e);
                tracing::error!(error = %err, "failed to remove capture file");
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_file_is_named_after_namespace_and_pod() {
        let path = live_file(Path::new("/var/log/antrea-captures"), &PodKey::new("ns", "pod"));
        assert_eq!(path, Path::new("/var/log/antrea-captures/capture-ns-pod.pcap"));
    }

    #[test]
    fn removes_live_file_and_rotations_only_for_that_pod() {
        let tmp = tempfile::tempdir().unwrap();
        let pod = PodKey::new("ns", "pod");
        let ours = ["capture-ns-pod.pcap", "capture-ns-pod.pcap1", "capture-ns-pod.pcap2"];
        let theirs = ["capture-ns-other.pcap", "capture-ns-pod0.pcap", "unrelated.txt"];
        for f in ours.iter().chain(theirs.iter()) {
            fs::write(tmp.path().join(f), b"test").unwrap();
        }

        assert_eq!(remove_artifacts(tmp.path(), &pod), 3);

        for f in ours {
            assert!(!tmp.path().join(f).exists(), "{f} should be removed");
        }
        for f in theirs {
            assert!(tmp.path().join(f).exists(), "{f} should be kept");
        }
    }

    #[test]
    fn glob_metacharacters_in_names_are_literal() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("cap[1]");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("capture-ns-pod.pcap"), b"x").unwrap();

        assert_eq!(remove_artifacts(&dir, &PodKey::new("ns", "pod")), 1);
    }

    #[test]
    fn nothing_to_remove_is_fine() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(remove_artifacts(tmp.path(), &PodKey::new("ns", "pod")), 0);
    }
}
