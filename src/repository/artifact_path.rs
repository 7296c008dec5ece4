//! Recognizing artifacts in a Maven-layout repository path.
//!
//! `org/acme/util/1.2/util-1.2-sources.jar` is the `sources` classifier of the `jar`
//! artifact `org.acme:util:1.2`. Metadata and checksum files live next to artifacts
//! but are not artifacts themselves.

use regex::Regex;
use std::sync::LazyLock;

static SNAPSHOT_TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{8}\.\d{6}-\d+").unwrap());

const SNAPSHOT_SUFFIX: &str = "-SNAPSHOT";

const NON_ARTIFACT_EXTENSIONS: &[&str] = &[".md5", ".sha1", ".sha256", ".sha512", ".asc"];

/// Coordinates parsed from an artifact path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPathInfo {
    pub group_id: String,
    pub artifact_id: String,
    pub version: String,
    pub classifier: Option<String>,
    pub artifact_type: String,
    pub filename: String,
}

impl ArtifactPathInfo {
    /// Parse a repository path. Returns `None` for anything that is not an artifact.
    pub fn parse(path: &str) -> Option<Self> {
        let path = path.trim_start_matches('/');
        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() < 4 || segments.iter().any(|s| s.is_empty()) {
            return None;
        }

        let filename = segments[segments.len() - 1];
        let version = segments[segments.len() - 2];
        let artifact_id = segments[segments.len() - 3];
        let group_id = segments[..segments.len() - 3].join(".");

        if filename.starts_with("maven-metadata")
            || NON_ARTIFACT_EXTENSIONS
                .iter()
                .any(|ext| filename.ends_with(ext))
        {
            return None;
        }

        let rest = filename.strip_prefix(artifact_id)?.strip_prefix('-')?;
        let rest = strip_version(rest, version)?;

        let (classifier, artifact_type) = if let Some(ext) = rest.strip_prefix('.') {
            (None, ext)
        } else {
            let qualified = rest.strip_prefix('-')?;
            let (classifier, ext) = qualified.split_once('.')?;
            if classifier.is_empty() {
                return None;
            }
            (Some(classifier.to_string()), ext)
        };
        if artifact_type.is_empty() {
            return None;
        }

        Some(Self {
            group_id,
            artifact_id: artifact_id.to_string(),
            version: version.to_string(),
            classifier,
            artifact_type: artifact_type.to_string(),
            filename: filename.to_string(),
        })
    }

    /// `groupId:artifactId:type:version[:classifier]`
    pub fn identifier(&self) -> String {
        let mut id = format!(
            "{}:{}:{}:{}",
            self.group_id, self.artifact_id, self.artifact_type, self.version
        );
        if let Some(classifier) = &self.classifier {
            id.push(':');
            id.push_str(classifier);
        }
        id
    }
}

/// Strip the version from the part of a file name after `<artifactId>-`, accepting
/// timestamped file names for snapshot versions.
fn strip_version<'a>(rest: &'a str, version: &str) -> Option<&'a str> {
    if let Some(after) = rest.strip_prefix(version) {
        return Some(after);
    }
    let base = version.strip_suffix(SNAPSHOT_SUFFIX)?;
    let after_base = rest.strip_prefix(base)?.strip_prefix('-')?;
    let stamp = SNAPSHOT_TIMESTAMP.find(after_base)?;
    Some(&after_base[stamp.end()..])
}
