//! Boot-time deployment of topology documents.
//!
//! Built-in documents ship inside the crate under [`BUILTIN_PREFIX`] and are
//! deployed first, unless `noboot` is set. User documents are then read from
//! the configured directory tree (`.yml` files only, bounded depth, sorted
//! by file name). Every document is template-rendered against the process
//! settings before parsing.
//!
//! A bad document is logged and recorded in the [`BootReport`]; it never
//! stops the remaining documents from loading.

use crate::config::RuntimeConfig;
use crate::definition::StageDefinition;
use crate::deployment::Deployment;
use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Resource prefix of the built-in documents.
pub const BUILTIN_PREFIX: &str = "boot/";

const DOCUMENT_EXTENSION: &str = "yml";

/// Built-in documents as `(resource name, body)`.
pub const BUILTIN_DOCUMENTS: &[(&str, &str)] = &[
    (
        "boot/event-log-sink.yml",
        include_str!("../boot/event-log-sink.yml"),
    ),
    (
        "boot/stage-provider.yml",
        include_str!("../boot/stage-provider.yml"),
    ),
];

/// A document that could not be loaded or deployed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootFailure {
    pub document: String,
    pub error: String,
}

/// What happened during boot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootReport {
    /// Instance names, in deployment order.
    pub deployed: Vec<String>,
    pub failed: Vec<BootFailure>,
}

impl BootReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn failure(&mut self, document: impl Into<String>, error: impl ToString) {
        self.failed.push(BootFailure {
            document: document.into(),
            error: error.to_string(),
        });
    }
}

/// Parses every built-in document.
pub fn builtin_definitions(settings: &serde_json::Value) -> Result<Vec<StageDefinition>> {
    BUILTIN_DOCUMENTS
        .iter()
        .map(|(name, body)| StageDefinition::from_template(name, body, settings))
        .collect()
}

/// `.yml` files under `root`, at most `max_depth` levels down, in file
/// name order. A missing root yields nothing.
pub fn user_documents(root: &Path, max_depth: usize) -> Vec<PathBuf> {
    if !root.is_dir() {
        debug!(path = %root.display(), "no user stage directory");
        return Vec::new();
    }
    WalkDir::new(root)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_document(entry.path()))
        .map(walkdir::DirEntry::into_path)
        .collect()
}

fn is_document(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(DOCUMENT_EXTENSION))
}

/// Deploys the built-in documents, then the user documents.
pub async fn boot(deployment: &Deployment, config: &RuntimeConfig) -> BootReport {
    let mut report = BootReport::default();
    let settings = deployment.settings().clone();

    if config.noboot {
        info!("noboot set, skipping built-in stages");
    } else {
        for (name, body) in BUILTIN_DOCUMENTS {
            let parsed = StageDefinition::from_template(name, body, &settings);
            deploy_document(deployment, name, parsed, &mut report).await;
        }
    }

    let documents = user_documents(&config.user_stages, config.boot_max_depth);
    debug!(
        path = %config.user_stages.display(),
        count = documents.len(),
        "user stage documents"
    );
    for path in documents {
        let name = path.display().to_string();
        let parsed = StageDefinition::from_file(&path, &settings);
        deploy_document(deployment, &name, parsed, &mut report).await;
    }

    info!(
        deployed = report.deployed.len(),
        failed = report.failed.len(),
        "boot completed"
    );
    report
}

async fn deploy_document(
    deployment: &Deployment,
    document: &str,
    parsed: Result<StageDefinition>,
    report: &mut BootReport,
) {
    let definition = match parsed {
        Ok(definition) => definition,
        Err(e) => {
            error!(document = %document, error = %e, "unreadable stage document");
            report.failure(document, e);
            return;
        }
    };
    match deployment.deploy(&definition).await {
        Ok(_) => report.deployed.push(definition.instance_name),
        Err(e) => {
            error!(document = %document, instance = %definition.instance_name, error = %e, "boot deployment failed");
            report.failure(document, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn builtins_parse() {
        let definitions = builtin_definitions(&serde_json::json!({})).unwrap();
        let names: Vec<&str> = definitions.iter().map(|d| d.instance_name.as_str()).collect();
        assert_eq!(names, vec!["EventLogSink_01", "StageProvider_01"]);
        assert!(BUILTIN_DOCUMENTS.iter().all(|(name, _)| name.starts_with(BUILTIN_PREFIX)));
    }

    #[test]
    fn scan_respects_extension_and_depth() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::write(root.join("z.yml"), "").unwrap();
        std::fs::write(root.join("a.YML"), "").unwrap();
        std::fs::write(root.join("notes.yaml"), "").unwrap();
        std::fs::write(root.join("a/inner.yml"), "").unwrap();
        std::fs::write(root.join("a/b/deep.yml"), "").unwrap();

        let names = |docs: Vec<PathBuf>| -> Vec<String> {
            docs.iter()
                .map(|p| p.strip_prefix(root).unwrap().display().to_string())
                .collect()
        };

        let shallow = names(user_documents(root, 1));
        assert_eq!(shallow, vec!["a.YML", "z.yml"]);

        let deep = user_documents(root, 9);
        assert_eq!(deep.len(), 4);
    }

    #[test]
    fn missing_directory_is_empty() {
        assert!(user_documents(Path::new("/no/such/stages"), 9).is_empty());
    }
}
