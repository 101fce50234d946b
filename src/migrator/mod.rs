//! One-shot document migration: `detail.containers` → top-level `containers`.
//!
//! Older harvests nested the container list inside `detail`. This moves
//! it up and removes the nested copy, leaving every other field as it was.
//! Records without the nested field are not touched, so a second run is a
//! no-op.

use crate::storage::Repository;
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

const LEGACY_PARENT: &str = "detail";
const CONTAINERS: &str = "containers";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Records that still had the legacy field.
    pub scanned: usize,
    /// Records whose non-empty legacy list was moved.
    pub migrated: usize,
    pub errors: usize,
}

/// Rewrite a document in place. Returns `None` when it has no legacy
/// field, otherwise whether a non-empty list was moved.
pub fn relocate_containers(doc: &mut Value) -> Option<bool> {
    let legacy = doc
        .get_mut(LEGACY_PARENT)
        .and_then(Value::as_object_mut)
        .filter(|d| d.get(CONTAINERS).is_some_and(|c| !c.is_null()))?
        .remove(CONTAINERS)?;

    match legacy {
        Value::Array(list) if !list.is_empty() => {
            if let Some(root) = doc.as_object_mut() {
                root.insert(CONTAINERS.to_string(), Value::Array(list));
            }
            Some(true)
        }
        _ => Some(false),
    }
}

pub fn migrate_containers(repo: &Repository) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();

    for (id, raw) in repo.raw_documents()? {
        let mut doc: Value = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                report.errors += 1;
                error!(id, error = %e, "Stored document is not valid JSON, skipping");
                continue;
            }
        };
        let Some(moved) = relocate_containers(&mut doc) else {
            continue;
        };
        report.scanned += 1;

        match repo.replace_document(id, &doc) {
            Ok(()) if moved => {
                report.migrated += 1;
                if report.migrated % 100 == 0 {
                    info!(migrated = report.migrated, errors = report.errors, "Migration progress");
                }
            }
            Ok(()) => {}
            Err(e) => {
                report.errors += 1;
                error!(id, error = %format!("{:#}", e), "Failed to migrate record");
            }
        }
    }

    info!(
        scanned = report.scanned,
        migrated = report.migrated,
        errors = report.errors,
        "Container migration finished"
    );
    Ok(report)
}
