//! Writes each target's completed results next to each other in one directory.
//!
//! For a source `page.html` and target `fr` the files are `page.fr.html`
//! (primary), `page.fr.proofread.html` (rewrite) or `page.fr.findings.json`
//! (rule findings). Generated images keep their own extension.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::state_machine::{ResultPayload, RunReport, StageAudit, StagePhase};
use crate::store::JobStore;

/// File naming for one run.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub dir: PathBuf,
    pub stem: String,
    pub extension: String,
}

impl OutputLayout {
    /// Derive the naming from the source path. Binary sources produce text, so
    /// PDFs and images fall back to `txt`.
    pub fn for_source(dir: &Path, source: &Path) -> Self {
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output")
            .to_string();
        let extension = match source
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            None | Some("pdf" | "png" | "jpg" | "jpeg" | "gif" | "webp") => "txt".to_string(),
            Some(ext) => ext.to_string(),
        };
        Self {
            dir: dir.to_path_buf(),
            stem,
            extension,
        }
    }

    fn path_for(&self, target: &str, derived: bool, payload: &ResultPayload) -> PathBuf {
        let name = match (payload, derived) {
            (ResultPayload::Findings { .. }, _) => format!("{}.{target}.findings.json", self.stem),
            (ResultPayload::Image { media_type, .. }, _) => {
                let ext = media_type.rsplit('/').next().unwrap_or("bin");
                format!("{}.{target}.{ext}", self.stem)
            }
            (ResultPayload::Text { .. }, false) => {
                format!("{}.{target}.{}", self.stem, self.extension)
            }
            (ResultPayload::Text { .. }, true) => {
                format!("{}.{target}.proofread.{}", self.stem, self.extension)
            }
        };
        self.dir.join(name)
    }
}

/// Write every completed stage of the report. Returns the files written.
pub async fn write_outputs(
    store: &dyn JobStore,
    report: &RunReport,
    layout: &OutputLayout,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(&layout.dir)
        .with_context(|| format!("failed to create {}", layout.dir.display()))?;

    let mut written = Vec::new();
    for target in &report.targets {
        let stages = std::iter::once((&target.primary, false))
            .chain(target.derived.as_ref().map(|d| (d, true)));
        for (audit, derived) in stages {
            let Some(unit_id) = completed_unit(audit) else {
                continue;
            };
            let unit = store.get(unit_id).await?;
            let Some(payload) = &unit.result_payload else {
                continue;
            };

            let path = layout.path_for(&target.target, derived, payload);
            let bytes = match payload {
                ResultPayload::Text { text } => text.clone().into_bytes(),
                ResultPayload::Findings { findings } => serde_json::to_vec_pretty(findings)?,
                ResultPayload::Image { data, .. } => data.clone(),
            };
            std::fs::write(&path, bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(target = %target.target, path = %path.display(), "output written");
            written.push(path);
        }
    }
    Ok(written)
}

fn completed_unit(audit: &StageAudit) -> Option<&str> {
    (audit.phase == StagePhase::Completed)
        .then_some(audit.unit_id.as_deref())
        .flatten()
}
