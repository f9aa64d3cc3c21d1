//! What a stage asks the model to do, and the prompt it sends.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::invoker::{Attachment, InvocationMode};
use crate::state_machine::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Translate a text or PDF document, preserving markup.
    Translate,
    /// Translate the text visible in an image.
    ImageTranslate,
    /// Rewrite a translation with corrections applied.
    Proofread,
    /// Review a translation against style rules and list findings.
    RuleProofread,
}

impl TaskKind {
    pub fn stage(self) -> Stage {
        match self {
            TaskKind::Translate | TaskKind::ImageTranslate => Stage::Primary,
            TaskKind::Proofread | TaskKind::RuleProofread => Stage::Derived,
        }
    }

    /// Output goes through the extractor instead of being stored verbatim.
    pub fn expects_structured(self) -> bool {
        matches!(self, TaskKind::RuleProofread)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Translate => write!(f, "translate"),
            TaskKind::ImageTranslate => write!(f, "image_translate"),
            TaskKind::Proofread => write!(f, "proofread"),
            TaskKind::RuleProofread => write!(f, "rule_proofread"),
        }
    }
}

/// The material a stage works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceInput {
    /// HTML-like formatted text.
    Text(String),
    /// A PDF sent as a document block.
    Document(Attachment),
    Image(Attachment),
}

impl SourceInput {
    /// Load a source from disk, choosing the input kind by file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let media_type = match ext.as_str() {
            "pdf" => Some("application/pdf"),
            "png" => Some("image/png"),
            "jpg" | "jpeg" => Some("image/jpeg"),
            "gif" => Some("image/gif"),
            "webp" => Some("image/webp"),
            _ => None,
        };

        match media_type {
            Some(media_type) => {
                let attachment = Attachment {
                    media_type: media_type.to_string(),
                    data: std::fs::read(path)?,
                };
                if ext == "pdf" {
                    Ok(SourceInput::Document(attachment))
                } else {
                    Ok(SourceInput::Image(attachment))
                }
            }
            None => {
                let text = std::fs::read_to_string(path)?;
                if text.trim().is_empty() {
                    return Err(PipelineError::Config(format!(
                        "source file {} is empty",
                        path.display()
                    )));
                }
                Ok(SourceInput::Text(text))
            }
        }
    }

    /// The primary task this input calls for.
    pub fn primary_task(&self) -> TaskKind {
        match self {
            SourceInput::Image(_) => TaskKind::ImageTranslate,
            SourceInput::Text(_) | SourceInput::Document(_) => TaskKind::Translate,
        }
    }
}

/// Everything needed to submit one stage for one target.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub parent_id: String,
    pub target: String,
    pub model_id: String,
    pub task: TaskKind,
    pub input: SourceInput,
    pub derived_from: Option<String>,
}

/// A rendered prompt plus how it must be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub text: String,
    pub mode: InvocationMode,
    pub attachment: Option<Attachment>,
}

const DEFAULT_RULE: &str = "General grammar, spelling, punctuation and style";

impl StageRequest {
    pub fn prompt(&self, rules: &[String]) -> Prompt {
        let target = &self.target;
        let (body, mode, attachment) = match &self.input {
            SourceInput::Text(text) => (Some(text.as_str()), InvocationMode::Text, None),
            SourceInput::Document(a) => (None, InvocationMode::Document, Some(a.clone())),
            SourceInput::Image(a) => (None, InvocationMode::Image, Some(a.clone())),
        };

        let text = match (self.task, body) {
            (TaskKind::Translate, Some(body)) => format!(
                "Translate the following document into {target}. \
                 Preserve all HTML markup, tags and attributes exactly as they appear; \
                 translate only the human-readable text. \
                 Respond with the translated document only.\n\n{body}"
            ),
            (TaskKind::Translate, None) => format!(
                "Translate the attached document into {target}. \
                 Reproduce its structure as HTML using headings, paragraphs, lists and tables. \
                 Respond with the translated HTML only."
            ),
            (TaskKind::ImageTranslate, _) => format!(
                "Translate all text visible in the attached image into {target}. \
                 Return the translation as HTML, keeping the reading order and grouping \
                 of the original. Respond with the HTML only."
            ),
            (TaskKind::Proofread, body) => format!(
                "Proofread the following {target} text. \
                 Fix grammar, spelling, punctuation and fluency while preserving all \
                 HTML markup exactly. Respond with the corrected text only.\n\n{}",
                body.unwrap_or_default()
            ),
            (TaskKind::RuleProofread, body) => {
                let rule_lines = if rules.is_empty() {
                    format!("- {DEFAULT_RULE}")
                } else {
                    rules
                        .iter()
                        .map(|r| format!("- {r}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                };
                format!(
                    "Review the following {target} text against the style rules below. \
                     Respond with ONLY a JSON array, no other text. \
                     Each element must be an object with the keys \"rule\", \"original_text\", \
                     \"suggested_change\" and \"rationale\". \
                     Respond with [] when no changes are needed.\n\n\
                     Rules:\n{rule_lines}\n\nText:\n{}",
                    body.unwrap_or_default()
                )
            }
        };

        Prompt {
            text,
            mode,
            attachment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(task: TaskKind, input: SourceInput) -> StageRequest {
        StageRequest {
            parent_id: "doc-1".into(),
            target: "fr".into(),
            model_id: "sonnet".into(),
            task,
            input,
            derived_from: None,
        }
    }

    #[test]
    fn translate_prompt_embeds_text() {
        let prompt = request(TaskKind::Translate, SourceInput::Text("<p>Hi</p>".into())).prompt(&[]);
        assert_eq!(prompt.mode, InvocationMode::Text);
        assert!(prompt.text.starts_with("Translate the following document into fr."));
        assert!(prompt.text.ends_with("<p>Hi</p>"));
        assert!(prompt.attachment.is_none());
    }

    #[test]
    fn document_and_image_inputs_travel_as_attachments() {
        let pdf = Attachment {
            media_type: "application/pdf".into(),
            data: vec![1, 2, 3],
        };
        let prompt = request(TaskKind::Translate, SourceInput::Document(pdf.clone())).prompt(&[]);
        assert_eq!(prompt.mode, InvocationMode::Document);
        assert_eq!(prompt.attachment, Some(pdf));

        let png = Attachment {
            media_type: "image/png".into(),
            data: vec![9],
        };
        let input = SourceInput::Image(png);
        assert_eq!(input.primary_task(), TaskKind::ImageTranslate);
        let prompt = request(input.primary_task(), input).prompt(&[]);
        assert_eq!(prompt.mode, InvocationMode::Image);
        assert!(prompt.text.contains("attached image into fr"));
    }

    #[test]
    fn rule_prompt_lists_rules() {
        let rules = vec!["Use the serial comma".to_string(), "Spell out numbers under ten".to_string()];
        let prompt =
            request(TaskKind::RuleProofread, SourceInput::Text("Bonjour".into())).prompt(&rules);
        assert!(prompt.text.contains("- Use the serial comma\n- Spell out numbers under ten"));
        assert!(prompt.text.contains("Respond with [] when no changes are needed."));
        assert!(prompt.text.ends_with("Text:\nBonjour"));
    }

    #[test]
    fn rule_prompt_falls_back_to_default_rule() {
        let prompt = request(TaskKind::RuleProofread, SourceInput::Text("x".into())).prompt(&[]);
        assert!(prompt.text.contains(&format!("- {DEFAULT_RULE}")));
    }

    #[test]
    fn task_stages_and_structure() {
        assert_eq!(TaskKind::Translate.stage(), Stage::Primary);
        assert_eq!(TaskKind::Proofread.stage(), Stage::Derived);
        assert!(TaskKind::RuleProofread.expects_structured());
        assert!(!TaskKind::Proofread.expects_structured());
        assert_eq!(TaskKind::ImageTranslate.to_string(), "image_translate");
    }

    #[test]
    fn source_from_path_picks_kind_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let html = dir.path().join("page.html");
        std::fs::write(&html, "<h1>Title</h1>").unwrap();
        assert_eq!(
            SourceInput::from_path(&html).unwrap(),
            SourceInput::Text("<h1>Title</h1>".into())
        );

        let img = dir.path().join("scan.JPG");
        std::fs::write(&img, [0xff, 0xd8]).unwrap();
        match SourceInput::from_path(&img).unwrap() {
            SourceInput::Image(a) => assert_eq!(a.media_type, "image/jpeg"),
            other => panic!("expected image, got {other:?}"),
        }

        let empty = dir.path().join("empty.txt");
        std::fs::write(&empty, "  \n").unwrap();
        assert!(SourceInput::from_path(&empty).is_err());
    }
}
