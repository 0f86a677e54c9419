//! The phase transformation capability.
//!
//! The processor only knows the [`Transform`] trait. Two built-in
//! implementations let the pipeline run without external services:
//! [`SectionChunker`] for phase 1 and [`NoteWriter`] for phase 2.
//! [`CommandTransform`] delegates to an external program speaking one JSON
//! request on stdin and one JSON response on stdout.

use std::process::Stdio;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use vaultgate_shared::{
    Fingerprint, Phase, Result, TransformConfig, TransformKind, VaultCategory, VaultgateError,
};

static HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^#{1,6}[ \t]+(.+?)[ \t#]*$").expect("valid heading regex")
});

/// Text of the first Markdown heading in `text`.
pub(crate) fn first_heading(text: &str) -> Option<String> {
    HEADING.captures(text).map(|c| c[1].trim().to_string())
}

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// Everything a transformation sees about the unit it is working on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformInput {
    pub work_unit_id: String,
    pub phase: Phase,
    /// Fingerprint of the source document of this lineage.
    pub document: Fingerprint,
    /// File name the document was discovered under.
    pub source_name: String,
    /// Title of the upstream artifact (phase 2) or the file stem (phase 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
    /// Reviewer note attached to the upstream approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// One output of a transformation, before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDraft {
    #[serde(default)]
    pub title: Option<String>,
    pub body: String,
    /// Requested vault category; only meaningful in phase 2.
    #[serde(default)]
    pub category: Option<VaultCategory>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformOutput {
    #[serde(default)]
    pub artifacts: Vec<ArtifactDraft>,
    /// Ordered rendering of the whole document (phase 1 only).
    #[serde(default)]
    pub ordered: Option<String>,
}

/// A phase transformation.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn transform(&self, input: &TransformInput) -> Result<TransformOutput>;
}

/// Build the configured transformation for `phase`.
pub fn build_transform(config: &TransformConfig, phase: Phase) -> Result<Arc<dyn Transform>> {
    match config.kind {
        TransformKind::Builtin => match phase {
            Phase::One => Ok(Arc::new(SectionChunker::new(config.max_chunk_chars))),
            Phase::Two => Ok(Arc::new(NoteWriter)),
        },
        TransformKind::Command => Ok(Arc::new(CommandTransform::new(config.command.clone())?)),
    }
}

// ---------------------------------------------------------------------------
// SectionChunker
// ---------------------------------------------------------------------------

/// Splits Markdown into one chunk per heading section. Sections longer than
/// `max_chunk_chars` are split on paragraph boundaries, then hard-split.
#[derive(Debug, Clone)]
pub struct SectionChunker {
    max_chunk_chars: usize,
}

impl SectionChunker {
    pub fn new(max_chunk_chars: usize) -> Self {
        Self {
            max_chunk_chars: max_chunk_chars.max(1),
        }
    }

    fn sections<'a>(&self, doc: &'a str, fallback_title: &str) -> Vec<(String, &'a str)> {
        let mut sections = Vec::new();
        let mut starts: Vec<(usize, String)> = HEADING
            .captures_iter(doc)
            .filter_map(|c| {
                let whole = c.get(0)?;
                Some((whole.start(), c[1].trim().to_string()))
            })
            .collect();

        let first = starts.first().map(|(s, _)| *s).unwrap_or(doc.len());
        let preamble = doc[..first].trim();
        if !preamble.is_empty() {
            sections.push((fallback_title.to_string(), preamble));
        }

        starts.push((doc.len(), String::new()));
        for pair in starts.windows(2) {
            let (start, title) = &pair[0];
            let end = pair[1].0;
            let body = doc[*start..end].trim();
            if !body.is_empty() {
                sections.push((title.clone(), body));
            }
        }
        sections
    }

    fn split(&self, body: &str) -> Vec<String> {
        if body.chars().count() <= self.max_chunk_chars {
            return vec![body.to_string()];
        }

        let mut parts = Vec::new();
        let mut current = String::new();
        for para in body.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            let para_len = para.chars().count();
            if para_len > self.max_chunk_chars {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
                parts.extend(hard_split(para, self.max_chunk_chars));
                continue;
            }
            let joined_len = if current.is_empty() {
                para_len
            } else {
                current.chars().count() + 2 + para_len
            };
            if joined_len > self.max_chunk_chars {
                parts.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(para);
        }
        if !current.is_empty() {
            parts.push(current);
        }
        parts
    }
}

fn hard_split(text: &str, max: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(max).map(|c| c.iter().collect()).collect()
}

#[async_trait]
impl Transform for SectionChunker {
    fn name(&self) -> &str {
        "section-chunker"
    }

    async fn transform(&self, input: &TransformInput) -> Result<TransformOutput> {
        let doc = input.content.replace("\r\n", "\n");
        let doc = doc.trim();
        if doc.is_empty() {
            return Ok(TransformOutput::default());
        }

        let fallback = input
            .title
            .clone()
            .unwrap_or_else(|| input.source_name.clone());
        let mut artifacts = Vec::new();
        for (title, body) in self.sections(doc, &fallback) {
            for (i, part) in self.split(body).into_iter().enumerate() {
                let title = if i == 0 {
                    title.clone()
                } else {
                    format!("{title} ({})", i + 1)
                };
                artifacts.push(ArtifactDraft {
                    title: Some(title),
                    body: part,
                    category: None,
                });
            }
        }

        debug!(chunks = artifacts.len(), "document chunked");
        Ok(TransformOutput {
            artifacts,
            ordered: Some(format!("{doc}\n")),
        })
    }
}

// ---------------------------------------------------------------------------
// NoteWriter
// ---------------------------------------------------------------------------

/// Turns one approved chunk into one vault note, carrying the reviewer note.
#[derive(Debug, Clone, Default)]
pub struct NoteWriter;

#[async_trait]
impl Transform for NoteWriter {
    fn name(&self) -> &str {
        "note-writer"
    }

    async fn transform(&self, input: &TransformInput) -> Result<TransformOutput> {
        let content = input.content.trim();
        if content.is_empty() {
            return Ok(TransformOutput::default());
        }

        let heading = first_heading(content);
        let title = input
            .title
            .clone()
            .or_else(|| heading.clone())
            .unwrap_or_else(|| "Untitled".to_string());

        // The vault renders its own `# Title`; drop a leading duplicate.
        let mut body = match content.split_once('\n') {
            Some((first, rest)) if HEADING.is_match(first) && heading.as_deref() == Some(&title) => {
                rest.trim().to_string()
            }
            None if HEADING.is_match(content) => String::new(),
            _ => content.to_string(),
        };
        if let Some(note) = input.note.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            if !body.is_empty() {
                body.push_str("\n\n");
            }
            body.push_str(&format!("> Reviewer note: {note}"));
        }

        Ok(TransformOutput {
            artifacts: vec![ArtifactDraft {
                title: Some(title),
                body,
                category: Some(VaultCategory::Note),
            }],
            ordered: None,
        })
    }
}

// ---------------------------------------------------------------------------
// CommandTransform
// ---------------------------------------------------------------------------

/// Runs an external program per invocation: the [`TransformInput`] is written
/// to its stdin as JSON, a [`TransformOutput`] is read from its stdout.
///
/// The child is killed when the invocation future is dropped, so an
/// enclosing timeout never leaves it running.
#[derive(Debug, Clone)]
pub struct CommandTransform {
    program: String,
    args: Vec<String>,
}

impl CommandTransform {
    pub fn new(command: Vec<String>) -> Result<Self> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| VaultgateError::config("command transform requires a program"))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl Transform for CommandTransform {
    fn name(&self) -> &str {
        &self.program
    }

    #[instrument(skip_all, fields(program = %self.program, work_unit = %input.work_unit_id))]
    async fn transform(&self, input: &TransformInput) -> Result<TransformOutput> {
        let fail = |msg: String| VaultgateError::transform(&input.work_unit_id, msg);

        let request = serde_json::to_vec(input)
            .map_err(|e| fail(format!("failed to encode request: {e}")))?;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| fail(format!("failed to spawn `{}`: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| fail("failed to capture stdin".into()))?;
        // A program that ignores its input may exit before reading it.
        if let Err(e) = stdin.write_all(&request).await {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(fail(format!("failed to write request: {e}")));
            }
        }
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| fail(format!("failed to wait for `{}`: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!(
                "`{}` exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| fail(format!("invalid response from `{}`: {e}", self.program)))
    }
}
