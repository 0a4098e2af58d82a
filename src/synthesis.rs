//! Natural-language synthesis against ready resources, and the final refinement pass.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::GenerationError;
use crate::remote::{Content, RemoteResource, RemoteService, ResourceState};
use crate::retry::RetryPolicy;

/// Instruction sent with every segment.
pub const SEGMENT_PROMPT: &str = "\
You are an expert academic writer. Turn the educational material in this media \
segment into one coherent, self-contained explanatory text in clear, simple English, \
the way a well-written textbook passage would teach it.

Rules:
1. No titles, headings, or separators. Do not start any line with '#' and do not use \
horizontal rules.
2. Start immediately with substantive content. No introduction, framing, greetings, \
or closing remarks.
3. Explain the subject itself. Never refer to the video, the speaker, the lecture, or \
this segment. Define technical terms simply when they are needed.
4. Cover every core concept, definition, derivation, worked example, and procedure, \
woven into a flowing explanation rather than a list of points.
5. Output valid Markdown. Write all mathematics as LaTeX, $inline$ or $$block$$, and \
never wrap LaTeX in backticks.";

/// Refinement instruction; `{text}` is replaced by the merged segment texts.
pub const REFINE_PROMPT: &str = "\
You are an expert technical editor. The text below was assembled from summaries of \
consecutive parts of one recording.

1. Begin with a concise H1 title ('# ...') and an H2 subtitle ('## ...') that fit the \
whole text.
2. Make the Markdown formatting consistent: lists, code blocks, and LaTeX ($inline$ or \
$$block$$, never inside backticks).
3. Smooth the flow where parts meet, but do not add, remove, or change any substantive \
content.
4. Output only the refined Markdown, starting with the title.

--- BEGIN ORIGINAL TEXT ---
{text}
--- END ORIGINAL TEXT ---";

#[derive(Deserialize, Debug)]
struct StructuredReply {
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ReplyPart>,
}

#[derive(Deserialize, Debug)]
struct ReplyPart {
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct FlatReply {
    text: String,
}

/// Pulls the generated text out of an untrusted reply.
///
/// Accepts the first candidate's text parts (joined), or a top-level `text`
/// field. Anything else, or only whitespace, is `None`.
pub fn extract_text(reply: &serde_json::Value) -> Option<String> {
    let structured = serde_json::from_value::<StructuredReply>(reply.clone())
        .ok()
        .and_then(|r| r.candidates.into_iter().next())
        .and_then(|c| c.content)
        .map(|c| {
            c.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<String>()
        });
    let text = match structured {
        Some(t) if !t.trim().is_empty() => t,
        _ => serde_json::from_value::<FlatReply>(reply.clone()).ok()?.text,
    };
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Issues generation and refinement requests.
#[derive(Clone)]
pub struct SynthesisClient {
    service: Arc<dyn RemoteService>,
    retry: RetryPolicy,
}

impl SynthesisClient {
    /// `retry` governs [`generate`](Self::generate); refinement is always a single attempt.
    pub fn new(service: Arc<dyn RemoteService>, retry: RetryPolicy) -> Self {
        Self { service, retry }
    }

    pub async fn generate(
        &self,
        resource: &RemoteResource,
        model: &str,
        prompt: &str,
    ) -> Result<String, GenerationError> {
        if resource.state() != ResourceState::Active {
            return Err(GenerationError::NotActive {
                target: resource.name.clone(),
                state: resource.state().to_string(),
            });
        }
        let contents = [
            Content::Text(prompt.to_string()),
            Content::File {
                uri: resource.uri.clone(),
                mime_type: resource.mime_type.clone(),
            },
        ];
        let attempts = self.retry.attempts();
        let contents = &contents;
        self.retry
            .run("generation", |attempt| async move {
                info!(resource = %resource.name, model, attempt, attempts, "generating");
                self.request(model, contents).await
            })
            .await
            .map_err(|source| GenerationError::Exhausted {
                target: resource.name.clone(),
                attempts,
                source,
            })
    }

    pub async fn refine(&self, full_text: &str, model: &str) -> Result<String, GenerationError> {
        info!(model, chars = full_text.len(), "refining merged text");
        let contents = [Content::Text(REFINE_PROMPT.replace("{text}", full_text))];
        self.request(model, &contents)
            .await
            .map_err(|source| GenerationError::Exhausted {
                target: "merged text".to_string(),
                attempts: 1,
                source,
            })
    }

    async fn request(&self, model: &str, contents: &[Content]) -> anyhow::Result<String> {
        let reply = self.service.generate(model, contents).await?;
        extract_text(&reply).ok_or_else(|| {
            warn!(%reply, "reply carries no generated text");
            anyhow::anyhow!("reply carries no generated text")
        })
    }
}
