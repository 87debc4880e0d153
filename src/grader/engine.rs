//! The grader engine.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::cache::{CacheKey, CacheStats, JudgmentCache};
use super::judge::{Judge, JudgeRequest};
use super::templates::TemplateStore;
use super::Judgment;
use crate::error::GraderError;
use crate::metrics;
use crate::utils::json::extract_json_object;

/// Grades responses against rubric templates through a judge, with caching.
pub struct GraderEngine {
    templates: TemplateStore,
    judge: Arc<dyn Judge>,
    cache: JudgmentCache,
}

impl GraderEngine {
    pub fn new(templates: TemplateStore, judge: Arc<dyn Judge>, cache: JudgmentCache) -> Self {
        Self {
            templates,
            judge,
            cache,
        }
    }

    /// Returns the judgment for `(rubric, prompt, response, expected)`.
    ///
    /// Identical inputs (under the same template) are judged at most once.
    /// Judge failures degrade to `{0, "API Error: ..."}` and unparseable
    /// replies to `{1, "parsing failed"}`; both are cached.
    ///
    /// # Errors
    ///
    /// Only `GraderError::UnknownRubric`, when no template was loaded for
    /// `rubric`.
    pub async fn grade(
        &self,
        rubric: &str,
        prompt: &str,
        response: &str,
        expected: &str,
    ) -> Result<Judgment, GraderError> {
        let template = self.templates.get(rubric)?;
        let key = CacheKey::derive(rubric, prompt, response, expected, &template.digest);

        if let Some(judgment) = self.cache.get(&key) {
            metrics::record_cache_lookup(true);
            debug!(rubric, key = %key, "Judgment cache hit");
            return Ok(judgment);
        }
        metrics::record_cache_lookup(false);

        let request = JudgeRequest {
            rubric,
            prompt,
            response,
            expected,
            rendered: template.render(rubric, prompt, response, expected),
        };

        let judgment = match self.judge.judge(&request).await {
            Ok(reply) => match parse_judgment(&reply) {
                Some(judgment) => {
                    metrics::record_judge_request(rubric, "ok");
                    judgment
                }
                None => {
                    warn!(rubric, judge = self.judge.name(), "Unparseable judge reply");
                    metrics::record_judge_request(rubric, "parse_error");
                    Judgment::parse_failure()
                }
            },
            Err(e) => {
                warn!(rubric, judge = self.judge.name(), error = %e, "Judge call failed");
                metrics::record_judge_request(rubric, "api_error");
                Judgment::api_error(&e)
            }
        };

        if let Err(e) = self.cache.put(&key, rubric, &judgment) {
            warn!(rubric, key = %key, error = %e, "Failed to persist judgment");
        }

        info!(rubric, score = judgment.score, "Graded");
        Ok(judgment)
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

/// Extracts `{score, notes}` from a judge reply.
///
/// The score may be a number or a numeric string. The rationale is read from
/// `notes`, falling back to `rationale` or `reason`.
fn parse_judgment(reply: &str) -> Option<Judgment> {
    let object = extract_json_object(reply)?;

    let score = match object.get("score")? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };

    let notes = ["notes", "rationale", "reason"]
        .iter()
        .find_map(|field| object.get(*field))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();

    Some(Judgment::new(score, notes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Judge returning a fixed reply and counting calls.
    struct Scripted {
        reply: Result<String, String>,
        calls: AtomicUsize,
        last_prompt: Mutex<String>,
    }

    impl Scripted {
        fn ok(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(String::new()),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(message.to_string()),
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(String::new()),
            })
        }
    }

    #[async_trait]
    impl Judge for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn judge(&self, request: &JudgeRequest<'_>) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = request.rendered.clone();
            self.reply.clone().map_err(LlmError::RequestFailed)
        }
    }

    fn engine(dir: &std::path::Path, judge: Arc<Scripted>) -> GraderEngine {
        GraderEngine::new(
            TemplateStore::from_templates([(
                "correctness",
                "Prompt: {{prompt}}\nResponse: {{response}}\nExpected: {{expected}}",
            )]),
            judge,
            JudgmentCache::open(dir).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_grade_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let judge = Scripted::ok(r#"{"score": 8, "notes": "good"}"#);
        let engine = engine(temp.path(), judge.clone());

        let first = engine.grade("correctness", "p", "r", "e").await.unwrap();
        let second = engine.grade("correctness", "p", "r", "e").await.unwrap();

        assert_eq!(first, Judgment::new(8.0, "good"));
        assert_eq!(first, second);
        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *judge.last_prompt.lock().unwrap(),
            "Prompt: p\nResponse: r\nExpected: e"
        );
    }

    #[tokio::test]
    async fn test_cache_persists_across_engines() {
        let temp = TempDir::new().unwrap();
        let judge = Scripted::ok(r#"{"score": 6, "notes": "ok"}"#);

        engine(temp.path(), judge.clone())
            .grade("correctness", "p", "r", "e")
            .await
            .unwrap();
        engine(temp.path(), judge.clone())
            .grade("correctness", "p", "r", "e")
            .await
            .unwrap();

        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unparseable_reply_degrades_and_is_cached() {
        let temp = TempDir::new().unwrap();
        let judge = Scripted::ok("I'd give it a seven");
        let engine = engine(temp.path(), judge.clone());

        let judgment = engine.grade("correctness", "p", "r", "e").await.unwrap();
        assert_eq!(judgment, Judgment::parse_failure());

        engine.grade("correctness", "p", "r", "e").await.unwrap();
        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_judge_failure_degrades() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path(), Scripted::failing("connection refused"));

        let judgment = engine.grade("correctness", "p", "r", "e").await.unwrap();
        assert_eq!(judgment.score, 0.0);
        assert!(judgment.notes.starts_with("API Error: "));
        assert!(judgment.notes.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_unknown_rubric() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path(), Scripted::ok("{}"));
        let err = engine.grade("style", "p", "r", "e").await.unwrap_err();
        assert!(matches!(err, GraderError::UnknownRubric(_)));
    }

    #[test]
    fn test_parse_judgment_variants() {
        assert_eq!(
            parse_judgment(r#"{"score": "7.5", "rationale": "fine"}"#),
            Some(Judgment::new(7.5, "fine"))
        );
        assert_eq!(
            parse_judgment("```json\n{\"score\": 9}\n```"),
            Some(Judgment::new(9.0, ""))
        );
        assert!(parse_judgment(r#"{"notes": "no score"}"#).is_none());
        assert!(parse_judgment(r#"{"score": "high"}"#).is_none());
    }
}
