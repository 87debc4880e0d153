//! HTML rendering of an [`EvaluationReport`].

use tera::{Context, Tera};

use super::EvaluationReport;
use crate::error::ReportError;

const REPORT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Evaluation {{ report.run_id }}</title>
<style>
body { font-family: sans-serif; max-width: 860px; margin: 20px auto; padding: 20px; }
h1 { color: #333; }
.score { font-size: 2em; font-weight: bold; color: #007bff; }
.test-case { border: 1px solid #ddd; padding: 15px; margin-bottom: 15px; border-radius: 5px; }
table { border-collapse: collapse; }
td, th { padding: 4px 12px; text-align: left; }
</style>
</head>
<body>
<h1>Evaluation Report: {{ report.run_id }}</h1>
<p>Suite: <code>{{ report.suite }}</code></p>
{% if report.agent_archive %}<p>Agent archive: <code>{{ report.agent_archive }}</code></p>{% endif %}
<p><strong>Composite score:</strong> <span class="score">{{ report.total_score }}/100</span></p>

<h2>Rubric averages (0-{{ report.score_max }})</h2>
<table>
<tr><th>Rubric</th><th>Average</th><th>Weight</th><th>Judgments</th></tr>
{% for avg in report.rubric_averages %}<tr><td>{{ avg.rubric | capitalize }}</td><td>{{ avg.average }}</td><td>{{ avg.weight }}</td><td>{{ avg.observations }}</td></tr>
{% endfor %}</table>

<h2>Test results</h2>
{% for test in report.tests %}<div class="test-case">
<h3>{{ test.test_id }}</h3>
{% if test.job_id %}<small>Job: {{ test.job_id }}</small>{% endif %}
<ul>
{% for s in test.per_rubric %}<li><strong>{{ s.rubric }}:</strong> {{ s.score }} <i>{{ s.notes }}</i></li>
{% endfor %}</ul>
</div>
{% endfor %}
<hr>
<p><small>Generated {{ report.generated_at }}</small></p>
</body>
</html>
"#;

/// Renders the human-readable report. All interpolated values are HTML-escaped.
pub fn render_html(report: &EvaluationReport) -> Result<String, ReportError> {
    let mut context = Context::new();
    context.insert("report", report);
    Ok(Tera::one_off(REPORT_TEMPLATE, &context, true)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RubricWeights;
    use crate::grader::Judgment;
    use crate::report::{aggregate, RubricScore, TestJudgments};

    #[test]
    fn test_render_includes_scores_and_escapes_notes() {
        let report = aggregate(
            "run-1",
            "home",
            "/agents/a.tar.gz",
            vec![TestJudgments {
                test_id: "t1".to_string(),
                job_id: Some("job-1".to_string()),
                trace_path: None,
                per_rubric: vec![RubricScore::new(
                    "correctness",
                    Judgment::new(8.0, "<script>alert(1)</script>"),
                )],
            }],
            &RubricWeights::default(),
            10.0,
        );

        let html = render_html(&report).unwrap();
        assert!(html.contains("Evaluation Report: run-1"));
        assert!(html.contains("/100</span>"));
        assert_eq!(report.total_score, 28.0);
        assert!(html.contains("Correctness"));
        assert!(html.contains("Job: job-1"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }
}
