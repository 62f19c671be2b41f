//! Stateless parser for tagged workflow markup.
//!
//! ```text
//! <workflow name="create-story">
//! <step n="1" goal="Analyze requirements">
//!   <action>Summarize {{story_id}}</action>
//!   <check if="complexity == high">
//!     <ask>Which components change?</ask>
//!   </check>
//!   <goto step="3" if="skip_design is true"/>
//! </step>
//! </workflow>
//! ```
//!
//! Step headers are parsed eagerly; step bodies are parsed on demand by
//! [`parse_body`]. Both are pure functions over immutable input.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::core::step::{Action, ActionKind, Check, GateSpec, Step, StepBody, WorkflowDefinition};
use crate::core::types::validate_id;
use crate::error::FlowError;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)<!--.*?-->|<(/?)([A-Za-z][A-Za-z0-9-]*)((?:\s+[A-Za-z][A-Za-z0-9_-]*\s*=\s*"[^"]*")*)\s*(/?)>"#,
    )
    .expect("tag regex")
});
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z][A-Za-z0-9_-]*)\s*=\s*"([^"]*)""#).expect("attribute regex")
});

const STEP_ATTRS: [&str; 6] = ["n", "goal", "optional", "if", "gate", "threshold"];

/// A matched tag within a source string.
struct Tag {
    start: usize,
    end: usize,
    closing: bool,
    self_closing: bool,
    name: String,
    attrs: BTreeMap<String, String>,
}

/// Parse a workflow definition. `fallback_name` is used when the source has
/// no `<workflow name="...">` wrapper.
pub fn parse_definition(src: &str, fallback_name: &str) -> Result<WorkflowDefinition, FlowError> {
    let mut name = fallback_name.to_string();
    let mut steps = Vec::new();
    let mut pos = 0;

    while let Some(tag) = next_tag(src, pos, 1)? {
        pos = tag.end;
        let line = line_at(src, tag.start, 1);
        match (tag.name.as_str(), tag.closing) {
            ("", _) => {}
            ("workflow", true) => {}
            ("workflow", false) => {
                if let Some(value) = tag.attrs.get("name") {
                    name = unescape(value.trim());
                }
            }
            ("step", false) => {
                if tag.self_closing {
                    return Err(FlowError::parse(Some(line), "<step> must have a body"));
                }
                let (close_start, close_end) = find_close(src, tag.end, "step")
                    .ok_or_else(|| FlowError::parse(Some(line), "unclosed <step>"))?;
                let raw = &src[tag.end..close_start];
                if next_named_open(raw, "step") {
                    return Err(FlowError::parse(Some(line), "steps cannot be nested"));
                }
                let mut step = step_header(&tag, line)?;
                step.raw_content = raw.to_string();
                step.content_line = line_at(src, tag.end, 1);
                steps.push(step);
                pos = close_end;
            }
            (other, closing) => {
                let shown = if closing { format!("</{other}>") } else { format!("<{other}>") };
                return Err(FlowError::parse(
                    Some(line),
                    format!("unexpected {shown} outside a step"),
                ));
            }
        }
    }

    if steps.is_empty() {
        return Err(FlowError::parse(None, "workflow defines no steps"));
    }
    for (index, step) in steps.iter().enumerate() {
        let expected = index as u32 + 1;
        if step.number != expected {
            return Err(FlowError::parse(
                Some(step.content_line),
                format!(
                    "step numbers must be contiguous from 1: expected {expected}, found {}",
                    step.number
                ),
            ));
        }
    }

    Ok(WorkflowDefinition { name, steps })
}

/// Parse a step body into actions and checks.
///
/// `base_line` is the line of `raw`'s first character in the definition.
pub fn parse_body(raw: &str, base_line: usize) -> Result<StepBody, FlowError> {
    let mut body = StepBody::default();
    let mut pos = 0;

    while pos < raw.len() {
        let Some(tag) = next_tag(raw, pos, base_line)? else {
            push_note(&mut body.actions, &raw[pos..]);
            break;
        };
        push_note(&mut body.actions, &raw[pos..tag.start]);
        let line = line_at(raw, tag.start, base_line);
        pos = tag.end;

        if tag.name.is_empty() {
            continue;
        }
        if tag.closing {
            return Err(FlowError::parse(
                Some(line),
                format!("unexpected </{}>", tag.name),
            ));
        }
        match tag.name.as_str() {
            "step" => return Err(FlowError::parse(Some(line), "steps cannot be nested")),
            "check" => {
                let (inner, next) = tag_content(raw, &tag, line)?;
                let inner_line = line_at(raw, tag.end, base_line);
                body.checks.push(build_check(&tag, inner, inner_line, line)?);
                pos = next;
            }
            _ => {
                let (content, next) = tag_content(raw, &tag, line)?;
                body.actions.push(build_action(&tag, content, line)?);
                pos = next;
            }
        }
    }

    Ok(body)
}

fn build_check(tag: &Tag, inner: &str, inner_line: usize, line: usize) -> Result<Check, FlowError> {
    check_attrs(tag, &["if"], line)?;
    let condition = tag
        .attrs
        .get("if")
        .map(|c| unescape(c.trim()))
        .filter(|c| !c.is_empty())
        .ok_or_else(|| FlowError::parse(Some(line), "<check> requires an if attribute"))?;
    if next_named_open(inner, "check") {
        return Err(FlowError::parse(Some(line), "checks cannot be nested"));
    }
    let nested = parse_body(inner, inner_line)?;
    Ok(Check {
        condition,
        actions: nested.actions,
    })
}

fn build_action(tag: &Tag, content: &str, line: usize) -> Result<Action, FlowError> {
    let text = unescape(content.trim());
    let kind = match tag.name.as_str() {
        "action" => {
            check_attrs(tag, &["if"], line)?;
            ActionKind::Prompt {
                instruction: non_empty(text, tag, line)?,
            }
        }
        "ask" => {
            check_attrs(tag, &["if"], line)?;
            ActionKind::Elicit {
                question: non_empty(text, tag, line)?,
                required: false,
            }
        }
        "elicit-required" => {
            check_attrs(tag, &["if"], line)?;
            ActionKind::Elicit {
                question: text,
                required: true,
            }
        }
        "output" => {
            check_attrs(tag, &["if"], line)?;
            ActionKind::Emit { text }
        }
        "template-output" => {
            check_attrs(tag, &["if", "file"], line)?;
            ActionKind::RenderTemplate {
                file: required_attr(tag, "file", line)?,
                content: unescape(content.trim_end().trim_start_matches(['\n', '\r'])),
            }
        }
        "goto" => {
            check_attrs(tag, &["if", "step"], line)?;
            let raw = required_attr(tag, "step", line)?;
            ActionKind::Jump {
                step: parse_int(&raw, "step", line)?,
            }
        }
        "invoke-workflow" => {
            let path = required_attr(tag, "path", line)?;
            let inputs = tag
                .attrs
                .iter()
                .filter(|(key, _)| key.as_str() != "path" && key.as_str() != "if")
                .map(|(key, value)| (key.clone(), unescape(value)))
                .collect();
            ActionKind::InvokeSubworkflow { path, inputs }
        }
        "invoke-task" => {
            check_attrs(tag, &["if", "path"], line)?;
            ActionKind::InvokeTask {
                path: required_attr(tag, "path", line)?,
            }
        }
        other => {
            return Err(FlowError::parse(Some(line), format!("unknown tag <{other}>")));
        }
    };

    let mut action = Action::new(kind);
    if let Some(condition) = tag.attrs.get("if") {
        let condition = unescape(condition.trim());
        if condition.is_empty() {
            return Err(FlowError::parse(Some(line), "empty if attribute"));
        }
        action = action.with_condition(condition);
    }
    Ok(action)
}

fn step_header(tag: &Tag, line: usize) -> Result<Step, FlowError> {
    check_attrs(tag, &STEP_ATTRS, line)?;
    let number = parse_int(&required_attr(tag, "n", line)?, "n", line)?;
    let goal = tag.attrs.get("goal").map(|g| unescape(g.trim())).unwrap_or_default();
    let mut step = Step::new(number, goal, String::new());

    step.optional = match tag.attrs.get("optional").map(|v| v.trim()) {
        None | Some("false") => false,
        Some("true") => true,
        Some(other) => {
            return Err(FlowError::parse(
                Some(line),
                format!("optional must be \"true\" or \"false\" (got \"{other}\")"),
            ));
        }
    };

    if let Some(condition) = tag.attrs.get("if") {
        let condition = unescape(condition.trim());
        if condition.is_empty() {
            return Err(FlowError::parse(Some(line), "empty if attribute"));
        }
        step.condition = Some(condition);
    }

    let threshold = match tag.attrs.get("threshold") {
        Some(raw) => Some(parse_threshold(raw, line)?),
        None => None,
    };
    match tag.attrs.get("gate").map(|g| g.trim()) {
        Some("") => return Err(FlowError::parse(Some(line), "empty gate attribute")),
        Some(name) => {
            validate_id(name)
                .map_err(|err| FlowError::parse(Some(line), format!("invalid gate name: {err}")))?;
            step.gate = Some(GateSpec {
                name: name.to_string(),
                threshold,
            });
        }
        None if threshold.is_some() => {
            return Err(FlowError::parse(Some(line), "threshold requires a gate attribute"));
        }
        None => {}
    }

    Ok(step)
}

/// Gate thresholds are scores, so only finite values in [0, 100] are allowed.
fn parse_threshold(raw: &str, line: usize) -> Result<f64, FlowError> {
    match raw.trim().parse::<f64>() {
        Ok(value) if (0.0..=100.0).contains(&value) => Ok(value),
        _ => Err(FlowError::parse(
            Some(line),
            format!("threshold must be a number within [0, 100] (got \"{raw}\")"),
        )),
    }
}

/// Find the next tag or comment at or after `pos`. Comments have an empty name.
fn next_tag(src: &str, pos: usize, base_line: usize) -> Result<Option<Tag>, FlowError> {
    let Some(caps) = TAG_RE.captures_at(src, pos) else {
        return Ok(None);
    };
    let Some(whole) = caps.get(0) else {
        return Ok(None);
    };
    let Some(name) = caps.get(2) else {
        return Ok(Some(Tag {
            start: whole.start(),
            end: whole.end(),
            closing: false,
            self_closing: true,
            name: String::new(),
            attrs: BTreeMap::new(),
        }));
    };
    let line = line_at(src, whole.start(), base_line);
    Ok(Some(Tag {
        start: whole.start(),
        end: whole.end(),
        closing: !caps[1].is_empty(),
        self_closing: !caps[4].is_empty(),
        name: name.as_str().to_string(),
        attrs: parse_attrs(&caps, line)?,
    }))
}

fn parse_attrs(caps: &Captures<'_>, line: usize) -> Result<BTreeMap<String, String>, FlowError> {
    let mut attrs = BTreeMap::new();
    let Some(raw) = caps.get(3) else {
        return Ok(attrs);
    };
    for attr in ATTR_RE.captures_iter(raw.as_str()) {
        let key = attr[1].to_string();
        if attrs.insert(key.clone(), attr[2].to_string()).is_some() {
            return Err(FlowError::parse(
                Some(line),
                format!("duplicate attribute '{key}'"),
            ));
        }
    }
    Ok(attrs)
}

/// Inner content of a paired tag and the position after its close tag.
fn tag_content<'a>(src: &'a str, tag: &Tag, line: usize) -> Result<(&'a str, usize), FlowError> {
    if tag.self_closing {
        return Ok(("", tag.end));
    }
    let (close_start, close_end) = find_close(src, tag.end, &tag.name)
        .ok_or_else(|| FlowError::parse(Some(line), format!("unclosed <{}>", tag.name)))?;
    Ok((&src[tag.end..close_start], close_end))
}

fn find_close(src: &str, from: usize, name: &str) -> Option<(usize, usize)> {
    let needle = format!("</{name}>");
    src[from..]
        .find(&needle)
        .map(|offset| (from + offset, from + offset + needle.len()))
}

fn next_named_open(src: &str, name: &str) -> bool {
    TAG_RE.captures_iter(src).any(|caps| {
        caps.get(2).is_some_and(|n| n.as_str() == name) && caps.get(1).is_some_and(|c| c.is_empty())
    })
}

fn check_attrs(tag: &Tag, allowed: &[&str], line: usize) -> Result<(), FlowError> {
    match tag.attrs.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(key) => Err(FlowError::parse(
            Some(line),
            format!("<{}> does not accept attribute '{key}'", tag.name),
        )),
        None => Ok(()),
    }
}

fn required_attr(tag: &Tag, key: &str, line: usize) -> Result<String, FlowError> {
    tag.attrs
        .get(key)
        .map(|v| unescape(v.trim()))
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            FlowError::parse(
                Some(line),
                format!("<{}> requires a {key} attribute", tag.name),
            )
        })
}

fn parse_int(raw: &str, key: &str, line: usize) -> Result<u32, FlowError> {
    raw.trim().parse::<u32>().map_err(|_| {
        FlowError::parse(
            Some(line),
            format!("attribute {key} must be an integer (got \"{raw}\")"),
        )
    })
}

fn non_empty(text: String, tag: &Tag, line: usize) -> Result<String, FlowError> {
    if text.is_empty() {
        return Err(FlowError::parse(
            Some(line),
            format!("<{}> must not be empty", tag.name),
        ));
    }
    Ok(text)
}

fn push_note(actions: &mut Vec<Action>, text: &str) {
    let text = unescape(text.trim());
    if !text.is_empty() {
        actions.push(Action::new(ActionKind::Note { text }));
    }
}

fn line_at(src: &str, offset: usize, base_line: usize) -> usize {
    base_line + src[..offset].matches('\n').count()
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# Create story

<workflow name="create-story">
<step n="1" goal="Analyze requirements">
  Read everything first.
  <action>Summarize {{story_id}}</action>
  <!-- reviewers: keep this short -->
  <check if="complexity == high">
    <ask>Which components change?</ask>
    <output>Flagged as complex</output>
  </check>
  <goto step="3" if="skip_design is true"/>
</step>
<step n="2" goal="Design" optional="true" if="mode != quick">
  <template-output file="docs/{{story_id}}.md">
## Design
{{summary|tbd}}
  </template-output>
  <invoke-workflow path="review.md" focus="api"/>
</step>
<step n="3" goal="Review" gate="review" threshold="90">
  <invoke-task path="tasks/lint.md"/>
  <elicit-required/>
</step>
</workflow>
"#;

    #[test]
    fn parses_headers_and_bodies() {
        let def = parse_definition(SAMPLE, "fallback").expect("parse");
        assert_eq!(def.name, "create-story");
        assert_eq!(def.step_numbers(), vec![1, 2, 3]);

        let step1 = &def.steps[0];
        assert_eq!(step1.goal, "Analyze requirements");
        assert!(!step1.is_parsed());
        let body = step1.body().expect("body");
        assert_eq!(body.actions.len(), 3);
        assert_eq!(
            body.actions[0].kind,
            ActionKind::Note {
                text: "Read everything first.".to_string()
            }
        );
        assert_eq!(
            body.actions[1].kind,
            ActionKind::Prompt {
                instruction: "Summarize {{story_id}}".to_string()
            }
        );
        assert_eq!(body.actions[2].kind, ActionKind::Jump { step: 3 });
        assert_eq!(body.actions[2].condition.as_deref(), Some("skip_design is true"));
        assert_eq!(body.checks.len(), 1);
        assert_eq!(body.checks[0].condition, "complexity == high");
        assert_eq!(body.checks[0].actions.len(), 2);

        let step2 = &def.steps[1];
        assert!(step2.optional);
        assert_eq!(step2.condition.as_deref(), Some("mode != quick"));
        let body = step2.body().expect("body");
        match &body.actions[0].kind {
            ActionKind::RenderTemplate { file, content } => {
                assert_eq!(file, "docs/{{story_id}}.md");
                assert!(content.starts_with("## Design"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match &body.actions[1].kind {
            ActionKind::InvokeSubworkflow { path, inputs } => {
                assert_eq!(path, "review.md");
                assert_eq!(inputs.get("focus").map(String::as_str), Some("api"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let step3 = &def.steps[2];
        assert_eq!(
            step3.gate,
            Some(GateSpec {
                name: "review".to_string(),
                threshold: Some(90.0)
            })
        );
        let body = step3.body().expect("body");
        assert_eq!(
            body.actions[1].kind,
            ActionKind::Elicit {
                question: String::new(),
                required: true
            }
        );
    }

    #[test]
    fn fallback_name_without_wrapper() {
        let def = parse_definition("<step n=\"1\"><output>x</output></step>", "quick")
            .expect("parse");
        assert_eq!(def.name, "quick");
        assert_eq!(def.steps[0].goal, "");
    }

    #[test]
    fn conditions_may_contain_escaped_and_raw_operators() {
        let src = "<step n=\"1\" if=\"count &lt; 3\"><output if=\"count >= 1\">x</output></step>";
        let def = parse_definition(src, "wf").expect("parse");
        assert_eq!(def.steps[0].condition.as_deref(), Some("count < 3"));
        let body = def.steps[0].body().expect("body");
        assert_eq!(body.actions[0].condition.as_deref(), Some("count >= 1"));
    }

    #[test]
    fn rejects_non_contiguous_numbers() {
        let src = "<step n=\"1\"></step>\n<step n=\"3\"></step>";
        let err = parse_definition(src, "wf").unwrap_err();
        assert!(err.to_string().contains("expected 2, found 3"));
    }

    #[test]
    fn rejects_non_integer_attributes() {
        let err = parse_definition("<step n=\"one\"></step>", "wf").unwrap_err();
        assert!(err.to_string().contains("attribute n must be an integer"));

        let step = parse_definition("<step n=\"1\"><goto step=\"2.5\"/></step>", "wf")
            .expect("header parses");
        let err = step.steps[0].body().unwrap_err();
        assert!(err.to_string().contains("attribute step must be an integer"));
    }

    #[test]
    fn rejects_bad_optional_and_unknown_attributes() {
        let err = parse_definition("<step n=\"1\" optional=\"yes\"></step>", "wf").unwrap_err();
        assert!(err.to_string().contains("optional must be"));

        let err = parse_definition("<step n=\"1\" color=\"red\"></step>", "wf").unwrap_err();
        assert!(err.to_string().contains("does not accept attribute 'color'"));
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        for raw in ["NaN", "inf", "-1", "100.5", "high"] {
            let src = format!("<step n=\"1\" gate=\"review\" threshold=\"{raw}\"></step>");
            let err = parse_definition(&src, "wf").unwrap_err();
            assert!(
                err.to_string().contains("threshold must be a number within [0, 100]"),
                "{raw}: {err}"
            );
        }
        let def = parse_definition("<step n=\"1\" gate=\"review\" threshold=\"0\"></step>", "wf")
            .expect("zero is allowed");
        assert_eq!(def.steps[0].gate.as_ref().and_then(|g| g.threshold), Some(0.0));
    }

    #[test]
    fn rejects_gate_names_unsafe_for_paths() {
        for name in ["a/b", "..", "two words"] {
            let src = format!("<step n=\"1\" gate=\"{name}\"></step>");
            let err = parse_definition(&src, "wf").unwrap_err();
            assert!(err.to_string().contains("invalid gate name"), "{name}: {err}");
        }
    }

    #[test]
    fn body_errors_report_source_lines() {
        let src = "<step n=\"1\">\n<output>ok</output>\n<mystery/>\n</step>";
        let def = parse_definition(src, "wf").expect("parse");
        match def.steps[0].body().unwrap_err() {
            FlowError::Parse { line, message } => {
                assert_eq!(line, Some(3));
                assert!(message.contains("unknown tag <mystery>"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_structural_problems() {
        assert!(parse_definition("no steps here", "wf").is_err());
        assert!(parse_definition("<step n=\"1\">", "wf").is_err());
        assert!(parse_definition("<output>x</output>", "wf").is_err());
        let def = parse_definition(
            "<step n=\"1\"><check if=\"a\"><check if=\"b\"></check></check></step>",
            "wf",
        )
        .expect("parse");
        assert!(def.steps[0].body().is_err());
        let def = parse_definition("<step n=\"1\"><check><output>x</output></check></step>", "wf")
            .expect("parse");
        assert!(def.steps[0].body().is_err());
    }
}
