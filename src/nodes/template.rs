//! Answer templates
//!
//! A template is literal text with `{{#node_id.field#}}` placeholders
//! (nested paths allowed: `{{#tool.json.items.0#}}`). Parsed once into
//! segments that both the Answer node and the response coordinator walk.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::state::{render_value, Selector, VariablePool};

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{#([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)+)#\}\}")
            .expect("placeholder pattern is valid")
    })
}

/// One piece of a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Segment {
    Text(String),
    Variable(Selector),
}

/// A parsed template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Split a template string into text and variable segments
    pub fn parse(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut last = 0;
        for captures in placeholder().captures_iter(source) {
            let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let Some(selector) = Selector::parse(inner.as_str()) else {
                continue;
            };
            if whole.start() > last {
                segments.push(Segment::Text(source[last..whole.start()].to_string()));
            }
            segments.push(Segment::Variable(selector));
            last = whole.end();
        }
        if last < source.len() {
            segments.push(Segment::Text(source[last..].to_string()));
        }
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Selectors referenced by the template, in order
    pub fn selectors(&self) -> impl Iterator<Item = &Selector> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Variable(selector) => Some(selector),
            Segment::Text(_) => None,
        })
    }

    /// Render against the pool; missing values render as empty text
    pub fn render(&self, pool: &VariablePool) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Text(text) => text.clone(),
                Segment::Variable(selector) => {
                    pool.get(selector).map(render_value).unwrap_or_default()
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_mixed_segments() {
        let template = Template::parse("c{{#llm3.text#}}da{{#llm2.text#}}b");
        assert_eq!(
            template.segments(),
            &[
                Segment::Text("c".into()),
                Segment::Variable(Selector::new("llm3", "text")),
                Segment::Text("da".into()),
                Segment::Variable(Selector::new("llm2", "text")),
                Segment::Text("b".into()),
            ]
        );
    }

    #[test]
    fn test_parse_adjacent_and_nested() {
        let template = Template::parse("{{#a.x#}}{{#tool.json.items.0#}}");
        let selectors: Vec<String> = template.selectors().map(|s| s.to_string()).collect();
        assert_eq!(selectors, vec!["a.x", "tool.json.items.0"]);
        assert_eq!(template.segments().len(), 2);
    }

    #[test]
    fn test_malformed_placeholders_stay_text() {
        let template = Template::parse("{{#nofield#}} and {{ llm.text }}");
        assert_eq!(
            template.segments(),
            &[Segment::Text("{{#nofield#}} and {{ llm.text }}".into())]
        );
    }

    #[test]
    fn test_render() {
        let mut pool = VariablePool::new();
        pool.add("llm", "text", json!("world"));
        pool.add("code", "n", json!(3));

        let template = Template::parse("Hello {{#llm.text#}} x{{#code.n#}}{{#missing.v#}}!");
        assert_eq!(template.render(&pool), "Hello world x3!");
    }

    #[test]
    fn test_empty_template() {
        assert!(Template::parse("").segments().is_empty());
    }
}
