//! Structural built-in nodes
//!
//! Start, End, Answer, IfElse and HumanInput. Everything that talks to the
//! outside world (LLM, tools, code) is supplied by the caller.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::template::Template;
use super::{NodeContext, NodeExecutor, NodeRunResult};
use crate::error::NodeError;
use crate::graph::Node;
use crate::pause::PauseReason;
use crate::state::{render_value, Selector};

/// Handle selected by an IfElse node when no case matches
pub const ELSE_HANDLE: &str = "false";

/// Default field a HumanInput node reads its answer from
pub const DEFAULT_INPUT_FIELD: &str = "input";

fn parse_config<T: for<'de> Deserialize<'de>>(node: &Node) -> Result<T, NodeError> {
    serde_json::from_value(node.config.clone()).map_err(|e| {
        NodeError::typed(
            "InvalidConfig",
            format!("invalid config for node {}: {}", node.id, e),
        )
    })
}

/// Publishes the run's user inputs as its outputs
#[derive(Debug, Clone, Copy, Default)]
pub struct StartNode;

#[async_trait]
impl NodeExecutor for StartNode {
    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        Ok(NodeRunResult::success(Value::Object(
            ctx.variables.user_inputs().clone(),
        )))
    }
}

#[derive(Debug, Deserialize)]
struct EndConfig {
    #[serde(default)]
    outputs: Vec<OutputMapping>,
}

#[derive(Debug, Deserialize)]
struct OutputMapping {
    variable: String,
    value_selector: Selector,
}

/// Collects selected pool values into the run's outputs
#[derive(Debug, Clone, Copy, Default)]
pub struct EndNode;

#[async_trait]
impl NodeExecutor for EndNode {
    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        let config: EndConfig = if ctx.node.config.is_null() {
            EndConfig { outputs: Vec::new() }
        } else {
            parse_config(&ctx.node)?
        };
        let outputs: Map<String, Value> = config
            .outputs
            .into_iter()
            .map(|m| {
                let value = ctx.get(&m.value_selector).cloned().unwrap_or(Value::Null);
                (m.variable, value)
            })
            .collect();
        Ok(NodeRunResult::success(Value::Object(outputs)))
    }
}

#[derive(Debug, Deserialize)]
struct AnswerConfig {
    answer: String,
}

/// Renders its template into the `answer` output
#[derive(Debug, Clone, Copy, Default)]
pub struct AnswerNode;

impl AnswerNode {
    /// The template configured on an Answer node
    pub fn template(node: &Node) -> Result<Template, NodeError> {
        let config: AnswerConfig = parse_config(node)?;
        Ok(Template::parse(&config.answer))
    }
}

#[async_trait]
impl NodeExecutor for AnswerNode {
    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        let template = Self::template(&ctx.node)?;
        let answer = template.render(&ctx.variables);
        Ok(NodeRunResult::success(json!({ "answer": answer })))
    }
}

/// Comparison operators understood by [`IfElseNode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = "is")]
    Is,
    #[serde(rename = "is not")]
    IsNot,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not contains")]
    NotContains,
    #[serde(rename = "start with")]
    StartWith,
    #[serde(rename = "end with")]
    EndWith,
    #[serde(rename = "empty")]
    Empty,
    #[serde(rename = "not empty")]
    NotEmpty,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "≠")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "≥")]
    Ge,
    #[serde(rename = "≤")]
    Le,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogicalOperator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Deserialize)]
struct Condition {
    variable_selector: Selector,
    comparison_operator: ComparisonOperator,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct Case {
    case_id: String,
    #[serde(default)]
    logical_operator: LogicalOperator,
    conditions: Vec<Condition>,
}

#[derive(Debug, Deserialize)]
struct IfElseConfig {
    cases: Vec<Case>,
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare(actual: Option<&Value>, op: ComparisonOperator, expected: &Value) -> bool {
    use ComparisonOperator::*;

    if matches!(op, Empty) {
        return is_empty(actual);
    }
    if matches!(op, NotEmpty) {
        return !is_empty(actual);
    }
    let Some(actual) = actual else {
        return matches!(op, IsNot | NotContains | Ne);
    };

    let text = render_value(actual);
    let wanted = render_value(expected);
    match op {
        Is => text == wanted,
        IsNot => text != wanted,
        Contains => match actual {
            Value::Array(items) => items.iter().any(|i| render_value(i) == wanted),
            _ => text.contains(&wanted),
        },
        NotContains => match actual {
            Value::Array(items) => !items.iter().any(|i| render_value(i) == wanted),
            _ => !text.contains(&wanted),
        },
        StartWith => text.starts_with(&wanted),
        EndWith => text.ends_with(&wanted),
        Eq | Ne | Gt | Lt | Ge | Le => match (as_number(actual), as_number(expected)) {
            (Some(a), Some(b)) => match op {
                Eq => a == b,
                Ne => a != b,
                Gt => a > b,
                Lt => a < b,
                Ge => a >= b,
                _ => a <= b,
            },
            _ => false,
        },
        Empty | NotEmpty => false,
    }
}

/// Selects the first case whose conditions hold; `false` otherwise
#[derive(Debug, Clone, Copy, Default)]
pub struct IfElseNode;

#[async_trait]
impl NodeExecutor for IfElseNode {
    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        let config: IfElseConfig = parse_config(&ctx.node)?;

        let selected = config.cases.iter().find(|case| {
            let mut results = case.conditions.iter().map(|c| {
                compare(
                    ctx.get(&c.variable_selector),
                    c.comparison_operator,
                    &c.value,
                )
            });
            match case.logical_operator {
                LogicalOperator::And => results.all(|r| r),
                LogicalOperator::Or => results.any(|r| r),
            }
        });

        Ok(match selected {
            Some(case) => NodeRunResult::branch(
                case.case_id.clone(),
                json!({"result": true, "selected_case_id": case.case_id}),
            ),
            None => NodeRunResult::branch(ELSE_HANDLE, json!({"result": false})),
        })
    }
}

#[derive(Debug, Deserialize)]
struct HumanInputConfig {
    #[serde(default)]
    prompt: String,
    #[serde(default = "default_input_field")]
    input_field: String,
}

fn default_input_field() -> String {
    DEFAULT_INPUT_FIELD.to_string()
}

/// Pauses the run until a value is written to `(node_id, input_field)`
#[derive(Debug, Clone, Copy, Default)]
pub struct HumanInputNode;

#[async_trait]
impl NodeExecutor for HumanInputNode {
    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        let config: HumanInputConfig = if ctx.node.config.is_null() {
            HumanInputConfig {
                prompt: String::new(),
                input_field: default_input_field(),
            }
        } else {
            parse_config(&ctx.node)?
        };

        let selector = Selector::new(ctx.node.id.clone(), config.input_field.clone());
        match ctx.get(&selector) {
            Some(value) => {
                let mut outputs = Map::new();
                outputs.insert(config.input_field, value.clone());
                Ok(NodeRunResult::success(Value::Object(outputs)))
            }
            None => Ok(NodeRunResult::paused(PauseReason::HumanInputRequired {
                node_id: ctx.node.id.clone(),
                prompt: config.prompt,
                input_field: config.input_field,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;
    use crate::state::VariablePool;
    use std::sync::Arc;

    fn ctx(node: Node, pool: VariablePool) -> NodeContext {
        NodeContext::new(Arc::new(node), Arc::new(pool))
    }

    #[tokio::test]
    async fn test_start_publishes_inputs() {
        let mut inputs = Map::new();
        inputs.insert("query".into(), json!("hi"));
        let result = StartNode
            .run(ctx(
                Node::new("start", NodeKind::Start),
                VariablePool::with_user_inputs(inputs),
            ))
            .await
            .unwrap();
        assert_eq!(result.outputs["query"], json!("hi"));
    }

    #[tokio::test]
    async fn test_end_collects_selectors() {
        let mut pool = VariablePool::new();
        pool.add("llm", "text", json!("done"));
        let node = Node::new("end", NodeKind::End).with_config(json!({
            "outputs": [
                {"variable": "result", "value_selector": ["llm", "text"]},
                {"variable": "missing", "value_selector": ["nope", "x"]}
            ]
        }));

        let result = EndNode.run(ctx(node, pool)).await.unwrap();
        assert_eq!(result.outputs["result"], json!("done"));
        assert_eq!(result.outputs["missing"], Value::Null);
    }

    #[tokio::test]
    async fn test_answer_renders_template() {
        let mut pool = VariablePool::new();
        pool.add("llm", "text", json!("there"));
        let node = Node::new("answer", NodeKind::Answer)
            .with_config(json!({"answer": "Hi {{#llm.text#}}."}));

        let result = AnswerNode.run(ctx(node, pool)).await.unwrap();
        assert_eq!(result.outputs["answer"], json!("Hi there."));
    }

    #[tokio::test]
    async fn test_answer_requires_template() {
        let err = AnswerNode
            .run(ctx(Node::new("answer", NodeKind::Answer), VariablePool::new()))
            .await
            .unwrap_err();
        assert_eq!(err.error_type, "InvalidConfig");
    }

    fn if_else() -> Node {
        Node::new("if", NodeKind::IfElse).with_config(json!({
            "cases": [
                {
                    "case_id": "big",
                    "conditions": [
                        {"variable_selector": ["start", "n"], "comparison_operator": ">", "value": 10}
                    ]
                },
                {
                    "case_id": "greeting",
                    "logical_operator": "or",
                    "conditions": [
                        {"variable_selector": ["start", "text"], "comparison_operator": "start with", "value": "hello"},
                        {"variable_selector": ["start", "text"], "comparison_operator": "contains", "value": "hi"}
                    ]
                }
            ]
        }))
    }

    #[tokio::test]
    async fn test_if_else_selects_first_matching_case() {
        let mut pool = VariablePool::new();
        pool.add("start", "n", json!(42));
        pool.add("start", "text", json!("hello"));

        let result = IfElseNode.run(ctx(if_else(), pool)).await.unwrap();
        assert_eq!(result.edge_source_handle.as_deref(), Some("big"));
        assert_eq!(result.outputs["selected_case_id"], json!("big"));
    }

    #[tokio::test]
    async fn test_if_else_or_case_and_else() {
        let mut pool = VariablePool::new();
        pool.add("start", "n", json!("3"));
        pool.add("start", "text", json!("oh hi"));
        let result = IfElseNode.run(ctx(if_else(), pool)).await.unwrap();
        assert_eq!(result.edge_source_handle.as_deref(), Some("greeting"));

        let mut pool = VariablePool::new();
        pool.add("start", "text", json!("bye"));
        let result = IfElseNode.run(ctx(if_else(), pool)).await.unwrap();
        assert_eq!(result.edge_source_handle.as_deref(), Some(ELSE_HANDLE));
        assert_eq!(result.outputs["result"], json!(false));
    }

    #[test]
    fn test_compare_operators() {
        use ComparisonOperator::*;
        assert!(compare(None, Empty, &Value::Null));
        assert!(compare(Some(&json!([])), Empty, &Value::Null));
        assert!(compare(Some(&json!(["a", "b"])), Contains, &json!("b")));
        assert!(compare(Some(&json!("abc")), EndWith, &json!("bc")));
        assert!(compare(Some(&json!(5)), Le, &json!(5)));
        assert!(!compare(Some(&json!("x")), Gt, &json!(1)));
        assert!(compare(None, IsNot, &json!("x")));
    }

    #[tokio::test]
    async fn test_human_input_pauses_until_answered() {
        let node = Node::new("human", NodeKind::HumanInput)
            .with_config(json!({"prompt": "Approve?", "input_field": "approved"}));

        let result = HumanInputNode
            .run(ctx(node.clone(), VariablePool::new()))
            .await
            .unwrap();
        assert_eq!(
            result.pause,
            Some(PauseReason::HumanInputRequired {
                node_id: "human".into(),
                prompt: "Approve?".into(),
                input_field: "approved".into(),
            })
        );

        let mut pool = VariablePool::new();
        pool.add("human", "approved", json!(true));
        let result = HumanInputNode.run(ctx(node, pool)).await.unwrap();
        assert!(result.pause.is_none());
        assert_eq!(result.outputs["approved"], json!(true));
    }
}
