//! Workflow Engine Demo
//!
//! Runs a small workflow with two parallel mock LLM nodes feeding one answer
//! node, and prints the engine's event stream as it arrives. The answer is
//! streamed in template order even though both branches stream concurrently.
//!
//! # Usage
//!
//! ```bash
//! # Default run
//! cargo run --bin workflow-demo
//!
//! # Custom question, more workers, engine logs
//! cargo run --bin workflow-demo -- --query "Why Rust?" --max-workers 4 --verbose
//!
//! # Pause on human input, then resume with an answer
//! cargo run --bin workflow-demo -- --human-input "Ada"
//!
//! # Raw events as JSON lines
//! cargo run --bin workflow-demo -- --json
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::Parser;
use colored::Colorize;
use futures::StreamExt;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use graph_engine::{
    load_pause_state, ContentStorage, DebugLoggingLayer, EngineConfig, EventStream, ExecutionLimitsLayer,
    Graph, GraphBuilder, GraphEngine, GraphEngineEvent, GraphRuntimeState, MemoryContentStorage, Node,
    NodeContext, NodeError, NodeExecutor, NodeKind, NodeRegistry, NodeRunResult, ResumeContext, Selector,
    VariablePool,
};

/// Workflow engine demo CLI
#[derive(Parser, Debug)]
#[command(name = "workflow-demo")]
#[command(about = "Run a demo workflow and watch its event stream")]
#[command(version)]
struct Args {
    /// Question passed to the workflow as user input
    #[arg(short, long, default_value = "What makes a good workflow engine?")]
    query: String,

    /// Minimum worker count
    #[arg(long, default_value_t = 1)]
    min_workers: usize,

    /// Maximum worker count
    #[arg(long, default_value_t = 4)]
    max_workers: usize,

    /// Delay between mock LLM chunks in milliseconds
    #[arg(long, default_value_t = 40)]
    chunk_delay_ms: u64,

    /// Insert a human input node and resume with this answer
    #[arg(long)]
    human_input: Option<String>,

    /// Print every event as a JSON line
    #[arg(long)]
    json: bool,

    /// Show engine logs
    #[arg(short, long)]
    verbose: bool,
}

// =============================================================================
// Mock LLM
// =============================================================================

/// Streams a canned reply word by word
struct MockLlm {
    reply: &'static str,
    delay: Duration,
}

#[async_trait]
impl NodeExecutor for MockLlm {
    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        let mut text = String::new();
        for word in self.reply.split_inclusive(' ') {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(NodeError::cancelled()),
                _ = tokio::time::sleep(self.delay) => {}
            }
            ctx.stream("text", word);
            text.push_str(word);
        }
        ctx.finish_stream("text");
        let tokens = text.split_whitespace().count() as u64;
        Ok(NodeRunResult::success(json!({ "text": text })).with_tokens(tokens))
    }
}

fn build_graph(with_human_input: bool) -> anyhow::Result<Arc<Graph>> {
    let template = if with_human_input {
        "Q: {{#start.query#}}\nReviewer {{#review.name#}} says:\n- {{#facts.text#}}\n- {{#opinion.text#}}"
    } else {
        "Q: {{#start.query#}}\n- {{#facts.text#}}\n- {{#opinion.text#}}"
    };

    let mut builder = GraphBuilder::new()
        .node(Node::new("start", NodeKind::Start).with_title("Start"))
        .node(Node::new("facts", NodeKind::Llm).with_title("Facts"))
        .node(Node::new("opinion", NodeKind::Llm).with_title("Opinion"))
        .node(
            Node::new("answer", NodeKind::Answer)
                .with_title("Answer")
                .with_config(json!({ "answer": template })),
        )
        .edge("start", "facts")
        .edge("start", "opinion");

    builder = if with_human_input {
        builder
            .node(
                Node::new("review", NodeKind::HumanInput)
                    .with_title("Review")
                    .with_config(json!({"prompt": "Who reviewed this answer?", "input_field": "name"})),
            )
            .edge("facts", "review")
            .edge("opinion", "review")
            .edge("review", "answer")
    } else {
        builder.edge("facts", "answer").edge("opinion", "answer")
    };

    Ok(Arc::new(builder.build()?))
}

fn registry(delay: Duration) -> NodeRegistry {
    NodeRegistry::with_builtins()
        .register_node(
            "facts",
            MockLlm {
                reply: "It schedules a DAG, runs nodes in parallel, and retries failures.",
                delay,
            },
        )
        .register_node(
            "opinion",
            MockLlm {
                reply: "Deterministic streaming matters more than raw speed.",
                delay: delay + delay / 2,
            },
        )
}

// =============================================================================
// Output Formatting
// =============================================================================

fn print_header(args: &Args) {
    let separator = "━".repeat(60);

    println!();
    println!("{}", separator.cyan());
    println!("{}", "Workflow Engine Demo".cyan().bold());
    println!("{}", separator.cyan());
    println!();

    println!("{}", "Configuration:".white().bold());
    println!("   Query: {}", args.query.green());
    println!("   Workers: {}..{}", args.min_workers, args.max_workers);
    println!("   Chunk delay: {}ms", args.chunk_delay_ms);
    if let Some(name) = &args.human_input {
        println!("   Human input: {}", name.yellow());
    }
    println!();
}

fn print_section(title: &str) {
    let separator = "═".repeat(60);
    println!();
    println!("{}", separator.white());
    println!(" {}", title.white().bold());
    println!("{}", separator.white());
    println!();
}

fn print_event(event: &GraphEngineEvent) {
    match event {
        GraphEngineEvent::GraphRunStarted { run_id, resumed } => {
            let label = if *resumed { "resumed" } else { "started" };
            println!("{}", format!("[run {}] {}", label, run_id).dimmed());
        }
        GraphEngineEvent::NodeRunStarted { base } => {
            let parallel = base
                .parallel
                .as_ref()
                .map(|p| format!(" (parallel {})", p.parallel_id))
                .unwrap_or_default();
            println!("{}", format!("[node] {} started{}", base.node_id, parallel).dimmed());
        }
        GraphEngineEvent::NodeRunSucceeded { base, .. } => {
            println!("{}", format!("[node] {} succeeded", base.node_id).green());
        }
        GraphEngineEvent::NodeRunFailed { base, error, .. } => {
            println!("{}", format!("[node] {} failed: {}", base.node_id, error).red());
        }
        GraphEngineEvent::NodeRunException { base, error, strategy, .. } => {
            println!("{}", format!("[node] {} failed ({}): {}", base.node_id, strategy, error).yellow());
        }
        GraphEngineEvent::NodeRunRetry { base, retry_index, .. } => {
            println!("{}", format!("[node] {} retry #{}", base.node_id, retry_index).yellow());
        }
        GraphEngineEvent::NodeRunPauseRequested { base, .. } => {
            println!("{}", format!("[node] {} waiting for input", base.node_id).yellow());
        }
        GraphEngineEvent::NodeRunStreamChunk { .. } => {}
        GraphEngineEvent::GraphRunSucceeded { total_steps, total_tokens, .. } => {
            println!(
                "{}",
                format!("[run] succeeded in {} steps, {} tokens", total_steps, total_tokens).green().bold()
            );
        }
        GraphEngineEvent::GraphRunFailed { error, .. } => {
            println!("{}", format!("[run] failed: {}", error).red().bold());
        }
        GraphEngineEvent::GraphRunPaused { reasons, state_reference, .. } => {
            println!(
                "{}",
                format!("[run] paused ({} reason(s)), state at {:?}", reasons.len(), state_reference)
                    .yellow()
                    .bold()
            );
        }
        GraphEngineEvent::GraphRunAborted { reason, .. } => {
            println!("{}", format!("[run] aborted: {}", reason).red().bold());
        }
    }
}

/// Print events until the stream ends; returns the terminal event
async fn watch(mut events: EventStream, json_lines: bool) -> anyhow::Result<Option<GraphEngineEvent>> {
    let mut answer = String::new();
    let mut last = None;

    while let Some(event) = events.next().await {
        if json_lines {
            println!("{}", serde_json::to_string(&event)?);
        } else if let GraphEngineEvent::NodeRunStreamChunk { chunk, .. } = &event {
            answer.push_str(chunk);
            print!("{}", chunk.bright_white());
        } else {
            if !answer.is_empty() {
                println!();
                answer.clear();
            }
            print_event(&event);
        }
        if event.is_terminal() {
            last = Some(event);
        }
    }
    Ok(last)
}

fn print_stats(duration: Duration, terminal: Option<&GraphEngineEvent>) {
    let separator = "━".repeat(60);

    println!();
    println!("{}", separator.cyan());
    println!("{}", "Demo Complete".green().bold());
    println!("{}", separator.cyan());
    println!();

    println!("{}", "Execution Statistics:".white().bold());
    println!("   ├─ Duration: {:.2}s", duration.as_secs_f64());
    match terminal {
        Some(GraphEngineEvent::GraphRunSucceeded { outputs, .. }) => {
            let answer = outputs.get("answer").and_then(|v| v.as_str()).unwrap_or_default();
            println!("   └─ Answer Length: {} chars", answer.chars().count());
        }
        Some(other) => println!("   └─ Ended with: {}", other.name()),
        None => println!("   └─ Stream ended without a terminal event"),
    }
    println!();
}

// =============================================================================
// Demo Runner
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "graph_engine=debug" } else { "graph_engine=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    print_header(&args);

    let delay = Duration::from_millis(args.chunk_delay_ms);
    let graph = build_graph(args.human_input.is_some())?;
    let config = EngineConfig::default().with_workers(args.min_workers, args.max_workers);
    let storage: Arc<dyn ContentStorage> = Arc::new(MemoryContentStorage::new());
    let run_id = uuid::Uuid::new_v4().to_string();

    let mut inputs = serde_json::Map::new();
    inputs.insert("query".to_string(), json!(args.query));
    let state = GraphRuntimeState::new(VariablePool::with_user_inputs(inputs));

    print_section("Run");
    let start_time = Instant::now();

    let engine = GraphEngine::builder(run_id.clone(), Arc::clone(&graph), state)
        .config(config.clone())
        .registry(registry(delay))
        .pause_storage(Arc::clone(&storage))
        .layer(Arc::new(DebugLoggingLayer::new()))
        .layer(Arc::new(ExecutionLimitsLayer::new(50, Duration::from_secs(60))))
        .build()
        .await?;
    let mut terminal = watch(engine.run(), args.json).await?;

    if let (Some(GraphEngineEvent::GraphRunPaused { .. }), Some(name)) = (&terminal, &args.human_input) {
        print_section("Resume");
        println!("{}", format!("[INFO] Loading pause state for {}", run_id).dimmed());

        let blob = load_pause_state(storage.as_ref(), &run_id).await?;
        let engine = GraphEngine::builder(run_id.clone(), graph, blob.runtime_state()?)
            .config(config)
            .registry(registry(delay))
            .pause_storage(storage)
            .build()
            .await?;
        let context = ResumeContext::new().input(Selector::new("review", "name"), json!(name));
        terminal = watch(engine.resume(context), args.json).await?;
    }

    print_stats(start_time.elapsed(), terminal.as_ref());
    Ok(())
}
