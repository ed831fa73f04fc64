//! Dispatch overhead benchmark
//!
//! Registers the same no-op agent several times on one topic and measures
//! how long fan-out takes per record, without a broker in the loop.

use clap::Parser;
use serde_json::Value;
use silk_engine::agent::{Agent, AgentContext, AgentRegistry, HandlerError};
use silk_engine::dispatch::DispatchEngine;
use silk_engine::message::{MessageEnvelope, PayloadShape};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "dispatch-bench", about = "Measure per-record dispatch latency")]
struct Args {
    /// Topic the agents are registered on
    #[arg(long, default_value = "mock-topic")]
    topic: String,

    /// Number of agents on the topic
    #[arg(long, default_value = "5")]
    agents: usize,

    /// Records to dispatch
    #[arg(long, default_value = "100")]
    iterations: u32,
}

async fn noop(_payload: Arc<Value>, _ctx: AgentContext) -> Result<(), HandlerError> {
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if args.iterations == 0 {
        eprintln!("--iterations must be at least 1");
        std::process::exit(2);
    }

    let registry = Arc::new(AgentRegistry::new());
    let agent = Arc::new(Agent::from_fn(args.topic.as_str(), PayloadShape::any(), noop));
    for _ in 0..args.agents {
        registry.register(agent.clone());
    }
    let engine = DispatchEngine::new(registry);

    let mut total = Duration::ZERO;
    let mut failures = 0usize;
    for offset in 0..args.iterations {
        let record = MessageEnvelope::new(
            args.topic.as_str(),
            0,
            i64::from(offset),
            None,
            r#"{"orderid": 18, "items": ["a", "b"]}"#,
        );

        let started = Instant::now();
        match engine.dispatch(record).await {
            Ok(report) => failures += report.failures.len(),
            Err(e) => {
                eprintln!("dispatch failed: {e}");
                std::process::exit(1);
            }
        }
        total += started.elapsed();
    }

    let average = total / args.iterations;
    println!(
        "{} records x {} agents on '{}': avg {:?} per record, {} failures",
        args.iterations, args.agents, args.topic, average, failures
    );
}
