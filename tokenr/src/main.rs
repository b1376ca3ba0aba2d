use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use log::info;
use tokenr::{InitOptions, Status, TagValue, Tracker, UsageRecord};

/// Send one usage record to the tracking endpoint.
#[derive(Debug, Parser)]
#[clap(name = "tokenr")]
struct Opt {
    /// API token
    #[clap(long, env = "TOKENR_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Tracking endpoint
    #[clap(long, env = "TOKENR_URL")]
    url: Option<String>,

    /// Provider slug, e.g. openai, anthropic, google
    #[clap(long)]
    provider: String,

    #[clap(long)]
    model: String,

    /// Fresh input tokens, excluding cache reads
    #[clap(long)]
    input_tokens: u64,

    #[clap(long)]
    output_tokens: u64,

    #[clap(long, default_value_t = 0)]
    cache_read_tokens: u64,

    #[clap(long, default_value_t = 0)]
    cache_write_tokens: u64,

    #[clap(long)]
    agent_id: Option<String>,

    #[clap(long)]
    feature: Option<String>,

    #[clap(long)]
    team_id: Option<String>,

    /// success or error
    #[clap(long, default_value_t = Status::Success)]
    status: Status,

    #[clap(long)]
    latency_ms: Option<u64>,

    /// RFC 3339 time the LLM request was made
    #[clap(long)]
    requested_at: Option<DateTime<Utc>>,

    /// Tag as key=value; repeatable
    #[clap(long = "tag", value_parser = parse_tag)]
    tags: Vec<(String, TagValue)>,

    /// Verbose output
    #[clap(short, long)]
    verbose: bool,
}

fn parse_tag(raw: &str) -> Result<(String, TagValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("invalid tag `{}`: expected key=value", raw))?;
    if key.is_empty() {
        return Err(format!("invalid tag `{}`: empty key", raw));
    }
    Ok((key.to_string(), TagValue::infer(value)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if opt.verbose { "info" } else { "warn" },
    ))
    .init();

    let mut options = InitOptions::new().debug(opt.verbose);
    if let Some(token) = opt.token {
        options = options.token(token);
    }
    if let Some(url) = opt.url {
        options = options.url(url);
    }

    let tracker = Tracker::new();
    tracker.initialize(options);

    let record = UsageRecord {
        agent_id: opt.agent_id,
        feature_name: opt.feature,
        team_id: opt.team_id,
        status: opt.status,
        latency_ms: opt.latency_ms,
        tags: opt.tags.into_iter().collect(),
        requested_at: opt.requested_at,
        ..UsageRecord::new(opt.provider, opt.model, opt.input_tokens, opt.output_tokens)
            .with_cache(opt.cache_read_tokens, opt.cache_write_tokens)
    };
    info!("Sending usage for {} ({})", record.model, record.provider);

    let ack = tracker
        .track_now(record)
        .await
        .context("Failed to track usage")?;

    match ack.cost {
        Some(cost) => println!("Tracked, cost ${}", cost),
        None => println!("Tracked"),
    }

    Ok(())
}
