use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use toolgate::reward::{HttpRewardWorkflow, RewardWorkflow};
use toolgate::server::{serve, GatewayState};
use toolgate::ConnectionStore;
use tracing_subscriber::EnvFilter;

/// Toolgate MCP Gateway Server
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// HTTP server port
    #[arg(short = 'P', long = "port", default_value = "3000")]
    port: u16,

    /// Path to the connections.json config store
    #[arg(short = 'c', long = "connections")]
    connections: Option<std::path::PathBuf>,

    /// Base URL of the reward workflow collaborator; rewards are disabled
    /// when unset
    #[arg(long = "reward-url", env = "REWARD_WORKFLOW_URL")]
    reward_url: Option<String>,

    /// Evict temporary sessions idle for this many seconds (disabled by
    /// default)
    #[arg(long = "reap-temporary-after")]
    reap_temporary_after: Option<u64>,
}


#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let store = ConnectionStore::from_file(args.connections.clone())?;
    println!(
        "🔧 Loaded {} stored connection configuration(s) from {:?}",
        store.len(),
        args.connections
    );

    let reward: Option<Arc<dyn RewardWorkflow>> = args.reward_url.as_ref().map(|url| {
        println!("💰 Reward workflow enabled at {url}");
        Arc::new(HttpRewardWorkflow::new(url.clone())) as Arc<dyn RewardWorkflow>
    });

    let state = GatewayState::new(store, reward);

    if let Some(idle_secs) = args.reap_temporary_after {
        println!("🧹 Temporary session reaper enabled (idle threshold {idle_secs}s)");
        state
            .sessions
            .spawn_reaper(Duration::from_secs(60), Duration::from_secs(idle_secs));
    }

    ctrlc::set_handler(|| {
        eprintln!("🛑 Received shutdown signal, exiting");
        std::process::exit(0);
    })?;

    serve(state, args.port).await
}
