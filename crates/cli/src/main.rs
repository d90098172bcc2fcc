use clap::Parser;
use ferrous_upstream_domain::CliOverrides;
use ferrous_upstream_infrastructure::dns::codec;
use ferrous_upstream_infrastructure::dns::FastUpstream;
use hickory_proto::rr::RecordType;
use std::str::FromStr;
use std::time::Instant;
use tracing::{error, info};

mod bootstrap;
mod output;

use output::QueryReport;

#[derive(Parser)]
#[command(name = "ferrous-upstream")]
#[command(version)]
#[command(about = "Ferrous Upstream - query a DNS resolver over UDP, TCP, DoT or DoH")]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<String>,

    /// Upstream endpoint (udp://, tcp://, tls://, https:// or IP:PORT)
    #[arg(short = 'u', long, value_name = "URL")]
    upstream: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Idle timeout in milliseconds; 0 disables connection reuse
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// Maximum simultaneous connections to the upstream
    #[arg(long)]
    max_conns: Option<usize>,

    /// Repeat the query over TCP when a UDP answer comes back truncated
    #[arg(long)]
    no_truncated: bool,

    /// Number of concurrent copies of the query to send
    #[arg(short = 'n', long, default_value_t = 1)]
    count: usize,

    /// Print one JSON object per query
    #[arg(long)]
    json: bool,

    /// Domain name to resolve
    name: String,

    /// Record type
    #[arg(default_value = "A")]
    record_type: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cli_overrides = CliOverrides {
        upstream: cli.upstream.clone(),
        log_level: cli.log_level.clone(),
        idle_timeout_ms: cli.idle_timeout_ms,
        max_conns: cli.max_conns,
    };

    let config = bootstrap::load_config(cli.config.as_deref(), cli_overrides)?;
    bootstrap::init_logging(&config);

    let record_type = RecordType::from_str(&cli.record_type.to_uppercase())
        .map_err(|e| anyhow::anyhow!("Invalid record type '{}': {}", cli.record_type, e))?;

    let upstream = FastUpstream::new(config.upstream.clone())?;
    info!(
        upstream = %config.upstream.addr,
        protocol = %upstream.protocol(),
        "Sending {} {} quer{}",
        cli.count,
        record_type,
        if cli.count == 1 { "y" } else { "ies" }
    );

    let queries = (0..cli.count.max(1))
        .map(|_| codec::build_query(&cli.name, record_type))
        .collect::<Result<Vec<_>, _>>()?;

    let no_truncated = cli.no_truncated;
    let reports = futures::future::join_all(queries.iter().map(|query| {
        let upstream = &upstream;
        async move {
            let started = Instant::now();
            let result = if no_truncated {
                upstream.exchange_no_truncated(query).await
            } else {
                upstream.exchange(query).await
            };
            QueryReport::new(query, result, started.elapsed())
        }
    }))
    .await;

    let stats = upstream.stats();
    info!(
        dialed = stats.primary.dialed,
        reused = stats.primary.reused,
        live = stats.primary.live,
        "Upstream pool stats"
    );
    upstream.close();

    for report in &reports {
        if cli.json {
            println!("{}", serde_json::to_string(report)?);
        } else {
            print!("{}", report.render_text());
        }
    }

    let failed = reports.iter().filter(|r| r.error.is_some()).count();
    if failed > 0 {
        error!(failed = failed, total = reports.len(), "Some queries failed");
        anyhow::bail!("{} of {} queries failed", failed, reports.len());
    }

    Ok(())
}
