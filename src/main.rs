use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use serde_json::json;

use iconforge::cli::{Cli, Command};
use iconforge::gateway::SubmitRequest;
use iconforge::identity::Caller;
use iconforge::jobs::JobStatus;
use iconforge::ui::{JobProgress, print_provider};
use iconforge::{Gateway, GatewayConfig, server, telemetry};

const CLI_CALLER: &str = "cli";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::load(cli.config.as_deref())?;
    telemetry::init(cli.verbose, config.log_json);

    match cli.command {
        Command::Serve => server::serve(config).await,
        Command::Generate {
            prompt,
            size,
            plan,
            style,
        } => {
            let gateway = Gateway::new(&config)?;
            let caller = Caller::new(CLI_CALLER, plan.into(), "127.0.0.1");
            let request = SubmitRequest {
                prompt,
                style,
                constraints: size.map(|size| json!({ "size": size })),
            };
            let accepted = gateway.submit(&caller, request)?;

            let progress = JobProgress::start(accepted.job_id.as_str());
            let view = loop {
                let view = gateway.poll(accepted.job_id.as_str())?;
                progress.update(&view);
                if view.status.is_terminal() {
                    break view;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            };
            progress.complete(&view);
            progress.print_job(&view);

            if view.status == JobStatus::Failed {
                bail!("job {} failed", view.job_id);
            }
            Ok(())
        }
        Command::Status => {
            let gateway = Gateway::new(&config)?;
            println!("Providers:");
            for (tier, configured) in gateway.provider_states() {
                print_provider(tier, configured);
            }
            let limit = |l: Option<u32>| l.map_or_else(|| "unlimited".to_string(), |n| n.to_string());
            println!("Quotas:");
            println!("  free      {}/day", limit(config.free_daily_limit));
            println!("  pro       {}/day", limit(config.pro_daily_limit));
            println!("  bypass    {}", config.bypass_quota);
            println!("  rate      {} req/60s per origin", config.ip_rpm_limit);
            Ok(())
        }
    }
}
