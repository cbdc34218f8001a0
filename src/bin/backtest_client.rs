use std::env;

use anyhow::{anyhow, Result};
use backtesting::client::backtest::HttpClient;
use backtesting::config::ClientConfig;
use backtesting::http::backtest::RuleFilters;
use backtesting::orchestrator::Orchestrator;
use backtesting::types::TimeRange;
use log::info;
use time::{Duration, OffsetDateTime};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    let config = ClientConfig::from_args(&args)?;

    let orchestrator = Orchestrator::new(
        HttpClient::new(config.base_url.clone()),
        config.orchestrator.clone(),
    );

    let rules = orchestrator.load_rules(RuleFilters::default()).await?;
    if !rules.iter().any(|rule| rule.id == config.rule_id) {
        return Err(anyhow!("rule {} is not in the catalog", config.rule_id));
    }

    let end = OffsetDateTime::now_utc();
    orchestrator.select_rule(config.rule_id.clone());
    orchestrator.set_range(TimeRange::new(end - Duration::days(config.days), end));

    let mut snapshots = orchestrator.subscribe();
    let handle = orchestrator.run().await?;
    info!("Waiting on task {}", handle.task_id);

    let snapshot = loop {
        snapshots.changed().await?;
        let snapshot = snapshots.borrow_and_update().clone();
        if !snapshot.phase.is_active() {
            break snapshot;
        }
    };
    orchestrator.dispose();

    if let Some(err) = &snapshot.error {
        return Err(anyhow!("{err}"));
    }
    let rule = snapshot
        .active_rule_result
        .ok_or_else(|| anyhow!("task finished without a result"))?;

    println!("rule:        {} ({})", rule.rule_name, rule.rule_id);
    println!("points:      {}", rule.metric_series.len());
    if let Some(stats) = snapshot.stats {
        println!("triggers:    {}", stats.trigger_count);
        println!("rate:        {:.4}", stats.trigger_rate);
        if let Some(precision) = stats.precision {
            println!("precision:   {precision:.3}");
        }
        if let Some(recall) = stats.recall {
            println!("recall:      {recall:.3}");
        }
    }
    for recommendation in rule.recommendations {
        println!("- {recommendation}");
    }
    Ok(())
}
