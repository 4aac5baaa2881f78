mod console;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use radon_backend::{Connector, Scatter, XaAction, XaRecovery};
use radon_common::config::RadonConfig;
use radon_proxy::{LocalSession, Proxy, Session};
use radon_router::MetaRouter;

#[derive(Parser, Debug)]
#[command(name = "radon", about = "Radon: MySQL-compatible distributed SQL proxy")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "radon.toml")]
    config: String,

    /// Directory holding backend.json (overrides config).
    #[arg(long)]
    meta_dir: Option<String>,

    /// Prometheus listen address (overrides config).
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Refuse writes and DDL.
    #[arg(long)]
    read_only: bool,

    /// Resolve stale XA branches every N seconds; 0 disables the sweeper.
    #[arg(long, default_value = "0")]
    xa_sweep_secs: u64,

    /// What the sweeper does with stale branches: commit or rollback.
    #[arg(long, value_parser = parse_xa_action, default_value = "rollback")]
    xa_sweep_action: XaAction,

    /// Initial schema of the console session.
    #[arg(short = 'D', long)]
    database: Option<String>,

    /// Run these `;`-separated statements and exit instead of starting the console.
    #[arg(short, long)]
    execute: Option<String>,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

fn parse_xa_action(s: &str) -> Result<XaAction, String> {
    match s.to_ascii_lowercase().as_str() {
        "commit" => Ok(XaAction::Commit),
        "rollback" => Ok(XaAction::Rollback),
        other => Err(format!("unknown xa action '{other}', expected commit or rollback")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        let text = toml::to_string_pretty(&RadonConfig::default())
            .unwrap_or_else(|e| format!("# failed to serialize default config: {e}"));
        println!("{text}");
        return Ok(());
    }

    let mut config = RadonConfig::load_or_default(Path::new(&cli.config));
    radon_observability::init_tracing(&config.log.level);
    tracing::info!(config = %cli.config, "starting radon");

    if let Some(dir) = &cli.meta_dir {
        config.proxy.meta_dir = dir.clone();
    }
    if let Some(addr) = &cli.metrics_addr {
        config.proxy.metrics_addr = addr.clone();
    }
    if cli.read_only {
        config.proxy.read_only = true;
    }
    tracing::debug!(?config, "effective config");

    if !config.proxy.metrics_addr.is_empty() {
        if let Err(e) = radon_observability::init_metrics(&config.proxy.metrics_addr) {
            tracing::warn!(error = %e, "failed to initialize metrics");
        }
    }

    std::fs::create_dir_all(&config.proxy.meta_dir)
        .with_context(|| format!("creating meta dir {}", config.proxy.meta_dir))?;
    let scatter = Scatter::new(connector(), &config.proxy.meta_dir);
    scatter.load_config().context("loading backend.json")?;
    tracing::info!(backends = ?scatter.backends(), "backends loaded");

    let router = Arc::new(MetaRouter::new(config.router.clone()));
    let proxy = Proxy::new(config.proxy.clone(), router, Arc::clone(&scatter));
    proxy.start();

    let sweeper = (cli.xa_sweep_secs > 0).then(|| {
        XaRecovery::new(Arc::clone(&scatter), config.proxy.xa_recover_horizon_secs)
            .start(cli.xa_sweep_action, Duration::from_secs(cli.xa_sweep_secs))
    });

    let session = Arc::new(LocalSession::new("root", "console"));
    let outcome = proxy
        .session_open(session.clone())
        .map_err(anyhow::Error::from)
        .and_then(|()| {
            if let Some(db) = &cli.database {
                proxy.spanner().com_init_db(&*session, db)?;
            }
            match &cli.execute {
                Some(sql) => console::run_batch(&proxy, &*session, sql),
                None => console::run(&proxy, &*session),
            }
        });

    proxy.session_close(session.id());
    if let Some(handle) = sweeper {
        handle.stop();
    }
    proxy.stop();
    tracing::info!("radon stopped");
    outcome
}

#[cfg(feature = "mysql")]
fn connector() -> Arc<dyn Connector> {
    Arc::new(radon_backend::mysql_conn::MysqlConnector)
}

#[cfg(not(feature = "mysql"))]
fn connector() -> Arc<dyn Connector> {
    tracing::warn!("built without the mysql feature, backends are in-memory fakes");
    Arc::new(radon_backend::fakedb::FakeDb::new())
}
