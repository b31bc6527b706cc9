//! `nodebus` – broker daemon and diagnostics.
//!
//! ```text
//! nodebus [serve]   run the broker until Ctrl-C
//! nodebus init      write ~/.nodebus/config.toml with the current settings
//! nodebus probe     connect a throwaway node and report whether the broker answers
//! ```
//!
//! Settings come from `~/.nodebus/config.toml` (defaults when absent) with
//! `NODEBUS_*` environment overrides on top; see [`config`].

mod config;
mod telemetry;

use std::io::Write;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use colored::Colorize;
use nodebus_broker::BrokerServer;
use nodebus_middleware::{Node, NodeConfig, Registries};
use nodebus_types::BusError;
use tracing::{info, warn};

fn main() -> ExitCode {
    let _tracing = telemetry::init_tracing("nodebus");

    let command = std::env::args().nth(1);
    let command = command.as_deref().unwrap_or("serve");
    if matches!(command, "help" | "-h" | "--help") {
        print_usage();
        return ExitCode::SUCCESS;
    }

    print_banner();

    let cfg = match config::load_or_default() {
        Ok((cfg, true)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok((cfg, false)) => {
            println!("  {}", "No config file found, using defaults.".dimmed());
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    if command == "init" {
        return match config::save(&cfg) {
            Ok(()) => {
                println!(
                    "  {} Config saved to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                println!("{}: {}", "Error saving config".red(), e);
                ExitCode::FAILURE
            }
        };
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Failed to start runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = match command {
        "serve" => runtime.block_on(serve(&cfg)),
        "probe" => runtime.block_on(probe(&cfg)),
        other => {
            println!("{}: {}", "Unknown command".red(), other);
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

async fn serve(cfg: &config::Config) -> Result<(), BusError> {
    let server = BrokerServer::bind((cfg.host.as_str(), cfg.port), cfg.broker_config()).await?;
    let addr = server.local_addr()?;
    println!(
        "\n  Broker listening on {}  {}\n",
        format!("ws://{addr}{}", nodebus_types::NODES_PATH).bold().cyan(),
        "(Ctrl-C to stop)".dimmed()
    );

    tokio::select! {
        result = server.run() => result,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for Ctrl-C");
            }
            println!();
            println!("{}", "  Ctrl-C received, stopping broker.".yellow().bold());
            info!("broker stopped");
            Ok(())
        }
    }
}

async fn probe(cfg: &config::Config) -> Result<(), BusError> {
    let link = cfg.link_config();
    let url = link.url();
    let wait = link.handshake_timeout + Duration::from_secs(1);
    let node = Node::new(NodeConfig::new("nodebus_probe").with_link(link), Registries::new());

    print!("\n  Probing broker at {} … ", url.dimmed());
    std::io::stdout().flush().ok();
    let started = Instant::now();
    node.start();
    let online = node.link().wait_connected(wait).await;
    let elapsed = started.elapsed();
    node.shutdown().await;

    if online {
        println!("{} ({} ms)", "online".green(), elapsed.as_millis());
        Ok(())
    } else {
        println!("{}", "offline".yellow());
        println!(
            "  {}  Run `{}` to start one.",
            "No broker answered.".dimmed(),
            "nodebus serve".bold()
        );
        Err(BusError::ConnectionLost(format!("no broker at {url}")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"                 __     __              "#.bold().cyan());
    println!("{}", r#"   ____  ____  ____/ /__  / /_  __  _______"#.bold().cyan());
    println!("{}", r#"  / __ \/ __ \/ __  / _ \/ __ \/ / / / ___/"#.bold().cyan());
    println!("{}", r#" / / / / /_/ / /_/ /  __/ /_/ / /_/ (__  ) "#.bold().cyan());
    println!("{}", r#"/_/ /_/\____/\__,_/\___/_.___/\__,_/____/  "#.bold().cyan());
    println!();
    println!("  {}", "Pub/sub and service messaging for robot nodes".dimmed());
    println!();
}

fn print_usage() {
    println!("Usage: nodebus [serve | init | probe | help]");
    println!();
    println!("  serve   Run the broker until Ctrl-C (default)");
    println!("  init    Write the effective settings to {}", config::config_path().display());
    println!("  probe   Check whether a broker is reachable");
}
