//! CDR Notify CLI
//!
//! 不带子命令时处理一批文件后退出，由 cron / systemd timer 周期调用。

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

use cdr_notify::cli::{entries_table, format_output, summary_line};
use cdr_notify::config::{resolve_config_path, AppConfig};
use cdr_notify::notification::{build_alerter, Alerter, LogAlerter};
use cdr_notify::{open_ledger, Fingerprint, Ledger, RunController};

#[derive(Parser)]
#[command(name = "cdr-notify")]
#[command(about = "CDR Notify - 新话单文件到达时发送邮件和 Telegram 通知")]
#[command(version)]
struct Cli {
    /// 配置文件路径（默认 $CDR_NOTIFY_CONFIG 或 <config_dir>/cdr-notify/config.json）
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Dry-run 模式（只打印不发送，不写账本）
    #[arg(long)]
    dry_run: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// 列出账本条目
    Status {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 把条目重置为 pending，下次运行重新发送
    Reset {
        /// 指纹（完整或唯一前缀）
        fingerprint: String,
    },
    /// 校验配置并打印（隐藏密钥）
    CheckConfig,
}

fn main() -> Result<()> {
    // 通过 RUST_LOG 环境变量控制日志级别，默认为 info
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cdr_notify=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            // 配置不可用时没有渠道可用，只能写日志
            LogAlerter.alert("Configuration error", &e.to_string());
            return Err(e).with_context(|| {
                format!("failed to load configuration from {}", config_path.display())
            });
        }
    };

    match cli.command {
        None => run_batch(&config, cli.dry_run),
        Some(Commands::Status { json }) => {
            let ledger = open_configured_ledger(&config)?;
            let entries = ledger.entries()?;
            println!("{}", format_output(entries.as_slice(), json, entries_table));
            Ok(())
        }
        Some(Commands::Reset { fingerprint }) => {
            let ledger = open_configured_ledger(&config)?;
            let fingerprint = resolve_fingerprint(ledger.as_ref(), &fingerprint)?;
            match ledger.reset(&fingerprint)? {
                Some(entry) => {
                    println!(
                        "Reset {} ({}) to {}",
                        entry.fingerprint.short(),
                        entry.source_path,
                        entry.notification_status
                    );
                    Ok(())
                }
                None => bail!("no ledger entry for fingerprint {}", fingerprint),
            }
        }
        Some(Commands::CheckConfig) => {
            println!("Configuration OK: {}", config_path.display());
            println!("Enabled channels: {:?}", config.enabled_channels());
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            Ok(())
        }
    }
}

fn run_batch(config: &AppConfig, dry_run: bool) -> Result<()> {
    let alerter = build_alerter(config);

    let controller = match RunController::from_config(config, dry_run) {
        Ok(controller) => controller,
        Err(e) => {
            error!(error = %e, "Cannot start run");
            alerter.alert("Cannot start run", &e.to_string());
            return Err(e).context("failed to initialize run");
        }
    };

    match controller.run(Utc::now()) {
        Ok(summary) => {
            println!("{}", summary_line(&summary));
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Run aborted");
            alerter.alert("Run aborted", &e.to_string());
            Err(e).context("run aborted")
        }
    }
}

fn open_configured_ledger(config: &AppConfig) -> Result<Arc<dyn Ledger>> {
    let path = config.ledger_path();
    open_ledger(config.ledger_backend, &path, config.retry.max_attempts)
        .with_context(|| format!("failed to open ledger {}", path.display()))
}

/// 完整指纹直接使用，否则按唯一前缀匹配
fn resolve_fingerprint(ledger: &dyn Ledger, input: &str) -> Result<Fingerprint> {
    let input = input.trim().to_lowercase();
    if input.len() == 64 {
        return Ok(Fingerprint::from_hex(input));
    }
    if input.is_empty() {
        bail!("fingerprint must not be empty");
    }

    let matches: Vec<Fingerprint> = ledger
        .entries()?
        .into_iter()
        .map(|entry| entry.fingerprint)
        .filter(|fp| fp.as_str().starts_with(&input))
        .collect();

    match matches.as_slice() {
        [single] => Ok(single.clone()),
        [] => Err(anyhow!("no ledger entry matches {}", input)),
        _ => Err(anyhow!(
            "fingerprint prefix {} is ambiguous ({} matches)",
            input,
            matches.len()
        )),
    }
}
