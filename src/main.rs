//! bastion-fleet 命令行入口

use anyhow::Context;
use bastion_fleet::{config::AppConfig, telemetry, CommandSpec, FleetRunner};
use clap::{Args, Parser, Subcommand};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "bastion-fleet", version, about = "Run a command on every host behind a bastion")]
struct Cli {
    /// 配置文件路径（默认读取 FLEET_CONFIG 或 fleet.toml）
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// 在所有目标主机上执行命令
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Shell 命令
    command: String,

    /// 远端工作目录
    #[arg(long)]
    workdir: Option<String>,

    /// 环境变量，格式 KEY=VALUE，可重复
    #[arg(long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// 只在指定角色上执行，逗号分隔
    #[arg(long, value_delimiter = ',')]
    only: Vec<String>,

    /// 单台主机的命令超时（秒）
    #[arg(long)]
    timeout: Option<u64>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    if let Ok(env) = std::env::var("FLEET_ENV") {
        dotenv::from_filename(format!(".env.{}", env)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::dotenv().ok();
    }

    let config_path = cli.config.or_else(|| std::env::var("FLEET_CONFIG").ok());
    let config = AppConfig::load(config_path.as_deref()).map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    telemetry::init_telemetry(&config);
    telemetry::init_metrics();

    let Commands::Run(args) = cli.command;

    let mut inventory = config.build_inventory().context("Failed to build inventory")?;
    if !args.only.is_empty() {
        inventory = inventory.retain_roles(&args.only)?;
    }

    let mut command = CommandSpec::new(args.command);
    if let Some(dir) = args.workdir {
        command = command.with_working_dir(dir);
    }
    for (key, value) in args.env {
        command = command.with_env(key, value);
    }

    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.ssh.command_timeout());

    let runner = FleetRunner::from_config(&config).context("Failed to initialize fleet runner")?;

    let shutdown = runner.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            shutdown.cancel();
        }
    });

    let report = match runner.execute(&inventory, &command, timeout).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "Fleet run failed");
            eprintln!("Error: {}", e);
            return Ok(ExitCode::from(e.exit_code() as u8));
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.all_succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}
