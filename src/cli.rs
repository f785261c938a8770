use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;

use crate::broker::{BROKER_ADDRESS_ENV, Broker, BrokerOptions};
use crate::config::{self, Config};
use crate::rpc::{
    self, BrokerClient,
    protocol::{
        CreateProxyRequest, EmulatorIdRequest, Request, ReportEmulatorOnlineRequest,
        ResolveRequest, Response, RuleIdRequest, StartEmulatorRequest,
    },
};

#[derive(Parser, Debug)]
#[command(name = "emubroker", version, about = "Broker for locally-run service emulators")]
pub struct Cli {
    /// Broker address for client commands; defaults to $TESTENV_BROKER_ADDRESS
    #[arg(long, global = true, value_name = "ADDR")]
    pub broker: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let address = resolve_broker_address(self.broker);
        match self.command {
            Command::Serve(args) => serve(args).await,
            command => run_client(BrokerClient::new(address), command).await,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the broker daemon
    Serve(ServeArgs),
    /// List registered emulators
    List,
    /// Show one emulator, including its rule and expanded command
    Get(EmulatorIdArgs),
    /// Start an emulator and wait for it to come online
    Start(StartArgs),
    /// Stop an emulator
    Stop(EmulatorIdArgs),
    /// Remove an emulator, stopping it first if needed
    Delete(EmulatorIdArgs),
    /// Resolve a target (host, host:port, URL, or /Service/Method)
    Resolve(ResolveArgs),
    /// Report an emulator as online; used by emulator binaries
    ReportOnline(ReportOnlineArgs),
    /// List resolve rules
    Rules,
    /// Show one resolve rule
    GetRule(RuleIdArgs),
    /// Create a TCP proxy in front of an emulator
    CreateProxy(CreateProxyArgs),
    /// List proxies
    Proxies,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Configuration file (TOML); defaults apply when omitted
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct EmulatorIdArgs {
    pub emulator_id: String,
}

#[derive(Args, Debug)]
pub struct RuleIdArgs {
    pub rule_id: String,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    pub emulator_id: String,

    /// Give up after this many seconds even if the broker default is longer
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    pub target: String,

    /// Bound any on-demand start triggered by this resolve
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ReportOnlineArgs {
    pub emulator_id: String,

    /// host or host:port the emulator is listening on
    #[arg(long, value_name = "HOST")]
    pub resolved_host: String,

    /// Extra target patterns to merge into the emulator's rule
    #[arg(long = "pattern", value_name = "REGEX")]
    pub patterns: Vec<String>,
}

#[derive(Args, Debug)]
pub struct CreateProxyArgs {
    pub emulator_id: String,

    /// Listening port; 0 lets the broker pick one
    #[arg(long, default_value_t = 0)]
    pub port: u16,
}

fn resolve_broker_address(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var(BROKER_ADDRESS_ENV).ok())
        .unwrap_or_else(|| Config::default().listen_address)
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = match args.config {
        Some(path) => config::load_from_path(&path)
            .with_context(|| format!("loading configuration from {:?}", path))?,
        None => Config::default(),
    };

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("binding broker endpoint at {}", config.listen_address))?;
    let local_address = listener.local_addr().context("reading bound address")?;

    let broker = Arc::new(
        Broker::new(BrokerOptions {
            broker_address: local_address.to_string(),
            port_ranges: config.port_ranges,
            default_start_deadline: config.default_emulator_start_deadline,
        })
        .context("initializing broker")?,
    );

    // Pre-declared rules and emulators replay through the same operations
    // the RPC surface uses.
    for rule in config.rules {
        let rule_id = rule.rule_id.clone();
        broker
            .create_resolve_rule(rule)
            .with_context(|| format!("registering configured rule {rule_id:?}"))?;
    }
    for emulator in config.emulators {
        let emulator_id = emulator.emulator_id.clone();
        broker
            .create_emulator(emulator)
            .with_context(|| format!("registering configured emulator {emulator_id:?}"))?;
    }

    tracing::info!(address = %local_address, "broker listening");

    tokio::select! {
        result = rpc::serve(broker.clone(), listener) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; shutting down");
            broker.shutdown().await;
            Ok(())
        }
    }
}

async fn run_client(client: BrokerClient, command: Command) -> Result<()> {
    let request = match command {
        Command::Serve(_) => unreachable!("serve is handled before client dispatch"),
        Command::List => Request::ListEmulators,
        Command::Get(args) => Request::GetEmulator(EmulatorIdRequest {
            emulator_id: args.emulator_id,
        }),
        Command::Start(args) => Request::StartEmulator(StartEmulatorRequest {
            emulator_id: args.emulator_id,
            timeout_ms: args.timeout.map(|seconds| seconds * 1000),
        }),
        Command::Stop(args) => Request::StopEmulator(EmulatorIdRequest {
            emulator_id: args.emulator_id,
        }),
        Command::Delete(args) => Request::DeleteEmulator(EmulatorIdRequest {
            emulator_id: args.emulator_id,
        }),
        Command::Resolve(args) => Request::Resolve(ResolveRequest {
            target: args.target,
            timeout_ms: args.timeout.map(|seconds| seconds * 1000),
        }),
        Command::ReportOnline(args) => Request::ReportEmulatorOnline(ReportEmulatorOnlineRequest {
            emulator_id: args.emulator_id,
            resolved_host: args.resolved_host,
            target_patterns: args.patterns,
        }),
        Command::Rules => Request::ListResolveRules,
        Command::GetRule(args) => Request::GetResolveRule(RuleIdRequest {
            rule_id: args.rule_id,
        }),
        Command::CreateProxy(args) => Request::CreateProxy(CreateProxyRequest {
            emulator_id: args.emulator_id,
            port: args.port,
        }),
        Command::Proxies => Request::ListProxies,
    };

    match client.send(request).await? {
        Response::Error(body) => bail!("{}: {}", body.code, body.message),
        Response::Empty => {
            println!("ok");
            Ok(())
        }
        Response::Emulator(view) => print_json(&view),
        Response::Emulators(views) => print_json(&views),
        Response::Rule(rule) => print_json(&rule),
        Response::Rules(rules) => print_json(&rules),
        Response::Resolved(outcome) => print_json(&outcome),
        Response::Proxy(proxy) => print_json(&proxy),
        Response::Proxies(proxies) => print_json(&proxies),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
