use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::Instant,
};

use crate::broker::{Broker, error::BrokerResult};
use crate::rpc::protocol::{ErrorBody, Request, Response};

/// Client side of the broker protocol, used by the CLI and by emulator
/// binaries reporting in over `TESTENV_BROKER_ADDRESS`.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    address: String,
}

impl BrokerClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub async fn send(&self, request: Request) -> Result<Response> {
        let stream = TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("failed to connect to broker at {}", self.address))?;
        send_request_over_stream(stream, request).await
    }
}

async fn send_request_over_stream(stream: TcpStream, request: Request) -> Result<Response> {
    let payload = serde_json::to_vec(&request)
        .map_err(|err| anyhow!("failed to serialize broker request: {err}"))?;
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(&payload).await?;
    write_half.write_all(b"\n").await?;
    write_half.shutdown().await?;

    let mut reader = BufReader::new(read_half);
    let mut response_line = String::new();
    let bytes = reader.read_line(&mut response_line).await?;
    if bytes == 0 {
        bail!("broker closed connection without a response");
    }
    let response: Response = serde_json::from_str(response_line.trim())
        .map_err(|err| anyhow!("failed to parse broker response: {err}"))?;
    Ok(response)
}

/// Accept-and-dispatch loop for the broker's RPC endpoint. Runs until the
/// listener fails; shutdown is driven by the caller dropping the future.
pub async fn serve(broker: Arc<Broker>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("accepting broker connection")?;
        let broker = broker.clone();
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, broker).await {
                tracing::error!(%error, "error handling broker connection");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, broker: Arc<Broker>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(());
    }

    let response = match serde_json::from_str::<Request>(line.trim()) {
        Ok(request) => dispatch(&broker, request).await,
        Err(err) => Response::Error(ErrorBody {
            code: "INVALID_ARGUMENT".to_string(),
            message: format!("failed to parse request: {err}"),
        }),
    };

    let payload = serde_json::to_vec(&response)
        .map_err(|err| anyhow!("failed to serialize response: {err}"))?;
    write_half.write_all(&payload).await?;
    write_half.write_all(b"\n").await?;
    write_half.shutdown().await?;
    Ok(())
}

/// Thin adaptors: every operation delegates straight to the registry.
async fn dispatch(broker: &Arc<Broker>, request: Request) -> Response {
    match request {
        Request::CreateEmulator(spec) => empty(broker.create_emulator(spec)),
        Request::GetEmulator(req) => reply(broker.get_emulator(&req.emulator_id), Response::Emulator),
        Request::ListEmulators => Response::Emulators(broker.list_emulators()),
        Request::DeleteEmulator(req) => empty(broker.delete_emulator(&req.emulator_id).await),
        Request::StartEmulator(req) => empty(
            broker
                .start_emulator(&req.emulator_id, caller_deadline(req.timeout_ms))
                .await,
        ),
        Request::ReportEmulatorOnline(req) => empty(broker.report_emulator_online(
            &req.emulator_id,
            req.resolved_host,
            req.target_patterns,
        )),
        Request::StopEmulator(req) => empty(broker.stop_emulator(&req.emulator_id).await),
        Request::CreateResolveRule(spec) => empty(broker.create_resolve_rule(spec)),
        Request::GetResolveRule(req) => reply(broker.get_resolve_rule(&req.rule_id), Response::Rule),
        Request::UpdateResolveRule(spec) => reply(broker.update_resolve_rule(spec), Response::Rule),
        Request::ListResolveRules => Response::Rules(broker.list_resolve_rules()),
        Request::Resolve(req) => reply(
            broker
                .resolve(&req.target, caller_deadline(req.timeout_ms))
                .await,
            Response::Resolved,
        ),
        Request::CreateProxy(req) => reply(
            broker.create_proxy(&req.emulator_id, req.port).await,
            Response::Proxy,
        ),
        Request::GetProxy(req) => reply(broker.get_proxy(&req.emulator_id), Response::Proxy),
        Request::ListProxies => Response::Proxies(broker.list_proxies()),
    }
}

fn caller_deadline(timeout_ms: Option<u64>) -> Option<Instant> {
    timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms))
}

fn empty(result: BrokerResult<()>) -> Response {
    match result {
        Ok(()) => Response::Empty,
        Err(error) => Response::Error(ErrorBody::from(&error)),
    }
}

fn reply<T>(result: BrokerResult<T>, wrap: fn(T) -> Response) -> Response {
    match result {
        Ok(value) => wrap(value),
        Err(error) => Response::Error(ErrorBody::from(&error)),
    }
}
