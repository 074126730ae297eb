//! rpcwire demo server
//!
//! Answers `ping` with `"pong"` and `echo` with its params, over stdio or
//! HTTP. Logs go to stderr so stdout stays clean for the stdio protocol.
//!
//! ```text
//! rpcwire-demo stdio --framing content-length
//! rpcwire-demo http --bind 127.0.0.1:8080 --path /rpc
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use rpcwire_transport::{
    HttpTransport, LoggingConfig, Message, MessageHandler, StdioTransport, Transport,
    TransportConfig, TransportError, TransportResult, error_codes, keys,
};
use serde_json::json;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "rpcwire-demo", version, about = "Ping/echo JSON-RPC server")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info", env = "RPCWIRE_LOG")]
    log_level: String,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve on stdin/stdout
    Stdio {
        /// Wire framing
        #[arg(long, value_enum, default_value = "line")]
        framing: Framing,
    },
    /// Serve JSON-RPC POSTs
    Http {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Route the endpoint is mounted on
        #[arg(long, default_value = "/rpc")]
        path: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Framing {
    Line,
    ContentLength,
}

impl Framing {
    const fn as_config(self) -> &'static str {
        match self {
            Self::Line => "line",
            Self::ContentLength => "content-length",
        }
    }
}

/// `ping` and `echo`; everything else is `Method not found`.
struct DemoHandler;

#[async_trait]
impl MessageHandler for DemoHandler {
    async fn handle(
        &self,
        message: Message,
        _transport: &dyn Transport,
    ) -> TransportResult<Option<Message>> {
        let method = message.method.clone().unwrap_or_default();
        debug!(%method, kind = message.kind(), "handling message");

        let Some(id) = message.id else {
            return Ok(None);
        };
        let reply = match method.as_str() {
            "ping" => Message::response(json!("pong"), id),
            "echo" => Message::response(message.params.unwrap_or(json!(null)), id),
            _ => Message::error_response(
                error_codes::METHOD_NOT_FOUND,
                "Method not found",
                Some(json!({ "method": method })),
                id,
            ),
        };
        Ok(Some(reply))
    }

    async fn handle_error(&self, error: &TransportError, transport: &dyn Transport) {
        tracing::warn!(transport = %transport.transport_type(), %error, "request failed");
    }
}

async fn serve_stdio(framing: Framing) -> anyhow::Result<i32> {
    let transport = StdioTransport::stdio();
    transport
        .initialize(TransportConfig::new().with(keys::FRAMING, framing.as_config()))
        .context("invalid stdio configuration")?;
    transport.set_message_handler(Arc::new(DemoHandler));

    info!(framing = framing.as_config(), "serving on stdio");
    Ok(transport.run_as_command().await)
}

async fn serve_http(bind: SocketAddr, path: String) -> anyhow::Result<i32> {
    let config = TransportConfig::new()
        .with(keys::HOST, bind.ip().to_string())
        .with(keys::PORT, bind.port())
        .with(keys::PATH, path.clone());

    let transport = Arc::new(HttpTransport::http());
    transport
        .initialize(config)
        .context("invalid http configuration")?;
    transport.set_message_handler(Arc::new(DemoHandler));
    transport.start().await?;

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(url = %transport.base_url(), "serving on http");

    let app = transport.clone().router(&path);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await
        .context("http server failed")?;

    transport.stop().await?;
    Ok(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logging = LoggingConfig {
        structured: cli.json_logs,
        ..LoggingConfig::stderr(cli.log_level.clone())
    };
    let _guard = logging.init().context("failed to initialize logging")?;

    let code = match cli.command {
        Command::Stdio { framing } => serve_stdio(framing).await?,
        Command::Http { bind, path } => serve_http(bind, path).await?,
    };
    std::process::exit(code);
}
