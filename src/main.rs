use std::sync::Arc;

use anyhow::Context;
use switchyard::config::Config;
use switchyard::events::{Events, TracingSink};
use switchyard::http::connection::ServerContext;
use switchyard::http::request::Method;
use switchyard::http::response::{ResponseBuilder, StatusCode};
use switchyard::routing::{
    handler_fn, AuthRequirement, MethodKey, RouteOptions, RouteTree, TokenAuthenticator,
};
use switchyard::server::datagram::{Datagram, DatagramReceiver};
use switchyard::server::listener::Listener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::load()?;

    let routes = build_routes(&cfg)?;
    let ctx = ServerContext::new(Arc::new(routes), cfg.server_settings())
        .with_events(Events::default().with_sink(Arc::new(TracingSink)));

    let listener = Listener::bind(cfg.server.listen.as_slice(), ctx).await?;
    let handle = listener.handle();
    let server = tokio::spawn(listener.run());

    let mut receiver = match &cfg.datagram.bind {
        Some(bind) => Some(start_datagrams(&cfg, bind).await?),
        None => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    handle.stop();
    if let Some(receiver) = receiver.as_mut() {
        receiver.stop(true).await;
    }
    server.await??;

    Ok(())
}

fn build_routes(cfg: &Config) -> anyhow::Result<RouteTree> {
    let mut routes = RouteTree::new();
    if !cfg.auth.tokens.is_empty() {
        routes = routes.with_authenticator(Arc::new(TokenAuthenticator::new(
            cfg.auth.tokens.iter().cloned(),
        )));
    }

    routes.register(
        "*",
        Method::GET,
        "/health",
        "*/*",
        handler_fn(|_req, _params| async {
            Ok(ResponseBuilder::new(StatusCode::Ok)
                .header("Content-Type", "text/plain")
                .body("ok")
                .build())
        }),
        RouteOptions::new(),
    )?;

    let echo_auth = if cfg.auth.tokens.is_empty() {
        AuthRequirement::None
    } else {
        AuthRequirement::Required
    };
    routes.register(
        "*",
        MethodKey::Any,
        "/echo/*rest",
        "*/*",
        handler_fn(|req, _params| async move {
            let content_type = req
                .header("Content-Type")
                .unwrap_or("application/octet-stream")
                .to_string();
            Ok(ResponseBuilder::new(StatusCode::Ok)
                .header("Content-Type", content_type)
                .body(req.body)
                .build())
        }),
        RouteOptions::new().auth(echo_auth),
    )?;

    Ok(routes)
}

async fn start_datagrams(cfg: &Config, bind: &str) -> anyhow::Result<DatagramReceiver<String>> {
    let settings = cfg.datagram_settings();
    let (mut receiver, mut errors) =
        DatagramReceiver::new(|d: Datagram| Ok(String::from_utf8_lossy(&d.data).into_owned()));
    receiver = receiver.with_receive_timeout(settings.receive_timeout);
    receiver.subscribe(|msg: &String| {
        tracing::info!(len = msg.len(), message = %msg, "Datagram");
        Ok(())
    });

    tokio::spawn(async move {
        while let Some(e) = errors.recv().await {
            tracing::warn!(error = %e, "Datagram delivery failed");
        }
    });

    receiver
        .start(bind, settings.buffer_size)
        .await
        .with_context(|| format!("failed to start datagram receiver on {bind}"))?;
    Ok(receiver)
}
