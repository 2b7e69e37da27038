use crate::channel::{socket, ChannelEnd};
use crate::config::Config;
use crate::hub::{scheduler, Hub, StateStore};
use crate::integrations::{build_integrations, AgentLink, NoFields};
use crate::protocol::{IdSource, SequentialIdSource};
use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Duration;

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 60;

/// Build a Hub wired to every configured integration, with its state file
/// next to `config.toml`.
pub async fn build_hub(config: &Config) -> Result<Hub> {
    let ids: Arc<dyn IdSource> = Arc::new(SequentialIdSource::new());
    let agent = Arc::new(AgentLink::new(ids, config.hub.agent_call_timeout()));
    let integrations =
        build_integrations(&config.integrations, Arc::clone(&agent), Arc::new(NoFields));
    Hub::new(config, integrations, agent, StateStore::at(config.state_path())).await
}

pub async fn run(config: Config) -> Result<()> {
    let hub = build_hub(&config).await?;

    let reconnected = hub.reconnect_restored().await;
    if reconnected > 0 {
        tracing::info!(reconnected, "Restored sessions reconnected");
    }

    let mut handles: Vec<JoinHandle<()>> = scheduler::spawn(&hub);

    {
        let hub = hub.clone();
        let addr = config.hub.listen_addr.clone();
        handles.push(spawn_component_supervisor(
            "page_listener",
            INITIAL_BACKOFF_SECS,
            MAX_BACKOFF_SECS,
            move || {
                let hub = hub.clone();
                let addr = addr.clone();
                async move {
                    let listener = bind(&addr).await?;
                    serve_pages(hub, listener).await
                }
            },
        ));
    }

    {
        let hub = hub.clone();
        let addr = config.hub.agent_listen_addr.clone();
        handles.push(spawn_component_supervisor(
            "agent_listener",
            INITIAL_BACKOFF_SECS,
            MAX_BACKOFF_SECS,
            move || {
                let hub = hub.clone();
                let addr = addr.clone();
                async move {
                    let listener = bind(&addr).await?;
                    serve_agents(hub, listener).await
                }
            },
        ));
    }

    println!("Switchboard hub started");
    println!("   Pages:  {}", config.hub.listen_addr);
    println!("   Agent:  {}", config.hub.agent_listen_addr);
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    hub.shutdown();
    if let Err(e) = hub.persist().await {
        tracing::warn!("Final state write failed: {e:#}");
    }

    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}

/// Accept page connections until the listener fails.
pub async fn serve_pages(hub: Hub, listener: TcpListener) -> Result<()> {
    serve(listener, "page", move |end, peer| {
        hub.attach_page(end, format!("tcp://{peer}"));
    })
    .await
}

/// Accept Agent connections. A new Agent replaces the previous one.
pub async fn serve_agents(hub: Hub, listener: TcpListener) -> Result<()> {
    serve(listener, "agent", move |end, _peer| {
        hub.attach_agent(end);
    })
    .await
}

async fn serve<F>(listener: TcpListener, role: &'static str, attach: F) -> Result<()>
where
    F: Fn(ChannelEnd, SocketAddr),
{
    tracing::info!(role, addr = %listener.local_addr()?, "Listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::debug!(role, %peer, "Connection accepted");
        attach(socket::accept(format!("{role}:{peer}"), stream), peer);
    }
}

fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            match run_component().await {
                Ok(()) => {
                    tracing::warn!("Daemon component '{name}' exited unexpectedly");
                    backoff = initial_backoff_secs.max(1);
                }
                Err(e) => {
                    tracing::error!("Daemon component '{name}' failed: {e:#}");
                }
            }

            tokio::time::sleep(Duration::from_secs(backoff)).await;
            // Double after sleeping so the first failure waits the initial backoff.
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}
