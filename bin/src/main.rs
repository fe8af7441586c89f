#![allow(clippy::cognitive_complexity)]
use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow};
use config::{
    DiscoveryConfig,
    cli::{self, Command, Parser},
    trace,
};
use coordination::{
    AddressSet, MemoryStore, Registrar, ServiceKey, StoreClient, close_default, init_default,
    install_default, service_prefix,
};
use external_api::{ExternalApi, Health};
use tokio::{runtime::Builder, signal};
use tokio_util::sync::CancellationToken;
use tracing::*;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // load .env before clap reads the environment
    let dotenv = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    let discovery_cfg = DiscoveryConfig::from_cli(&config)?;
    let trace_config = trace::Config::parse(discovery_cfg.log_level())?;
    debug!(?config, ?discovery_cfg, ?trace_config);
    if let Err(err) = dotenv {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config, discovery_cfg).await }).await {
            Err(err) => {
                error!(?err, "failed to start svcd");
                Err(anyhow!(err))
            }
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                Err(err)
            }
            Ok(Ok(())) => {
                debug!("exiting...");
                Ok(())
            }
        }
    })
}

async fn start(config: cli::Config, discovery_cfg: DiscoveryConfig) -> Result<()> {
    let client = connect(config.memory, discovery_cfg).await?;
    let token = CancellationToken::new();

    let result = match config.command {
        Command::Serve {
            service,
            instance,
            addr,
        } => {
            let instance = instance.unwrap_or_else(|| config::generate_instance_id(&service));
            info!(%service, %instance, "using instance id");
            let signal = tokio::spawn(shutdown_signal(token.clone()));
            let res = serve(
                client,
                config.external_api,
                &service,
                &instance,
                &addr,
                token.clone(),
            )
            .await;
            signal.abort();
            res
        }
        Command::Resolve { service } => {
            let signal = tokio::spawn(shutdown_signal(token.clone()));
            let res = resolve(client, &service, token.clone(), |addresses| {
                println!("{service}: {addresses}")
            })
            .await;
            signal.abort();
            res
        }
        Command::List { service } => list(&client, &service).await.map(|instances| {
            for (instance, address) in instances {
                println!("{instance}\t{address}");
            }
        }),
        Command::Deregister { service, instance } => Registrar::new(client)
            .deregister(&service, &instance)
            .await
            .map(|()| println!("deregistered {service}/{instance}"))
            .map_err(anyhow::Error::from),
    };

    if let Err(err) = close_default().await {
        warn!(?err, "failed to close coordination client");
    }
    result
}

/// Set up the process-wide client, in memory or against etcd.
async fn connect(memory: bool, cfg: DiscoveryConfig) -> Result<StoreClient> {
    if memory {
        info!("using in-process memory store, nothing is shared with other processes");
        return Ok(install_default(StoreClient::from_store(MemoryStore::new(), cfg)).await);
    }
    info!(endpoints = ?cfg.endpoints(), "connecting to coordination store");
    init_default(cfg)
        .await
        .context("failed to connect to coordination store")
}

/// Register an instance and keep it registered until `token` is cancelled.
/// Returns an error if the registration is lost while serving.
async fn serve(
    client: StoreClient,
    external_api: SocketAddr,
    service: &str,
    instance: &str,
    addr: &str,
    token: CancellationToken,
) -> Result<()> {
    // start external api for healthchecks
    let api = ExternalApi::new(external_api, client.clone());
    let api_sender = api.sender();
    let _api_guard = api.serve();

    let registrar = Registrar::new(client.clone());
    let record = registrar
        .register_default_ttl(service, instance, addr)
        .await
        .context("failed to register service")?;
    info!(key = %record.key, address = %record.address, lease = %record.lease, "serving");

    debug!("changing health to good after registration");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    let cfg = client.config();
    let mut ticker = tokio::time::interval(cfg.keepalive_interval(cfg.lease_ttl()));
    let result = loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("shutting down");
                break Ok(());
            }
            _ = ticker.tick() => {
                if !registrar.is_registered(service, instance) {
                    error!(key = %record.key, "registration lost");
                    break Err(anyhow!("registration for {} was lost", record.key));
                }
            }
        }
    };

    debug!("changing health to bad before deregistering");
    if let Err(err) = api_sender.send(Health::Bad).await {
        warn!(?err, "failed to report bad health");
    }
    registrar.shutdown().await;
    result
}

/// Hand every address set pushed for `service` to `on_update` until `token`
/// is cancelled.
async fn resolve<F>(
    client: StoreClient,
    service: &str,
    token: CancellationToken,
    mut on_update: F,
) -> Result<()>
where
    F: FnMut(&AddressSet),
{
    let (mut updates, resolver) = coordination::resolve(client, service)?;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            update = updates.next() => match update {
                Some(addresses) => on_update(&addresses),
                None => break,
            },
        }
    }
    resolver.close().await;
    Ok(())
}

/// One-shot read of the instances registered for `service`.
async fn list(client: &StoreClient, service: &str) -> Result<Vec<(String, String)>> {
    let snapshot = client.store().get_prefix(&service_prefix(service)?).await?;
    Ok(snapshot
        .entries
        .into_iter()
        .filter_map(|kv| {
            let key = ServiceKey::parse(&kv.key)?;
            let address = String::from_utf8(kv.value).ok()?;
            Some((key.instance().to_owned(), address))
        })
        .collect())
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coordination::CoordinationStore;
    use tracing_test::traced_test;

    use super::*;

    fn client(store: &MemoryStore, ttl: Duration) -> StoreClient {
        StoreClient::from_store(
            store.clone(),
            DiscoveryConfig::default().with_lease_ttl(ttl),
        )
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_serve_until_cancelled() {
        let store = MemoryStore::new();
        let token = CancellationToken::new();
        let task = tokio::spawn({
            let client = client(&store, Duration::from_secs(5));
            let token = token.clone();
            async move {
                serve(
                    client,
                    "127.0.0.1:0".parse().unwrap(),
                    "greeter",
                    "instance-9001",
                    "localhost:9001",
                    token,
                )
                .await
            }
        });

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(
            store.value("/services/greeter/instance-9001").as_deref(),
            Some("localhost:9001")
        );

        token.cancel();
        task.await.unwrap().unwrap();
        assert!(store.keys("/services/greeter/").is_empty());
        assert!(logs_contain("changing health to bad"));
        assert!(!logs_contain("failed to report bad health"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_fails_when_registration_lost() {
        let store = MemoryStore::new();
        let task = tokio::spawn({
            let client = client(&store, Duration::from_secs(2));
            async move {
                serve(
                    client,
                    "127.0.0.1:0".parse().unwrap(),
                    "greeter",
                    "i1",
                    "localhost:9001",
                    CancellationToken::new(),
                )
                .await
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        store.set_unavailable(true);

        let res = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert!(res.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_prints_updates() {
        let store = MemoryStore::new();
        store
            .put("/services/greeter/i1", "localhost:9001", None)
            .await
            .unwrap();
        let token = CancellationToken::new();
        let mut seen = Vec::new();
        let cancel = token.clone();
        resolve(
            client(&store, Duration::from_secs(5)),
            "greeter",
            token,
            |addresses| {
                seen.push(addresses.to_string());
                cancel.cancel();
            },
        )
        .await
        .unwrap();
        assert_eq!(seen, ["{localhost:9001}"]);
    }

    #[tokio::test]
    async fn test_list() {
        let store = MemoryStore::new();
        store
            .put("/services/greeter/i2", "localhost:9002", None)
            .await
            .unwrap();
        store
            .put("/services/greeter/i1", "localhost:9001", None)
            .await
            .unwrap();
        store
            .put("/services/other/i1", "localhost:9999", None)
            .await
            .unwrap();
        let instances = list(&client(&store, Duration::from_secs(5)), "greeter")
            .await
            .unwrap();
        assert_eq!(
            instances,
            [
                ("i1".to_owned(), "localhost:9001".to_owned()),
                ("i2".to_owned(), "localhost:9002".to_owned())
            ]
        );
        assert!(
            list(&client(&store, Duration::from_secs(5)), "bad/name")
                .await
                .is_err()
        );
    }
}
