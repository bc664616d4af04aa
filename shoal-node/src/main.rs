// Shoal node: transport, resource sharing and downloads over the overlay.

mod config;
mod engine;
mod logging;
mod store;
mod transport;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use shoal_core::{Keypair, ResourceKey};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("shoal-node {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    logging::init(&cfg.log_level)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let keypair = Arc::new(load_or_create_identity(&cfg.data_dir.join("identity.key")).await?);
        tracing::info!(version = VERSION, peer_id = %keypair.peer_id(), "starting");

        let engine = engine::Engine::new(&cfg, keypair)?;
        engine.start().await?;
        tracing::info!(shared = engine.store().keys().len(), dir = %cfg.share_dir.display(), "sharing");

        let listener = tokio::spawn(engine.clone().listen(cfg.listen_port));
        for addr in &cfg.peers {
            engine.dial(addr.clone());
        }
        for key in &cfg.fetch {
            if let Err(e) = engine.fetch(ResourceKey::new(key.as_str())).await {
                tracing::warn!(resource = %key, error = %e, "cannot fetch");
            }
        }

        tokio::select! {
            res = listener => match res {
                Ok(Err(e)) => return Err(e),
                Ok(Ok(())) => {}
                Err(e) => return Err(e.into()),
            },
            res = shutdown_signal() => res?,
        }
        engine.shutdown().await;
        Ok(())
    })
}

/// Read the hex secret at `path`, or generate one and store it there.
async fn load_or_create_identity(path: &Path) -> anyhow::Result<Keypair> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let bytes = hex::decode(text.trim()).with_context(|| format!("decoding {}", path.display()))?;
            let secret: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("{} does not hold a 32-byte key", path.display()))?;
            Ok(Keypair::from_secret_bytes(secret))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            tokio::fs::write(path, hex::encode(keypair.secret_bytes()))
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
            }
            tracing::info!(path = %path.display(), "generated new identity");
            Ok(keypair)
        }
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    tracing::info!("shutdown requested");
    Ok(())
}
