use anyhow::Result;
use greetnet::greet::{GreetServiceServer, Greeter};
use greetnet::{tls, RpcConfig};
use std::env;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::thread;
use tokio::runtime::Builder;
use tracing::info;

/// Worker thread count override; defaults to the available parallelism.
const THREADS_ENV: &str = "GREET_SERVER_THREADS";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("greetnet=info".parse()?),
        )
        .init();

    let threads = worker_threads(env::var(THREADS_ENV).ok().as_deref());
    let rt = Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name("greet-server-worker")
        .enable_all()
        .build()?;
    info!("starting greet server with {} worker threads", threads);

    rt.block_on(serve())
}

async fn serve() -> Result<()> {
    let addr = env::var("GREET_ADDR").unwrap_or_else(|_| "127.0.0.1:50051".to_string());
    let cert_dir = PathBuf::from(env::var("GREET_CERT_DIR").unwrap_or_else(|_| "certs".to_string()));
    let server_name = env::var("GREET_SERVER_NAME").unwrap_or_else(|_| "localhost".to_string());

    let certs = tls::ensure_certificates(&cert_dir, &server_name)?;
    let config = RpcConfig::new(&certs.cert_path, addr)
        .with_key_path(&certs.key_path)
        .with_server_name(server_name);

    let server = GreetServiceServer::new(Greeter::new(), config);
    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}

fn worker_threads(configured: Option<&str>) -> usize {
    configured
        .and_then(|raw| raw.trim().parse::<NonZeroUsize>().ok())
        .or_else(|| thread::available_parallelism().ok())
        .map_or(1, NonZeroUsize::get)
}
