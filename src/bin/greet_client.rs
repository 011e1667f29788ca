use anyhow::Result;
use greetnet::greet::{DemoPlan, GreetServiceClient};
use greetnet::tls::CertificateSet;
use greetnet::RpcConfig;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("greetnet=info".parse()?),
        )
        .init();

    let addr: SocketAddr = env::var("GREET_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:50051".to_string())
        .parse()?;
    let cert_dir = PathBuf::from(env::var("GREET_CERT_DIR").unwrap_or_else(|_| "certs".to_string()));
    let server_name = env::var("GREET_SERVER_NAME").unwrap_or_else(|_| "localhost".to_string());

    let certs = CertificateSet::in_dir(&cert_dir);
    let config = RpcConfig::new(&certs.ca_cert_path, "0.0.0.0:0").with_server_name(server_name);

    info!("connecting to greet server at {}", addr);
    let client = GreetServiceClient::connect(addr, config).await?;
    let report = DemoPlan::default().run(&client).await?;
    info!("walkthrough finished: {:?}", report);
    Ok(())
}
