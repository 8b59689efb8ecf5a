//! A small end-to-end demonstration of the RPC runtime: accepts TCP
//! connections and registers one object exposing a couple of simple
//! methods plus a periodic signal.
//!
//! The accept loop itself lives here, not in the library -- `Service`
//! only wraps streams handed to it via [`Service::accept`].

use std::time::Duration;

use duplex_rpc::{ObjectBuilder, Service, ServiceConfig, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let service = Service::new(ServiceConfig::default());

    let handle = service
        .register_object(
            "obj",
            ObjectBuilder::new()
                .method2("method1", |a: i64, b: i64| Ok::<i64, String>(a + b))
                .method1("method2", |s: String| Ok::<String, String>(s.to_uppercase())),
        )
        .expect("object name is valid");

    {
        let handle = handle;
        tokio::spawn(async move {
            let mut ticks: i64 = 0;
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                ticks += 1;
                handle.emit_signal("tick", vec![Value::Int(ticks)]).await;
            }
        });
    }

    let listener = TcpListener::bind("127.0.0.1:7890").await?;
    info!(addr = %listener.local_addr()?, "echo_server: listening");

    loop {
        let (stream, addr) = listener.accept().await?;
        info!(%addr, "echo_server: accepted connection");
        if let Err(e) = stream.set_nodelay(true) {
            error!(error = %e, "echo_server: failed to set TCP_NODELAY");
        }
        service.accept(stream).await;
    }
}
