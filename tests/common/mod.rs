//! Shared setup for the end-to-end tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use karabo::broker::{Broker, InprocBroker};
use karabo::client::DeviceClient;
use karabo::config::ServerConfig;
use karabo::device::DeviceClasses;
use karabo::server::DeviceServer;

pub const TOPIC: &str = "test";

/// Broker handle on the in-process hub `url`.
pub fn broker(url: &str) -> Arc<dyn Broker> {
    Arc::new(InprocBroker::new(url, TOPIC))
}

/// Started server `server_id` offering the bundled device classes.
pub async fn server(url: &str, server_id: &str) -> DeviceServer {
    let config = ServerConfig {
        server_id: Some(server_id.to_string()),
        instance_check_timeout_ms: 100,
        kill_grace_secs: 2,
        ..ServerConfig::default()
    };
    let classes = DeviceClasses::for_namespace("karabo.devices").unwrap();
    let server = DeviceServer::new(&config, classes, broker(url));
    server.start().await.unwrap();
    server
}

/// Client on the same hub.
pub async fn client(url: &str) -> DeviceClient {
    DeviceClient::connect(broker(url)).await.unwrap()
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
