//! A server hosting devices, driven through a client.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use karabo::config::ServerConfig;
use karabo::device::{Device, DeviceClasses, DeviceFactory, DeviceHooks};
use karabo::server::DeviceServer;
use karabo::{KaraboError, KaraboResult};
use karabo_core::{hash, CoreResult, Hash, Schema};

use common::{client, eventually, server};

#[tokio::test]
async fn start_device_and_read_property() {
    let url = "inproc://start-and-read";
    let server = server(url, "S1").await;
    let client = client(url).await;

    let id = client
        .instantiate("S1", "PropertyTest", "d1", hash! { "int32Property" => 10i32 })
        .await
        .unwrap();
    assert_eq!(id, "d1");

    let config = client.get_configuration("d1").await.unwrap();
    assert_eq!(config.get::<i32>("int32Property").unwrap(), 10);
    assert_eq!(config.get::<String>("state").unwrap(), "NORMAL");
    assert_eq!(config.get::<String>("serverId").unwrap(), "S1");
    assert_eq!(config.get::<String>("classId").unwrap(), "PropertyTest");

    server.shutdown().await;
}

#[tokio::test]
async fn invalid_configuration_is_rejected() {
    let url = "inproc://reject-invalid";
    let server = server(url, "S1").await;
    let client = client(url).await;

    let err = client
        .instantiate("S1", "PropertyTest", "d2", hash! { "int32Property_y" => 42i32 })
        .await
        .unwrap_err();
    match err {
        KaraboError::Remote { message, .. } => assert_eq!(
            message,
            "Encountered unexpected configuration parameter: \"int32Property_y\""
        ),
        other => panic!("unexpected error {other}"),
    }
    assert!(server.devices().is_empty());
    assert!(server.device("d2").is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn duplicate_device_id_is_rejected() {
    let url = "inproc://duplicate-id";
    let server = server(url, "S1").await;
    let client = client(url).await;

    client
        .instantiate("S1", "PropertyTest", "d1", Hash::new())
        .await
        .unwrap();
    let err = client
        .instantiate("S1", "PropertyTest", "d1", Hash::new())
        .await
        .unwrap_err();
    match err {
        KaraboError::Remote { message, .. } => assert_eq!(message, "d1 already instantiated and alive"),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(server.devices(), vec!["d1"]);

    server.shutdown().await;
}

#[tokio::test]
async fn device_id_taken_on_another_server_is_rejected() {
    let url = "inproc://duplicate-across-servers";
    let s1 = server(url, "S1").await;
    let s2 = server(url, "S2").await;
    let client = client(url).await;

    client.instantiate("S1", "PropertyTest", "shared", Hash::new()).await.unwrap();
    let err = client
        .instantiate("S2", "PropertyTest", "shared", Hash::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already instantiated and alive"), "{err}");
    assert!(s2.devices().is_empty());

    s2.shutdown().await;
    s1.shutdown().await;
}

#[tokio::test]
async fn reconfigure_and_execute_through_client() {
    let url = "inproc://client-control";
    let server = server(url, "S1").await;
    let client = client(url).await;
    client.instantiate("S1", "PropertyTest", "d1", Hash::new()).await.unwrap();

    client.set("d1", "int32Property", 7i32).await.unwrap();
    assert_eq!(client.get::<i32>("d1", "int32Property").await.unwrap(), 7);
    assert_eq!(client.get::<i32>("d1", "int32PropertyReadOnly").await.unwrap(), 7);

    let err = client.set("d1", "int32PropertyReadOnly", 1i32).await.unwrap_err();
    assert!(matches!(err, KaraboError::Remote { .. }), "{err}");

    client.execute("d1", "node.increment", karabo::args![]).await.unwrap();
    client.execute("d1", "node.increment", karabo::args![]).await.unwrap();
    assert_eq!(client.get::<u32>("d1", "node.counterReadOnly").await.unwrap(), 2);

    server.shutdown().await;
}

#[tokio::test]
async fn topology_lists_servers_devices_and_classes() {
    let url = "inproc://topology";
    let server = server(url, "S1").await;
    let client = client(url).await;
    client.instantiate("S1", "PropertyTest", "d1", Hash::new()).await.unwrap();

    eventually("server and device to be known", || {
        let client = client.clone();
        async move { client.servers() == vec!["S1"] && client.devices() == vec!["d1"] }
    })
    .await;
    assert_eq!(client.devices_of("S1"), vec!["d1"]);
    assert!(client.classes("S1").contains(&"PropertyTest".to_string()));

    let schema = client.get_class_schema("S1", "PropertyTest").await.unwrap();
    assert!(schema.has("int32Property"));
    assert!(schema.has("stopWritingOutput"));

    client.kill_device("d1").await.unwrap();
    eventually("device to be gone", || {
        let client = client.clone();
        async move { client.devices().is_empty() }
    })
    .await;
    assert!(server.devices().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn kill_server_stops_every_device() {
    let url = "inproc://kill-server";
    let server = server(url, "S1").await;
    let client = client(url).await;
    client.instantiate("S1", "PropertyTest", "a", Hash::new()).await.unwrap();
    client.instantiate("S1", "PropertyTest", "b", Hash::new()).await.unwrap();

    client.kill_server("S1").await.unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(5), server.stopped())
        .await
        .unwrap();
    assert_eq!(reason, karabo::server::ShutdownReason::Requested);
    assert!(server.devices().is_empty());
    assert!(client.wait_for_device("a", Duration::from_millis(200)).await.is_err());
}

#[tokio::test]
async fn init_configuration_starts_devices() {
    let url = "inproc://init-autostart";
    let config = karabo::config::ServerConfig {
        server_id: Some("S3".to_string()),
        instance_check_timeout_ms: 100,
        init: Some(r#"{"auto1": {"classId": "PropertyTest", "int32Property": 3}}"#.to_string()),
        ..karabo::config::ServerConfig::default()
    };
    let classes = karabo::device::DeviceClasses::for_namespace("karabo.devices").unwrap();
    let server = karabo::server::DeviceServer::new(&config, classes, common::broker(url));
    server.start().await.unwrap();

    assert_eq!(server.devices(), vec!["auto1"]);
    let client = client(url).await;
    client.wait_for_device("auto1", Duration::from_secs(2)).await.unwrap();
    assert_eq!(client.get::<i32>("auto1", "int32Property").await.unwrap(), 3);

    server.shutdown().await;
}

struct Hanging;
struct HangingHooks;

#[async_trait]
impl DeviceHooks for HangingHooks {
    async fn pre_destruction(&self, _device: &Device) {
        std::future::pending::<()>().await;
    }
}

impl DeviceFactory for Hanging {
    fn class_id(&self) -> &'static str {
        "Hanging"
    }
    fn expected_parameters(&self, _schema: &mut Schema) -> CoreResult<()> {
        Ok(())
    }
    fn build(&self, _device: &Device) -> KaraboResult<Arc<dyn DeviceHooks>> {
        Ok(Arc::new(HangingHooks))
    }
}

#[tokio::test]
async fn client_kill_of_a_hanging_device_is_enforced_by_the_server() {
    let url = "inproc://kill-hanging";
    let mut classes = DeviceClasses::new("test");
    classes.register(Arc::new(Hanging)).unwrap();
    let config = ServerConfig {
        server_id: Some("S5".to_string()),
        instance_check_timeout_ms: 100,
        kill_grace_secs: 1,
        ..ServerConfig::default()
    };
    let server = DeviceServer::new(&config, classes, common::broker(url));
    server.start().await.unwrap();
    let client = client(url).await;
    client.instantiate("S5", "Hanging", "h1", Hash::new()).await.unwrap();
    eventually("server and device to be known", || {
        let client = client.clone();
        async move { client.servers() == vec!["S5"] && client.devices() == vec!["h1"] }
    })
    .await;

    let started = Instant::now();
    let err = client.kill_device("h1").await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(4), "took {:?}", started.elapsed());
    assert!(err.to_string().contains("did not shut down within 1 s"), "{err}");

    assert!(server.devices().is_empty());
    eventually("device to be gone", || {
        let client = client.clone();
        async move { client.devices().is_empty() }
    })
    .await;
    assert!(client.wait_for_device("h1", Duration::from_millis(200)).await.is_err());

    server.shutdown().await;
}
