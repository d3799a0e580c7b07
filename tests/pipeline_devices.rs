//! Two `PropertyTest` devices connected through their pipeline channels.

mod common;

use std::time::Duration;

use karabo_core::{hash, Hash, Value};

use common::{client, eventually, server};

async fn connected(server: &karabo::server::DeviceServer, sender: &str, inputs: usize) {
    let output = server.device(sender).unwrap().output("output").unwrap();
    eventually("inputs to connect", || {
        let output = output.clone();
        async move { output.connection_count() == inputs }
    })
    .await;
}

#[tokio::test]
async fn wait_policy_receives_every_written_chunk() {
    let url = "inproc://pipeline-wait";
    let server = server(url, "S1").await;
    let client = client(url).await;

    client
        .instantiate("S1", "PropertyTest", "s", hash! { "updateFrequency" => 10.0f64 })
        .await
        .unwrap();
    let input = hash! {
        "connectedOutputChannels" => vec!["s:output".to_string()],
        "onSlowness" => "wait",
        "dataDistribution" => "copy",
    };
    client
        .instantiate("S1", "PropertyTest", "r", hash! { "input" => input })
        .await
        .unwrap();
    connected(&server, "s", 1).await;

    let sender = client.proxy("s").await.unwrap();
    let receiver = client.proxy("r").await.unwrap();

    sender.execute("startWritingOutput", karabo::args![]).await.unwrap();
    sender
        .wait_until("state", |v| v == &Value::from("STARTED"), Duration::from_secs(2))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    sender.execute("stopWritingOutput", karabo::args![]).await.unwrap();
    sender
        .wait_until("state", |v| v == &Value::from("NORMAL"), Duration::from_secs(5))
        .await
        .unwrap();

    let written = sender.get::<i32>("outputCounter").unwrap();
    assert!(written >= 2, "only {written} chunks written");
    receiver
        .wait_until(
            "inputCounter",
            |v| v == &Value::UInt32(written as u32),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(receiver.get::<i32>("currentInputId").unwrap(), written);

    server.shutdown().await;
}

#[tokio::test]
async fn end_of_stream_is_recorded_and_forwarded() {
    let url = "inproc://pipeline-eos";
    let server = server(url, "S1").await;
    let client = client(url).await;

    client.instantiate("S1", "PropertyTest", "a", Hash::new()).await.unwrap();
    let from_a = |source: &str| {
        hash! {
            "connectedOutputChannels" => vec![format!("{source}:output")],
            "onSlowness" => "wait",
        }
    };
    client
        .instantiate("S1", "PropertyTest", "b", hash! { "input" => from_a("a") })
        .await
        .unwrap();
    client
        .instantiate("S1", "PropertyTest", "c", hash! { "input" => from_a("b") })
        .await
        .unwrap();
    connected(&server, "a", 1).await;
    connected(&server, "b", 1).await;

    let a = client.proxy("a").await.unwrap();
    let c = client.proxy("c").await.unwrap();
    for _ in 0..3 {
        a.execute("writeOutput", karabo::args![]).await.unwrap();
    }
    a.execute("eosOutput", karabo::args![]).await.unwrap();

    c.wait_until("inputCounterAtEos", |v| v == &Value::UInt32(3), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(c.get::<u32>("inputCounter").unwrap(), 3);

    c.execute("resetChannelCounters", karabo::args![]).await.unwrap();
    c.wait_until("inputCounter", |v| v == &Value::UInt32(0), Duration::from_secs(2))
        .await
        .unwrap();

    server.shutdown().await;
}

#[tokio::test]
async fn reconfigured_input_switches_output() {
    let url = "inproc://pipeline-rewire";
    let server = server(url, "S1").await;
    let client = client(url).await;

    client.instantiate("S1", "PropertyTest", "x", Hash::new()).await.unwrap();
    client.instantiate("S1", "PropertyTest", "y", Hash::new()).await.unwrap();
    client.instantiate("S1", "PropertyTest", "r", Hash::new()).await.unwrap();

    client
        .set("r", "input.connectedOutputChannels", vec!["x:output".to_string()])
        .await
        .unwrap();
    connected(&server, "x", 1).await;

    client
        .set("r", "input.connectedOutputChannels", vec!["y:output".to_string()])
        .await
        .unwrap();
    connected(&server, "y", 1).await;
    connected(&server, "x", 0).await;

    server.shutdown().await;
}
