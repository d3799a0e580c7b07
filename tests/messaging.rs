//! Request/reply and signal delivery between endpoints, in-process and over
//! the TCP hub.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use karabo::broker::{self, TcpHub};
use karabo::config::BrokerConfig;
use karabo::signal_slot::{base_info, Args, SignalSlotable};
use karabo::{args, KaraboError};
use karabo_core::{hash, Value};
use parking_lot::Mutex;

use common::{client, server};

#[tokio::test]
async fn request_to_missing_instance_times_out() {
    let endpoint = SignalSlotable::new("caller", base_info("client", "h"), common::broker("inproc://timeout"));
    endpoint.start().await.unwrap();

    let started = Instant::now();
    let err = endpoint
        .request("nowhere", "slotPing", args!["nowhere", 1, true])
        .timeout(Duration::from_millis(200))
        .wait_for_reply()
        .await
        .unwrap_err();
    assert!(matches!(err, KaraboError::RequestTimeout { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_millis(300));
    endpoint.stop().await;
}

async fn tcp_endpoint(hub: &TcpHub, id: &str) -> SignalSlotable {
    let config = BrokerConfig {
        url: hub.url(),
        topic: common::TOPIC.to_string(),
        ..BrokerConfig::default()
    };
    let broker = broker::connect(&config).await.unwrap();
    SignalSlotable::new(id, base_info("device", "h"), broker)
}

#[tokio::test]
async fn signals_arrive_complete_and_in_order_over_tcp() {
    const N: i32 = 10_000;
    let hub = TcpHub::bind("127.0.0.1:0").await.unwrap();
    let sender = tcp_endpoint(&hub, "sender").await;
    let receiver = tcp_endpoint(&hub, "receiver").await;

    let seen = Arc::new(Mutex::new(Vec::with_capacity(N as usize)));
    let s = seen.clone();
    receiver.register_slot("slotOnChanged", move |args, _ctx| {
        let s = s.clone();
        async move {
            s.lock().push(args.get::<i32>(0)?);
            Ok(Args::new())
        }
    });
    sender.register_signal("onChanged");
    sender.start().await.unwrap();
    receiver.start().await.unwrap();
    receiver
        .connect("sender", "onChanged", "receiver", "slotOnChanged")
        .await
        .unwrap();

    for i in 0..N {
        sender.emit("onChanged", args![i]).await.unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(60);
    while seen.lock().len() < N as usize && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let seen = seen.lock();
    assert_eq!(seen.len(), N as usize);
    let mut gaps: Vec<i32> = seen.windows(2).map(|w| w[1] - w[0] - 1).collect();
    gaps.sort_unstable();
    gaps.dedup();
    assert_eq!(gaps, vec![0]);

    sender.stop().await;
    receiver.stop().await;
    hub.shutdown();
}

#[tokio::test]
async fn remote_failure_carries_the_message() {
    let hub = TcpHub::bind("127.0.0.1:0").await.unwrap();
    let a = tcp_endpoint(&hub, "a").await;
    let b = tcp_endpoint(&hub, "b").await;
    b.register_slot("slotDivide", |args, _ctx| async move {
        let divisor = args.get::<i32>(1)?;
        if divisor == 0 {
            return Err(KaraboError::Validation("division by zero".into()));
        }
        Ok(args![args.get::<i32>(0)? / divisor])
    });
    a.start().await.unwrap();
    b.start().await.unwrap();

    let reply = a.request("b", "slotDivide", args![9, 3]).wait_for_reply().await.unwrap();
    assert_eq!(reply.get::<i32>(0).unwrap(), 3);
    match a.request("b", "slotDivide", args![1, 0]).wait_for_reply().await {
        Err(KaraboError::Remote { message, .. }) => assert_eq!(message, "division by zero"),
        other => panic!("unexpected {other:?}"),
    }
    hub.shutdown();
}

#[tokio::test]
async fn proxy_follows_device_updates() {
    let url = "inproc://proxy-follow";
    let server = server(url, "S1").await;
    let client = client(url).await;
    client
        .instantiate("S1", "PropertyTest", "d1", hash! { "doubleProperty" => 1.5f64 })
        .await
        .unwrap();

    let proxy = client.proxy("d1").await.unwrap();
    let again = client.proxy("d1").await.unwrap();
    assert_eq!(proxy.get::<f64>("doubleProperty").unwrap(), 1.5);
    assert!(proxy.schema().has("doublePropertyReadOnly"));

    let mut watched = proxy.watch("doubleProperty");
    client.set("d1", "doubleProperty", 50.0f64).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), watched.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*watched.borrow(), Some(Value::Double(50.0)));
    assert_eq!(again.get::<f64>("doublePropertyReadOnly").unwrap(), 50.0);

    again
        .wait_until(
            "alarmCondition",
            |v| v == &Value::from("warn"),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    proxy.set("stringProperty", "alarm").await.unwrap();
    proxy.execute("setAlarm", args![]).await.unwrap();
    proxy
        .wait_until("alarmNeedsAcknowledging", |v| v == &Value::Bool(true), Duration::from_secs(2))
        .await
        .unwrap();

    server.shutdown().await;
}
