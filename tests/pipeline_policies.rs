//! Pipeline channels wired directly, without devices or a broker.

use std::sync::Arc;
use std::time::Duration;

use karabo::pipeline::{InputChannel, InputConfig, InputHandlers, OutputChannel, OutputConfig, StaticResolver};
use karabo_core::{Hash, Timestamp};
use parking_lot::Mutex;
use tokio::sync::Notify;

struct Sink {
    counters: Arc<Mutex<Vec<i32>>>,
    ended: Arc<Notify>,
}

impl Sink {
    fn received(&self) -> usize {
        self.counters.lock().len()
    }

    fn counters(&self) -> Vec<i32> {
        self.counters.lock().clone()
    }
}

fn input(
    id: &str,
    resolver: &Arc<StaticResolver>,
    distribution: &str,
    slowness: &str,
    processing: Duration,
) -> (InputChannel, Sink) {
    input_with(id, resolver, distribution, slowness, InputConfig::default().max_queue_length, processing)
}

fn input_with(
    id: &str,
    resolver: &Arc<StaticResolver>,
    distribution: &str,
    slowness: &str,
    max_queue_length: u32,
    processing: Duration,
) -> (InputChannel, Sink) {
    let config = InputConfig {
        connected_output_channels: vec!["s:output".to_string()],
        data_distribution: distribution.to_string(),
        on_slowness: slowness.to_string(),
        max_queue_length,
        ..InputConfig::default()
    };
    let channel = InputChannel::new(id, &config, resolver.clone()).unwrap();
    let counters = Arc::new(Mutex::new(Vec::new()));
    let ended = Arc::new(Notify::new());
    let (c, e) = (counters.clone(), ended.clone());
    channel.set_handlers(
        InputHandlers::default()
            .on_data(move |data: Hash, _| {
                let c = c.clone();
                async move {
                    tokio::time::sleep(processing).await;
                    c.lock().push(data.get::<i32>("counter").unwrap());
                }
            })
            .on_eos(move |_| {
                let e = e.clone();
                async move { e.notify_one() }
            }),
    );
    channel.connect();
    (channel, Sink { counters, ended })
}

async fn output(no_input_shared: &str) -> (OutputChannel, Arc<StaticResolver>) {
    let config = OutputConfig {
        no_input_shared: no_input_shared.to_string(),
        ..OutputConfig::default()
    };
    let output = OutputChannel::bind("s:output", &config).await.unwrap();
    let resolver = StaticResolver::new();
    resolver.insert("s:output", &output);
    (output, resolver)
}

async fn wait_for_inputs(output: &OutputChannel, n: usize) {
    for _ in 0..500 {
        if output.connection_count() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("only {} of {n} inputs connected", output.connection_count());
}

async fn write(output: &OutputChannel, n: i32) {
    write_paced(output, n, Duration::ZERO).await;
}

async fn write_paced(output: &OutputChannel, n: i32, pause: Duration) {
    for i in 0..n {
        let mut data = Hash::new();
        data.set("counter", i);
        output.write(&data, Timestamp::now()).await.unwrap();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
    output.signal_end_of_stream().await.unwrap();
}

async fn wait_until_connected(input: &InputChannel) {
    for _ in 0..500 {
        if !input.connected_outputs().is_empty() {
            // first credit follows the connect handler
            tokio::time::sleep(Duration::from_millis(20)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never connected", input.channel_id());
}

fn assert_increasing(counters: &[i32]) {
    assert!(
        counters.windows(2).all(|w| w[0] < w[1]),
        "chunks out of order or repeated: {counters:?}"
    );
}

async fn ended(sink: &Sink) {
    tokio::time::timeout(Duration::from_secs(10), sink.ended.notified())
        .await
        .expect("end of stream not delivered");
}

#[tokio::test]
async fn wait_policy_delivers_every_chunk() {
    let (output, resolver) = output("wait").await;
    let (_input, sink) = input("r:input", &resolver, "copy", "wait", Duration::from_millis(2));
    wait_for_inputs(&output, 1).await;

    write(&output, 50).await;
    ended(&sink).await;
    assert_eq!(sink.counters(), (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn drop_policy_skips_chunks_for_a_slow_input() {
    let (output, resolver) = output("wait").await;
    let (input, sink) = input("r:input", &resolver, "copy", "drop", Duration::from_millis(30));
    wait_for_inputs(&output, 1).await;
    wait_until_connected(&input).await;

    write_paced(&output, 40, Duration::from_millis(2)).await;
    ended(&sink).await;
    let counters = sink.counters();
    assert!(!counters.is_empty(), "nothing received");
    assert!(counters.len() < 40, "slow input got all {} chunks", counters.len());
    assert_eq!(counters[0], 0, "an idle input takes the first chunk");
    assert_increasing(&counters);
}

#[tokio::test]
async fn queue_drop_keeps_the_newest_chunks_and_end_of_stream() {
    let (output, resolver) = output("wait").await;
    let (input, sink) = input_with("r:input", &resolver, "copy", "queueDrop", 2, Duration::from_millis(20));
    wait_for_inputs(&output, 1).await;
    wait_until_connected(&input).await;

    write(&output, 40).await;
    ended(&sink).await;
    let counters = sink.counters();
    assert!(counters.len() < 40, "slow input got all {} chunks", counters.len());
    assert_increasing(&counters);
    assert_eq!(counters.last(), Some(&39), "newest chunk evicted: {counters:?}");
}

#[tokio::test]
async fn copy_inputs_each_see_the_full_stream() {
    let (output, resolver) = output("wait").await;
    let (_a, a) = input("a:input", &resolver, "copy", "wait", Duration::ZERO);
    let (_b, b) = input("b:input", &resolver, "copy", "queue", Duration::from_millis(1));
    wait_for_inputs(&output, 2).await;

    write(&output, 30).await;
    ended(&a).await;
    ended(&b).await;
    assert_eq!(a.counters(), (0..30).collect::<Vec<_>>());
    assert_eq!(b.counters(), (0..30).collect::<Vec<_>>());
}

#[tokio::test]
async fn shared_inputs_split_the_stream() {
    let (output, resolver) = output("wait").await;
    let (_a, a) = input("a:input", &resolver, "shared", "wait", Duration::from_millis(1));
    let (_b, b) = input("b:input", &resolver, "shared", "wait", Duration::from_millis(1));
    wait_for_inputs(&output, 2).await;

    write(&output, 40).await;
    ended(&a).await;
    ended(&b).await;
    let (ra, rb) = (a.received(), b.received());
    assert_eq!(ra + rb, 40);
    assert!(ra > 0 && rb > 0, "one input starved: {ra}/{rb}");
    assert_increasing(&a.counters());
    assert_increasing(&b.counters());
    let mut all: Vec<i32> = a.counters().into_iter().chain(b.counters()).collect();
    all.sort_unstable();
    assert_eq!(all, (0..40).collect::<Vec<_>>());
}

#[tokio::test]
async fn schema_reaches_connected_input() {
    let (output, resolver) = output("drop").await;
    let (input, _sink) = input("r:input", &resolver, "copy", "wait", Duration::ZERO);
    wait_for_inputs(&output, 1).await;

    let mut schema = Hash::new();
    schema.set("counter", "INT32");
    output.set_schema(schema.clone()).await;

    for _ in 0..200 {
        if let Some((version, received)) = input.schema("s:output") {
            if version == 1 {
                assert_eq!(received, schema);
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("schema never arrived");
}

#[tokio::test]
async fn closed_input_leaves_the_connection_table() {
    let (output, resolver) = output("drop").await;
    let (input, _sink) = input("r:input", &resolver, "copy", "drop", Duration::ZERO);
    wait_for_inputs(&output, 1).await;
    for _ in 0..200 {
        if !input.connected_outputs().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(input.connected_outputs(), vec!["s:output"]);
    assert_eq!(output.connections()[0].get::<String>("remoteId").unwrap(), "r:input");

    input.close();
    wait_for_inputs(&output, 0).await;
}

#[tokio::test]
async fn schema_changes_during_connect_reach_every_input() {
    let (output, resolver) = output("drop").await;
    let changer = {
        let output = output.clone();
        tokio::spawn(async move {
            for i in 0..40 {
                let mut schema = Hash::new();
                schema.set("counter", i);
                output.set_schema(schema).await;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };
    let inputs: Vec<_> = (0..8)
        .map(|i| input(&format!("r{i}:input"), &resolver, "copy", "drop", Duration::ZERO))
        .collect();
    changer.await.unwrap();
    wait_for_inputs(&output, inputs.len()).await;

    let (latest, schema) = output.schema();
    assert_eq!(latest, 40);
    for (input, _) in &inputs {
        let mut seen = None;
        for _ in 0..300 {
            seen = input.schema("s:output");
            if matches!(&seen, Some((version, _)) if *version == latest) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen, Some((latest, schema.clone())), "{} is behind", input.channel_id());
    }
}

#[tokio::test]
async fn close_writes_out_what_was_queued() {
    let (output, resolver) = output("wait").await;
    let (input, sink) = input("r:input", &resolver, "copy", "queue", Duration::from_millis(20));
    wait_for_inputs(&output, 1).await;
    wait_until_connected(&input).await;

    write(&output, 6).await;
    output.close().await;
    ended(&sink).await;
    assert_eq!(sink.counters(), (0..6).collect::<Vec<_>>());
}
