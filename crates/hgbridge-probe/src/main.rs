//! hgbridge probe - drives the callback bridge from many producer threads.
//!
//! Producer threads play the IPC client's worker pool against an in-process
//! loopback transport while the main thread runs the host loop. The probe
//! reports how many calls crossed the bridge and whether every blocking
//! call got its own answer back.

use anyhow::{anyhow, ensure, Result};
use clap::Parser;
use hgbridge_core::{
    BridgeConfig, HostHandlers, LoopbackPeer, NodeInputVariant, Session, ShutdownSignal, Struct,
    Value,
};
use serde::Serialize;
use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "hgbridge-probe")]
#[command(about = "Exercise the hgbridge callback bridge over a loopback transport")]
struct Args {
    /// Connection target (empty = default Homegear socket)
    #[arg(short, long, default_value = "")]
    target: String,

    /// Number of producer threads
    #[arg(short, long, default_value = "4")]
    producers: usize,

    /// Variables per broadcastEvent call
    #[arg(long, default_value = "16")]
    events: usize,

    /// Blocking invokeNodeMethod calls per producer
    #[arg(long, default_value = "8")]
    invokes: usize,

    /// Deadline for each blocking call in milliseconds
    #[arg(long, default_value = "30000")]
    timeout_ms: u64,

    /// Use the four-parameter NodeInput method
    #[arg(long)]
    legacy_node_input: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Debug, Default)]
struct ProducerStats {
    events_sent: usize,
    node_inputs_sent: usize,
    invokes_sent: usize,
    invokes_answered: usize,
    invoke_faults: usize,
}

impl ProducerStats {
    fn merge(&mut self, other: ProducerStats) {
        self.events_sent += other.events_sent;
        self.node_inputs_sent += other.node_inputs_sent;
        self.invokes_sent += other.invokes_sent;
        self.invokes_answered += other.invokes_answered;
        self.invoke_faults += other.invoke_faults;
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProbeReport {
    target: String,
    peer_version: serde_json::Value,
    producers: usize,
    events_sent: usize,
    events_handled: usize,
    node_inputs_sent: usize,
    node_inputs_handled: usize,
    invokes_sent: usize,
    invokes_handled: usize,
    invokes_answered: usize,
    invoke_faults: usize,
    connects: usize,
    disconnects: usize,
    elapsed_ms: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.log_json);

    let variant = if args.legacy_node_input {
        NodeInputVariant::Legacy
    } else {
        NodeInputVariant::Current
    };
    let config = BridgeConfig::default()
        .with_target(args.target.clone())
        .with_invoke_timeout(Duration::from_millis(args.timeout_ms))
        .with_node_input(variant);

    let connects = Rc::new(Cell::new(0usize));
    let disconnects = Rc::new(Cell::new(0usize));
    let events = Rc::new(Cell::new(0usize));
    let node_inputs = Rc::new(Cell::new(0usize));
    let invokes = Rc::new(Cell::new(0usize));

    let handlers = HostHandlers::new()
        .on_connect(counter(&connects))
        .on_disconnect(counter(&disconnects))
        .on_event({
            let events = events.clone();
            move |_, _, _, _, _| events.set(events.get() + 1)
        })
        .on_node_input({
            let node_inputs = node_inputs.clone();
            move |_, _, _, _, _| {
                node_inputs.set(node_inputs.get() + 1);
                serde_json::Value::Null
            }
        })
        .on_invoke_node_method({
            let invokes = invokes.clone();
            move |node_id, method, parameters| {
                invokes.set(invokes.get() + 1);
                serde_json::json!({
                    "nodeId": node_id,
                    "method": method,
                    "parameters": parameters,
                })
            }
        });

    let peer = LoopbackPeer::new();
    peer.register_method("getVersion", |_| Value::from(env!("CARGO_PKG_VERSION")));

    let shutdown = ShutdownSignal::new();
    let mut session = Session::builder(peer.clone())
        .config(config)
        .handlers(handlers)
        .shutdown(shutdown.clone())
        .connect()?;

    let peer_version = session.invoke(&serde_json::json!("getVersion"), &serde_json::json!([]))?;
    info!("Connected to {} (peer {})", session.target(), peer_version);

    let started = Instant::now();
    let workers: Vec<_> = (0..args.producers)
        .map(|id| {
            let peer = peer.clone();
            let (events, invokes) = (args.events, args.invokes);
            thread::spawn(move || produce(&peer, id, events, invokes, variant))
        })
        .collect();

    let supervisor = thread::spawn(move || {
        let mut totals = ProducerStats::default();
        let mut panicked = 0usize;
        for worker in workers {
            match worker.join() {
                Ok(stats) => totals.merge(stats),
                Err(_) => panicked += 1,
            }
        }
        shutdown.trigger();
        (totals, panicked)
    });

    let executed = session.run().await;
    peer.set_connected(false);
    let drained = session.run_pending();
    info!("Host loop executed {} calls ({} after shutdown)", executed + drained, drained);

    let (totals, panicked) = supervisor
        .join()
        .map_err(|_| anyhow!("producer supervisor panicked"))?;
    ensure!(panicked == 0, "{} producer threads panicked", panicked);

    let report = ProbeReport {
        target: session.target().to_string(),
        peer_version,
        producers: args.producers,
        events_sent: totals.events_sent,
        events_handled: events.get(),
        node_inputs_sent: totals.node_inputs_sent,
        node_inputs_handled: node_inputs.get(),
        invokes_sent: totals.invokes_sent,
        invokes_handled: invokes.get(),
        invokes_answered: totals.invokes_answered,
        invoke_faults: totals.invoke_faults,
        connects: connects.get(),
        disconnects: disconnects.get(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    print_report(&report, args.json)?;

    ensure!(
        report.invoke_faults == 0,
        "{} blocking calls did not get their own answer",
        report.invoke_faults
    );
    Ok(())
}

fn init_logging(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn counter(cell: &Rc<Cell<usize>>) -> impl FnMut() + 'static {
    let cell = cell.clone();
    move || cell.set(cell.get() + 1)
}

/// Play one transport worker thread.
fn produce(
    peer: &LoopbackPeer,
    id: usize,
    events: usize,
    invokes: usize,
    variant: NodeInputVariant,
) -> ProducerStats {
    let mut stats = ProducerStats::default();

    let names = (0..events)
        .map(|i| Value::from(format!("VARIABLE_{}", i)))
        .collect();
    let values = (0..events).map(|i| Value::Integer(i as i64)).collect();
    let result = peer.call_local(
        "broadcastEvent",
        vec![
            Value::from("probe"),
            Value::Integer(id as i64),
            Value::Integer(1),
            Value::Array(names),
            Value::Array(values),
        ],
    );
    match result.as_fault() {
        Some(fault) => warn!("Producer {}: broadcastEvent failed: {}", id, fault),
        None => stats.events_sent += events,
    }

    let mut message = Struct::new();
    message.insert("payload".to_string(), Value::Integer(id as i64));
    let mut params = vec![
        Value::from(format!("node-{}", id)),
        Value::Struct(Struct::new()),
        Value::Integer(0),
        Value::Struct(message),
    ];
    if variant == NodeInputVariant::Current {
        params.push(Value::Boolean(false));
    }
    if peer.call_local(variant.method_name(), params).is_fault() {
        warn!("Producer {}: {} failed", id, variant.method_name());
    } else {
        stats.node_inputs_sent += 1;
    }

    for i in 0..invokes {
        let method = format!("step{}_{}", id, i);
        let result = peer.call_local(
            "invokeNodeMethod",
            vec![
                Value::from(format!("node-{}", id)),
                Value::from(method.clone()),
                Value::Array(vec![Value::Integer(i as i64)]),
            ],
        );
        stats.invokes_sent += 1;

        let answered = result
            .as_struct()
            .and_then(|map| map.get("method"))
            .and_then(Value::as_str)
            == Some(method.as_str());
        if answered {
            stats.invokes_answered += 1;
        } else {
            warn!("Producer {}: unexpected answer to {}: {:?}", id, method, result);
            stats.invoke_faults += 1;
        }
    }

    stats
}

fn print_report(report: &ProbeReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("target:       {}", report.target);
    println!("peer version: {}", report.peer_version);
    println!("producers:    {}", report.producers);
    println!(
        "events:       {} sent, {} handled",
        report.events_sent, report.events_handled
    );
    println!(
        "node inputs:  {} sent, {} handled",
        report.node_inputs_sent, report.node_inputs_handled
    );
    println!(
        "invokes:      {} sent, {} handled, {} answered, {} faults",
        report.invokes_sent, report.invokes_handled, report.invokes_answered, report.invoke_faults
    );
    println!(
        "lifecycle:    {} connects, {} disconnects",
        report.connects, report.disconnects
    );
    println!("elapsed:      {} ms", report.elapsed_ms);
    Ok(())
}
