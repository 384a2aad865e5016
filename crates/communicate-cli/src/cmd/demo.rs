//! `communicate demo`: a publisher and a searcher in one process.

use crate::ui;
use communicate_types::{
    ActionState, CommunicatorConfig, DataComponent, ServiceDescriptor, TxtRecordSet,
};
use communicate_wire::{
    Communicator, CommunicatorEvent, Connection, ConnectionEvent, LoopbackDiscovery, Payload,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

type DemoResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub fn cmd_demo(
    config: Option<PathBuf>,
    count: u32,
    file: Option<PathBuf>,
    binary: bool,
    txt: Vec<(String, String)>,
) {
    let config = communicate_wire::load_config(config.as_deref());
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to start runtime: {e}"));
            std::process::exit(1);
        }
    };
    let txt: TxtRecordSet = txt.into_iter().collect();
    if let Err(e) = rt.block_on(run(config, count, file, binary, txt)) {
        ui::error(&e.to_string());
        std::process::exit(1);
    }
}

async fn run(
    config: CommunicatorConfig,
    count: u32,
    file: Option<PathBuf>,
    binary: bool,
    txt: TxtRecordSet,
) -> DemoResult<()> {
    let discovery = Arc::new(LoopbackDiscovery::new());
    let timeout = config.resolve_timeout();
    let interval = config.send_interval();

    let client_config = CommunicatorConfig {
        name: format!("{}-client", config.name),
        port: 0,
        ..config.clone()
    };
    let server = Communicator::new(config, discovery.clone())?;
    let client = Communicator::new(client_config, discovery)?;
    let mut server_events = server.subscribe();
    let mut client_events = client.subscribe();

    ui::step("Publishing");
    let addr = server.start_listening().await?;
    server.publish_self(txt).await?;
    if let Some(descriptor) = server.advertised() {
        ui::kv("Service", &descriptor.to_string());
    }
    ui::kv("Listening", &addr.to_string());

    ui::step("Searching");
    client.start_searching().await?;
    let target = tokio::time::timeout(timeout, first_service(&mut client_events))
        .await
        .map_err(|_| "no service discovered in time")??;
    ui::success(&format!("Found {target}"));

    ui::step("Connecting");
    let outbound = client.connect_to(&target);
    outbound.wait_connected().await?;
    let inbound = tokio::time::timeout(timeout, incoming(&mut server_events))
        .await
        .map_err(|_| "server saw no incoming connection")??;
    ui::success(&format!("Connected to {outbound}"));

    let expected = if file.is_some() { 1 } else { count };
    let receiver = tokio::spawn(receive(inbound, expected));
    let progress = tokio::spawn(report_progress(outbound.subscribe()));

    match file {
        Some(path) => {
            ui::step(&format!("Sending {}", path.display()));
            outbound.send_file(&path).await?;
        }
        None => {
            ui::step(&format!("Sending {count} frames"));
            let mut ticker = tokio::time::interval(interval);
            for i in 0..count {
                ticker.tick().await;
                let text = format!("frame {i}");
                if binary {
                    outbound
                        .send_binary_object(&json!({ "index": i, "text": text }))
                        .await?;
                } else {
                    outbound.send_text(text).await?;
                }
            }
        }
    }

    let received = receiver.await?;
    ui::kv("Received", &format!("{received}/{expected}"));
    if let Some(remote) = outbound.remote_information() {
        ui::kv("Remote", &format!("{} ({}, {})", remote.name, remote.version, remote.platform));
    }
    let remote_txt = outbound.txt_records();
    if !remote_txt.is_empty() {
        let entries: Vec<String> = remote_txt.iter().map(|(k, v)| format!("{k}={v}")).collect();
        ui::kv("TXT", &entries.join(", "));
    }

    outbound.disconnect().await;
    progress.abort();
    client.stop().await;
    server.stop().await;
    ui::success("Done");
    if received < expected {
        ui::hint("some frames were not delivered; run with RUST_LOG=debug for details");
    }
    Ok(())
}

async fn first_service(
    events: &mut broadcast::Receiver<CommunicatorEvent>,
) -> DemoResult<ServiceDescriptor> {
    loop {
        match events.recv().await? {
            CommunicatorEvent::ServicesUpdated(services) => {
                if let Some(first) = services.into_iter().next() {
                    return Ok(first);
                }
            }
            CommunicatorEvent::SearchingStateChanged {
                error: Some(code), ..
            } => return Err(format!("search failed: {code}").into()),
            _ => {}
        }
    }
}

async fn incoming(events: &mut broadcast::Receiver<CommunicatorEvent>) -> DemoResult<Connection> {
    loop {
        if let CommunicatorEvent::IncomingConnection(connection) = events.recv().await? {
            return Ok(connection);
        }
    }
}

async fn receive(connection: Connection, expected: u32) -> u32 {
    let mut received = 0;
    while received < expected {
        match connection.recv().await {
            Some(Ok(data)) => {
                received += 1;
                let summary = match &data.payload {
                    Payload::Text(text) => text.clone(),
                    Payload::Object(value) => value.to_string(),
                    Payload::File(file) => format!("file {} ({} bytes)", file.name, file.data.len()),
                    other => format!("{} ({} bytes)", other.type_name(), data.length()),
                };
                println!("    <- [{}] {summary}", data.kind);
            }
            Some(Err(failure)) => ui::error(&failure.to_string()),
            None => break,
        }
    }
    received
}

async fn report_progress(mut events: broadcast::Receiver<ConnectionEvent>) {
    while let Ok(event) = events.recv().await {
        if let ConnectionEvent::Sending(progress) = event {
            match (progress.component, progress.state) {
                (DataComponent::Body, ActionState::Updating(_)) => {
                    debug!(name = %progress.name, fraction = progress.fraction(), "Sending");
                }
                (DataComponent::All, ActionState::Completed) => {
                    debug!(name = %progress.name, "Sent");
                }
                _ => {}
            }
        }
    }
}
