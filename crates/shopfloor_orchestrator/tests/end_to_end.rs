//! End-to-end integration test.
//!
//! Spins up a mock Modbus TCP server whose piece counter climbs on every
//! read, builds the service from a TOML config and verifies the full
//! pipeline: config → ModbusConnector → poller → accounting → events.

use shopfloor_orchestrator::{create_connector, FileConfigSource, OrchestratorConfig};
use shopfloor_runtime::accounting::ManualAppointmentRequest;
use shopfloor_runtime::events::{BroadcastSink, ProductionUpdate, ShopfloorEvent};
use shopfloor_runtime::model::OrderStatus;
use shopfloor_runtime::store::{MemoryStore, ProductionStore, StaticConfigSource};
use shopfloor_runtime::service::ShopfloorService;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

const COUNTER_STEP: u32 = 2;

/// Serves one client. Each read of holding register 0 advances the 32-bit
/// counter (high word at 0, low word at 1) by `COUNTER_STEP`.
async fn serve(mut stream: TcpStream, counter: Arc<AtomicU32>) {
    let mut buf = [0u8; 256];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if n < 12 {
            break;
        }

        let tid = [buf[0], buf[1]];
        let unit_id = buf[6];
        let fc = buf[7];
        let start = u16::from_be_bytes([buf[8], buf[9]]);
        let count = u16::from_be_bytes([buf[10], buf[11]]);

        match fc {
            0x03 => {
                let value = if start == 0 {
                    counter.fetch_add(COUNTER_STEP, Ordering::SeqCst) + COUNTER_STEP
                } else {
                    counter.load(Ordering::SeqCst)
                };
                let words = [(value >> 16) as u16, value as u16];
                let byte_count = (count * 2) as u8;
                let mut resp = Vec::new();
                resp.extend_from_slice(&tid);
                resp.extend_from_slice(&[0x00, 0x00]);
                resp.extend_from_slice(&(3 + u16::from(byte_count)).to_be_bytes());
                resp.push(unit_id);
                resp.push(fc);
                resp.push(byte_count);
                for i in 0..count {
                    let w = words.get((start + i) as usize).copied().unwrap_or(0);
                    resp.extend_from_slice(&w.to_be_bytes());
                }
                if stream.write_all(&resp).await.is_err() {
                    break;
                }
            }
            _ => break,
        }
    }
}

async fn mock_counter_server(listener: TcpListener, counter: Arc<AtomicU32>) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(serve(stream, Arc::clone(&counter)));
    }
}

async fn start_mock() -> (u16, Arc<AtomicU32>) {
    let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();
    let counter = Arc::new(AtomicU32::new(0));
    tokio::spawn(mock_counter_server(listener, Arc::clone(&counter)));
    (port, counter)
}

/// Answers FC 0x03 with `100 + n`, where `n` counts requests across all
/// connections. The very first reply is held back for `LATE_REPLY_MS`.
async fn late_first_reply_server(listener: TcpListener) {
    let served = Arc::new(AtomicU32::new(0));
    while let Ok((mut stream, _)) = listener.accept().await {
        let served = Arc::clone(&served);
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            while let Ok(n) = stream.read(&mut buf).await {
                if n < 12 || buf[7] != 0x03 {
                    break;
                }
                let nth = served.fetch_add(1, Ordering::SeqCst);
                if nth == 0 {
                    tokio::time::sleep(Duration::from_millis(LATE_REPLY_MS)).await;
                }
                let value = 100 + nth as u16;
                let mut resp = Vec::new();
                resp.extend_from_slice(&buf[..2]);
                resp.extend_from_slice(&[0x00, 0x00, 0x00, 0x05, buf[6], 0x03, 0x02]);
                resp.extend_from_slice(&value.to_be_bytes());
                if stream.write_all(&resp).await.is_err() {
                    break;
                }
            }
        });
    }
}

const LATE_REPLY_MS: u64 = 300;

fn modbus_config(port: u16) -> String {
    format!(
        r#"
[mode]
type = "modbus_tcp"

[connection]
host = "127.0.0.1"
port = {port}
timeout_ms = 500
poll_interval_ms = 50
reconnect_interval_ms = 200

[[registers]]
id = 1
address = 0
name = "counter"
data_type = "u32"

[[orders]]
id = 7
code = "OP-0007"
planned_quantity = 6
"#
    )
}

async fn next_update(rx: &mut broadcast::Receiver<ShopfloorEvent>) -> ProductionUpdate {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(ShopfloorEvent::ProductionUpdate(update)) => return update,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("sink closed"),
            }
        }
    })
    .await
    .expect("production update within timeout")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn counter_increments_become_automatic_appointments() {
    let (port, _counter) = start_mock().await;
    let config = OrchestratorConfig::from_toml(&modbus_config(port)).unwrap();
    let (connector, sim) = create_connector(&config).unwrap();
    assert!(sim.is_none());

    let store = Arc::new(config.seeded_store());
    let sink = Arc::new(BroadcastSink::new(256));
    let mut events = sink.subscribe();
    let service = ShopfloorService::new(
        connector,
        Arc::new(StaticConfigSource::new(config.profile())),
        store.clone(),
        sink,
        config.service_settings(),
    );

    service.start_order(7).unwrap();
    service.start().await.unwrap();

    let mut finished = None;
    for _ in 0..3 {
        let update = next_update(&mut events).await;
        assert_eq!(update.delta, COUNTER_STEP as i64);
        assert!(update.appointment.record.automatic);
        assert!(update.defect.is_none());
        if update.order.status == OrderStatus::Finished {
            finished = Some(update);
        }
    }

    let finished = finished.expect("order finished after reaching plan");
    assert_eq!(finished.order.produced_quantity, 6);
    assert!(finished.order.finished_at.is_some());
    assert!(service.status().connected);

    let json = serde_json::to_value(ShopfloorEvent::ProductionUpdate(finished)).unwrap();
    assert_eq!(json["event"], "production_update");
    assert_eq!(json["order"]["status"], "FINISHED");

    service.shutdown().await;

    let appointments = store.appointments();
    assert!(appointments.len() >= 3);
    let total: i64 = appointments.iter().map(|a| a.record.quantity).sum();
    assert_eq!(store.order(7).unwrap().unwrap().produced_quantity, total);
    assert!(!store.readings().is_empty());
}

#[tokio::test]
async fn manual_appointment_with_losses_through_sim_mode() {
    let config = OrchestratorConfig::from_toml(
        r#"
[mode]
type = "sim"

[[orders]]
id = 3
code = "OP-0003"
planned_quantity = 100
"#,
    )
    .unwrap();
    let (connector, _sim) = create_connector(&config).unwrap();
    let store = Arc::new(config.seeded_store());
    let sink = Arc::new(BroadcastSink::new(64));
    let mut events = sink.subscribe();
    let service = ShopfloorService::new(
        connector,
        Arc::new(StaticConfigSource::new(config.profile())),
        store.clone(),
        sink,
        config.service_settings(),
    );
    service.start().await.unwrap();
    assert!(!service.status().connected);

    let mut req = ManualAppointmentRequest::new(3, 42, 20, 3);
    req.notes = Some("end of shift count".to_string());
    let update = service.create_manual_appointment(req).unwrap();
    assert_eq!(update.order.produced_quantity, 20);
    assert_eq!(update.order.rejected_quantity, 3);
    assert_eq!(update.defect.as_ref().unwrap().record.quantity, 3);

    let published = next_update(&mut events).await;
    assert_eq!(published, update);
    assert_eq!(store.defects().len(), 1);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_picks_up_edited_config_file() {
    let (port, _counter) = start_mock().await;
    let path = std::env::temp_dir().join(format!("shopfloor_reload_{port}.toml"));
    let inactive = modbus_config(port).replace(
        "reconnect_interval_ms = 200",
        "reconnect_interval_ms = 200\nactive = false",
    );
    std::fs::write(&path, inactive).unwrap();

    let config = OrchestratorConfig::from_file(&path).unwrap();
    let (connector, _) = create_connector(&config).unwrap();
    let service = ShopfloorService::new(
        connector,
        Arc::new(FileConfigSource::new(&path)),
        Arc::new(MemoryStore::new()),
        Arc::new(BroadcastSink::new(64)),
        config.service_settings(),
    );

    service.start().await.unwrap();
    assert!(!service.status().connected);

    std::fs::write(&path, modbus_config(port)).unwrap();
    service.reload().await.unwrap();
    assert!(service.status().connected);
    assert_eq!(
        service.status().endpoint.as_deref(),
        Some(format!("127.0.0.1:{port}").as_str())
    );

    service.shutdown().await;
    let _ = std::fs::remove_file(&path);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_reply_after_timeout_does_not_answer_the_next_read() {
    let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(late_first_reply_server(listener));

    let config = OrchestratorConfig::from_toml(&format!(
        r#"
[mode]
type = "modbus_tcp"

[connection]
host = "127.0.0.1"
port = {port}
timeout_ms = 100
poll_interval_ms = 60000
"#
    ))
    .unwrap();
    let (connector, _) = create_connector(&config).unwrap();
    let service = ShopfloorService::new(
        connector,
        Arc::new(StaticConfigSource::new(config.profile())),
        Arc::new(MemoryStore::new()),
        Arc::new(BroadcastSink::new(64)),
        config.service_settings(),
    );
    service.start().await.unwrap();
    assert!(service.status().connected);

    let manager = service.manager();
    assert!(manager.read_register(0).await.is_err());
    tokio::time::sleep(Duration::from_millis(LATE_REPLY_MS)).await;
    assert_eq!(manager.read_register(0).await.unwrap(), 101);
    assert_eq!(manager.read_register(0).await.unwrap(), 102);
    assert!(service.status().connected);

    service.shutdown().await;
}
