use shopfloor_hal::config::DataType;
use shopfloor_hal::sim::SimController;
use shopfloor_orchestrator::{create_connector, FileConfigSource, OrchestratorConfig, SimSection};
use shopfloor_runtime::events::BroadcastSink;
use shopfloor_runtime::service::ShopfloorService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

fn usage() -> ! {
    eprintln!(
        "Usage: shopfloor <config.toml>\n\
         \n\
         Examples:\n\
           cargo run -p shopfloor_orchestrator --bin shopfloor -- config/shopfloor_sim.toml\n\
           cargo run -p shopfloor_orchestrator --bin shopfloor -- config/shopfloor_modbus_tcp.toml\n\
         \n\
         Events are printed as JSON lines. Ctrl-C disconnects and exits.\n\
         Log level follows RUST_LOG (default: info)."
    );
    std::process::exit(2)
}

/// Raise the simulated counter by `step` every `every_ms`.
fn spawn_ramp(sim: SimController, ramp: &SimSection, data_type: DataType) {
    let address = ramp.counter_address;
    let step = i64::from(ramp.step);
    let every = Duration::from_millis(ramp.every_ms.max(1));
    tokio::spawn(async move {
        let mut value: i64 = 0;
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            value += step;
            let Some(words) = data_type.encode(value) else {
                log::warn!("sim counter overflowed {data_type:?}, restarting at 0");
                value = 0;
                continue;
            };
            for (offset, word) in (0u16..).zip(words) {
                sim.set_holding(address.wrapping_add(offset), word);
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| usage());
    let config = OrchestratorConfig::from_file(&config_path)?;
    let (connector, sim) = create_connector(&config)?;

    if let (Some(sim), Some(ramp)) = (sim, config.sim.as_ref()) {
        let data_type = config
            .registers
            .iter()
            .find(|r| r.address == ramp.counter_address)
            .map(|r| r.data_type)
            .unwrap_or_default();
        spawn_ramp(sim, ramp, data_type);
    }

    let sink = Arc::new(BroadcastSink::new(1024));
    let mut events = sink.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => log::error!("failed to encode event: {e}"),
                },
                Err(RecvError::Lagged(n)) => log::warn!("event printer lagged, {n} events lost"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let service = ShopfloorService::new(
        connector,
        Arc::new(FileConfigSource::new(&config_path)),
        Arc::new(config.seeded_store()),
        sink,
        config.service_settings(),
    );
    service.start().await?;

    if let Some(order_id) = config.accounting.start_order {
        match service.start_order(order_id) {
            Ok(order) => log::info!("order {} ({}) is active", order.id, order.code),
            Err(e) => log::error!("cannot start order {order_id}: {e}"),
        }
    }

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    service.shutdown().await;
    Ok(())
}
