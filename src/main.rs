use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use home_energy_controller::bus::BusClient;
use home_energy_controller::config::Config;
use home_energy_controller::coreapi::HttpCoreApi;
use home_energy_controller::dispatcher::Dispatcher;
use home_energy_controller::planner::Planner;
use home_energy_controller::telemetry;
use home_energy_controller::tsdb::{InfluxSink, NullSink, ResultSink};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let cfg = Config::load()?;

    let core = Arc::new(HttpCoreApi::new(&cfg.core_api)?);
    let sink: Arc<dyn ResultSink> = if cfg.tsdb.disabled {
        Arc::new(NullSink)
    } else {
        Arc::new(InfluxSink::new(&cfg.tsdb))
    };

    let (bus, mut requests) = BusClient::connect(&cfg.bus);
    let bus = Arc::new(bus);

    let planner = Arc::new(Planner::new(core.clone(), sink, cfg.clone()));
    let mut dispatcher = Dispatcher::new(core, bus, planner, cfg.clone());

    info!(
        core_api = %cfg.core_api.base_url,
        bus = %format!("{}:{}", cfg.bus.host, cfg.bus.port),
        topic = %cfg.bus.request_topic,
        "home energy controller started"
    );

    let shutdown = telemetry::shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(request) => dispatcher.handle(request).await,
                None => {
                    warn!("bus request channel closed");
                    break;
                }
            },
            _ = &mut shutdown => break,
        }
    }

    dispatcher.shutdown().await;
    warn!("shutdown complete");
    Ok(())
}
