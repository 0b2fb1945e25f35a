use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    control::{Collaborators, ControlHandle, ControlLoop, Devices, SystemClock},
    dispatch::CommandDispatcher,
    hardware::Hardware,
    history::{JsonlHistory, TrendPredictor},
    http::{self, HttpState},
    settings::Settings,
    store::ConfigStore,
    uplink::{mqtt::MqttTransport, transport::CommandHandler, UplinkManager},
};

/// Budget for flushing the outbound queue once the process is stopping.
const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::from_env();
    let store = ConfigStore::new(&settings.data_dir);
    let config = store
        .load_or_init(settings.regenerate_config)
        .await
        .with_context(|| {
            format!(
                "failed to load {} (start with --regen-config to replace it with defaults)",
                store.config_path().display()
            )
        })?;
    info!(
        config = %store.config_path().display(),
        poll_secs = config.poll_interval_seconds,
        timezone = %config.timezone,
        "configuration loaded"
    );

    let connection = settings.connection(&config.connection);
    let hardware =
        Hardware::from_config(&config.hardware).context("failed to set up hardware")?;

    let transport = Arc::new(MqttTransport::new(&connection, config.is_test_device));
    let uplink = UplinkManager::new(
        transport,
        config.uplink.clone(),
        Duration::from_secs(config.operation_deadline_seconds()),
        hardware.link_led,
    );
    match store.take_outbox().await {
        Ok(messages) => uplink.restore(messages).await,
        Err(err) => warn!("failed to restore undelivered telemetry: {err}"),
    }

    let handle = ControlHandle::new(config, store.clone(), Arc::new(SystemClock));
    let dispatcher = CommandDispatcher::new(handle.clone());
    let commands: Arc<dyn CommandHandler> = Arc::new(dispatcher.clone());
    info!(
        host = %connection.host,
        port = connection.port,
        device_id = %connection.device_id,
        "starting uplink"
    );
    uplink.initialize(commands.clone()).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control = ControlLoop::new(
        handle.clone(),
        Devices {
            sensor: hardware.sensor,
            heater: hardware.heater,
            sensor_reset: hardware.sensor_reset,
        },
        uplink.clone(),
        commands,
        Collaborators {
            history: Arc::new(JsonlHistory::new(&settings.data_dir)),
            predictor: Box::new(TrendPredictor::default()),
        },
    );
    let control_task = tokio::spawn(control.run(shutdown_rx.clone()));

    let http_task = settings.http_port.map(|port| {
        let state = HttpState {
            dispatcher,
            handle: handle.clone(),
        };
        tokio::spawn(http::serve(port, state, shutdown_rx.clone()))
    });

    shutdown_signal().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    let stopping = Stopping {
        control_task,
        handle,
        uplink,
        store,
    };
    stopping.finish(SHUTDOWN_DRAIN_DEADLINE).await?;

    if let Some(task) = http_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("command server stopped with error: {err:#}"),
            Err(err) => warn!("command server task failed: {err}"),
        }
    }

    info!("stopped");
    Ok(())
}

/// What is left to wind down once the shutdown signal has been sent.
struct Stopping {
    control_task: JoinHandle<()>,
    handle: ControlHandle,
    uplink: UplinkManager,
    store: ConfigStore,
}

impl Stopping {
    /// Waits for the control loop (which leaves the heater off), persists the
    /// configuration, gives the uplink one bounded drain and saves whatever is
    /// still undelivered. A failed persist is returned after the rest has run.
    async fn finish(self, drain_deadline: Duration) -> anyhow::Result<()> {
        if let Err(err) = self.control_task.await {
            error!("control loop task failed: {err}");
        }
        let persisted = self
            .handle
            .persist()
            .await
            .context("failed to persist configuration at shutdown");

        let undelivered = self.uplink.shutdown(drain_deadline).await;
        if !undelivered.is_empty() {
            info!(count = undelivered.len(), "saving undelivered telemetry");
        }
        if let Err(err) = self.store.save_outbox(&undelivered).await {
            warn!("failed to save undelivered telemetry: {err}");
        }
        persisted
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use thermolink_common::{
        CommandReply, Configuration, ConnectionState, Schedule, SensorReading, Temperature,
        UplinkConfig,
    };

    use super::*;
    use crate::{
        hardware::{
            fake::{FakePin, ScriptedSensor},
            Heater,
        },
        uplink::transport::fake::FakeTransport,
    };

    struct NoCommands;

    #[async_trait]
    impl CommandHandler for NoCommands {
        async fn handle(&self, _name: &str, _payload: &[u8]) -> CommandReply {
            CommandReply::error(404, "none")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_loop_persists_then_saves_outbox() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let config = Configuration {
            schedule: Schedule::uniform(Temperature::from_degrees(20)),
            ..Configuration::default()
        };
        let handle = ControlHandle::new(config, store.clone(), Arc::new(SystemClock));

        let transport = Arc::new(FakeTransport::default());
        transport.fail_sends_where(|_| true);
        let uplink = UplinkManager::new(
            transport.clone(),
            UplinkConfig::default(),
            Duration::from_secs(270),
            Box::new(FakePin::default()),
        );
        uplink.initialize(Arc::new(NoCommands)).await;

        let relay = FakePin::default();
        let sensor = ScriptedSensor::new(
            [],
            SensorReading::new(Some(Temperature::from_centi(1900)), Some(45.0), true),
        );
        let control = ControlLoop::new(
            handle.clone(),
            Devices {
                sensor: sensor.shared(),
                heater: Heater::new(Box::new(relay.clone()), Box::new(FakePin::default())),
                sensor_reset: Box::new(FakePin::default()),
            },
            uplink.clone(),
            Arc::new(NoCommands),
            Collaborators {
                history: Arc::new(JsonlHistory::new(dir.path())),
                predictor: Box::new(TrendPredictor::default()),
            },
        );
        let (stop, stopped) = watch::channel(false);
        let control_task = tokio::spawn(control.run(stopped));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(relay.state());
        assert!(handle.config().await.heater_on_since.is_some());
        assert_eq!(uplink.queued().await, 1);

        stop.send(true).unwrap();
        let stopping = Stopping {
            control_task,
            handle: handle.clone(),
            uplink: uplink.clone(),
            store: store.clone(),
        };
        stopping.finish(Duration::from_secs(5)).await.unwrap();

        assert!(!relay.state());
        let persisted = store.load().await.unwrap().unwrap();
        assert_eq!(persisted.heater_on_since, None);
        assert_eq!(uplink.state().await, ConnectionState::Disconnected);

        let outbox = store.take_outbox().await.unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].temperature, Some(Temperature::from_centi(1900)));
        assert!(outbox[0].is_heater_on);
        assert!(transport.sent().is_empty());
    }
}
