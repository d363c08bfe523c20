//! 接入桥进程入口：加载配置、等待数据库、启动 Coordinator 与状态服务。

use domain::{Backoff, BackoffPolicy};
use ems_bridge::{BridgeDeps, BridgeSettings, Coordinator, StatusState, router};
use ems_config::AppConfig;
use ems_ingest::MqttConnector;
use ems_storage::{PgBridgeConfigStore, PgPool, PgReadingStore, connect_pool};
use ems_telemetry::{TelemetryMetrics, init_tracing};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 从环境变量加载运行配置
    let config = AppConfig::from_env()?;
    // 初始化结构化日志
    init_tracing();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!(target: "ems.bridge", "shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // 数据库未就绪时等待重试，不退出
    let Some(timeseries_pool) = wait_for_database(
        "timeseries",
        &config.timeseries_database_url,
        config.storage_timeout,
        shutdown_rx.clone(),
    )
    .await
    else {
        return Ok(());
    };
    let Some(config_pool) = wait_for_database(
        "config",
        &config.config_database_url,
        config.storage_timeout,
        shutdown_rx.clone(),
    )
    .await
    else {
        return Ok(());
    };

    let metrics = Arc::new(TelemetryMetrics::new());
    let deps = BridgeDeps {
        readings: Arc::new(PgReadingStore::new(timeseries_pool)),
        config_store: Arc::new(PgBridgeConfigStore::new(config_pool)),
        connector: Arc::new(MqttConnector::new(
            config.mqtt_keepalive,
            config.mqtt_connect_timeout,
        )),
    };
    let coordinator = Coordinator::new(
        BridgeSettings::from_app_config(&config),
        deps,
        metrics.clone(),
    );

    let status_server = match config.status_addr.as_deref() {
        Some(addr) => {
            let app = router(StatusState {
                metrics,
                status: coordinator.status_receiver(),
            });
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(target: "ems.status", addr = %addr, "status_server_listening");
            let mut server_shutdown = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                    let _ = server_shutdown.wait_for(|stopped| *stopped).await;
                });
                if let Err(err) = serve.await {
                    warn!(target: "ems.status", error = %err, "status_server_failed");
                }
            }))
        }
        None => None,
    };

    let result = coordinator.run(shutdown_rx).await;
    if let Some(server) = status_server {
        if result.is_err() {
            // 任务异常退出时不会收到关停信号
            server.abort();
        }
        let _ = server.await;
    }
    result?;
    Ok(())
}

/// 等待 SIGINT / SIGTERM。
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!(target: "ems.bridge", error = %err, "sigterm_handler_unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// 连接数据库直到成功；收到关停信号返回 `None`。
async fn wait_for_database(
    name: &'static str,
    database_url: &str,
    acquire_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Option<PgPool> {
    let mut backoff = Backoff::new(BackoffPolicy::new(
        Duration::from_secs(1),
        Duration::from_secs(30),
    ));
    loop {
        if *shutdown.borrow() {
            return None;
        }
        match connect_pool(database_url, acquire_timeout).await {
            Ok(pool) => {
                info!(target: "ems.bridge", database = name, "database_connected");
                return Some(pool);
            }
            Err(err) => {
                let delay = backoff.record_failure(Instant::now());
                warn!(
                    target: "ems.bridge",
                    database = name,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "database_unavailable"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.wait_for(|stopped| *stopped) => return None,
                }
            }
        }
    }
}
