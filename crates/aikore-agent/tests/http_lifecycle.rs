use std::{sync::Arc, time::Duration};

use aikore_agent::{
    api,
    config::AgentConfig,
    manager::InstanceManager,
    monitor::{KioskLauncher, ProbeOutcome, ReadinessProbe},
    routing::SentinelReload,
    store::JsonFileStore,
};
use aikore_instance::Instance;
use async_trait::async_trait;
use serde_json::Value;

struct AlwaysReady;

#[async_trait]
impl ReadinessProbe for AlwaysReady {
    async fn probe(&self, _port: u16) -> ProbeOutcome {
        ProbeOutcome::Ready
    }
}

struct NoKiosk;

#[async_trait]
impl KioskLauncher for NoKiosk {
    async fn launch(&self, _inst: &Instance, _port: u16, _pgid: i32) -> anyhow::Result<()> {
        Ok(())
    }
}

async fn serve(manager: Arc<InstanceManager>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::router(manager)).await.unwrap();
    });
    format!("http://{addr}")
}

async fn wait_for_status(client: &reqwest::Client, url: &str, want: &str) -> Value {
    for _ in 0..100 {
        let body: Value = client.get(url).send().await.unwrap().json().await.unwrap();
        if body["status"] == want {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("instance never reached {want}");
}

#[tokio::test]
async fn instance_lifecycle_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = AgentConfig::rooted(dir.path());
    cfg.stop_grace = Duration::from_secs(2);
    cfg.monitor.poll_interval = Duration::from_millis(50);
    std::fs::create_dir_all(&cfg.stock_blueprints_dir).unwrap();
    std::fs::write(
        cfg.stock_blueprints_dir.join("echo.sh"),
        "#!/bin/bash\necho \"hello from $INSTANCE_NAME\"\nexec sleep 30\n",
    )
    .unwrap();

    let store = Arc::new(JsonFileStore::new(cfg.records_dir()));
    let inst = Instance::new("Http Test", "echo.sh");
    store.insert(&inst).await.unwrap();

    let cfg = Arc::new(cfg);
    let manager = Arc::new(InstanceManager::new(
        cfg.clone(),
        store,
        Arc::new(SentinelReload::new(&cfg.reload_sentinel)),
        Arc::new(AlwaysReady),
        Arc::new(NoKiosk),
    ));
    let base = serve(manager.clone()).await;
    let client = reqwest::Client::new();
    let inst_url = format!("{base}/api/instances/{}", inst.id);

    let health: Value = client
        .get(format!("{base}/healthz"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let blueprints: Value = client
        .get(format!("{base}/api/blueprints"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(blueprints["blueprints"], serde_json::json!(["echo.sh"]));

    let resp = client.post(format!("{inst_url}/start")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let report: Value = resp.json().await.unwrap();
    assert_eq!(report["public_path"], "/app/http-test/");
    assert_eq!(report["instance"]["status"], "starting");

    let resp = client.post(format!("{inst_url}/start")).send().await.unwrap();
    assert_eq!(resp.status(), 409);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["code"], "already_running");

    let view = wait_for_status(&client, &inst_url, "started").await;
    assert_eq!(view["supervised"], true);
    assert_eq!(view["running"], true);
    assert!(view["pid"].as_u64().is_some());

    let mut found = false;
    for _ in 0..100 {
        let logs: Value = client
            .get(format!("{inst_url}/logs?lines=50"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let lines = logs["lines"].as_array().cloned().unwrap_or_default();
        if lines.iter().any(|l| l == "hello from Http Test") {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(found, "blueprint output never reached the log");

    let resp = client.post(format!("{inst_url}/stop")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let stopped: Value = resp.json().await.unwrap();
    assert_eq!(stopped["status"], "stopped");
    assert!(stopped["pid"].is_null());

    let view: Value = client.get(&inst_url).send().await.unwrap().json().await.unwrap();
    assert_eq!(view["supervised"], false);
    assert!(!cfg.routing_dir.join("http-test.conf").exists());
}

#[tokio::test]
async fn unknown_instance_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(InstanceManager::from_config(AgentConfig::rooted(dir.path())).unwrap());
    let base = serve(manager).await;

    let resp = reqwest::get(format!("{base}/api/instances/missing")).await.unwrap();
    assert_eq!(resp.status(), 404);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["code"], "not_found");
}
