#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use jobcast::api::{self, AppState, RouterConfig};
use jobcast::config::JobConfig;
use jobcast::job::JobRunner;
use jobcast::session::SessionRegistry;
use jobcast::shutdown::ShutdownCoordinator;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEADLINE: Duration = Duration::from_secs(10);

/// Write a POSIX shell job script into `dir`. The job runs with `dir` as
/// its working directory, so relative marker files land there too.
pub fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("job.sh");
    std::fs::write(&path, body).unwrap();
    path
}

/// Shell snippet that blocks until `name` exists in the job directory.
pub fn wait_for_file(name: &str) -> String {
    format!("while [ ! -f {name} ]; do sleep 0.05; done\n")
}

/// Create a marker file the job is waiting on.
pub fn touch(dir: &Path, name: &str) {
    std::fs::write(dir.join(name), b"").unwrap();
}

/// Block until the job has created `name`.
pub async fn wait_until_exists(dir: &Path, name: &str) {
    let path = dir.join(name);
    tokio::time::timeout(DEADLINE, async {
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job never reached the expected point");
}

/// Job config running `script` with `sh`, no interpreter probe.
pub fn sh_job(script: PathBuf) -> JobConfig {
    JobConfig {
        interpreters: vec!["sh".into()],
        interpreter_probe: vec![],
        scripts: vec![script],
        ..JobConfig::default()
    }
}

pub fn create_test_state(job: JobConfig) -> AppState {
    AppState {
        sessions: SessionRegistry::new(),
        runner: JobRunner::new(job),
        shutdown: ShutdownCoordinator::new(),
    }
}

/// Serve the full router on an ephemeral loopback port.
pub async fn start_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(
        state,
        RouterConfig {
            bind: addr,
            ..RouterConfig::default()
        },
    );
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

pub fn analysis_body() -> serde_json::Value {
    serde_json::json!({
        "company_name": "Test Co",
        "stock_code": "000001.SZ",
        "market": "SZ",
    })
}

/// `POST /api/analyze` and return the new session id.
pub async fn create_session(addr: SocketAddr) -> String {
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/analyze"))
        .json(&analysis_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json: serde_json::Value = response.json().await.unwrap();
    json["session_id"].as_str().unwrap().to_string()
}

pub async fn get_session(addr: SocketAddr, id: &str) -> serde_json::Value {
    reqwest::get(format!("http://{addr}/api/session/{id}"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

/// Poll until the session leaves `running`, returning the final snapshot.
pub async fn wait_for_finish(addr: SocketAddr, id: &str) -> serde_json::Value {
    tokio::time::timeout(DEADLINE, async {
        loop {
            let snapshot = get_session(addr, id).await;
            if snapshot["status"] != "running" {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session never finished")
}

pub async fn connect_ws(addr: SocketAddr, id: &str) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{addr}/ws/{id}")).await.unwrap();
    ws
}

/// Everything a subscriber saw until the server closed the socket.
pub struct Observed {
    pub events: Vec<serde_json::Value>,
    pub close: Option<CloseFrame>,
}

impl Observed {
    /// Events other than `status`, which is transient and not replayed.
    pub fn durable(&self) -> Vec<serde_json::Value> {
        self.events
            .iter()
            .filter(|e| e["type"] != "status")
            .cloned()
            .collect()
    }

    pub fn close_code(&self) -> Option<u16> {
        self.close.as_ref().map(|frame| u16::from(frame.code))
    }
}

/// Read JSON events until the server closes the connection.
pub async fn read_until_close(ws: &mut WsStream) -> Observed {
    let mut events = Vec::new();
    let close = tokio::time::timeout(DEADLINE, async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    events.push(serde_json::from_str(&text).expect("invalid JSON"))
                }
                Ok(Message::Close(frame)) => return frame,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    })
    .await
    .expect("timeout waiting for the server to close the socket");
    Observed { events, close }
}

pub fn output(line: &str) -> serde_json::Value {
    serde_json::json!({ "type": "output", "data": line })
}

pub fn completed(result: &str) -> serde_json::Value {
    serde_json::json!({ "type": "completed", "result": result })
}
