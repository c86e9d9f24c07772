//! Stub KaTeX worker for integration tests.
//!
//! The supervisor launches a bash script in place of `node katex-server.js`.
//! The script records the `--socket`/`--port` arguments it was given and
//! then sleeps; the test process itself binds that address and answers
//! frames, so each scenario can script the worker's behaviour.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use katex_worker::ipc::write_frame;
use katex_worker::KatexSettings;
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;

/// What the stub does with one request.
pub enum Reply {
    /// Answer with this JSON body.
    Json(Value),
    /// Answer with this JSON body, one byte per write.
    Chunked(Value),
    /// Never answer.
    Stall,
}

type Handler = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

/// Where the worker was told to listen.
enum Listen {
    Unix(PathBuf),
    Tcp(u16),
}

pub struct StubWorker {
    scratch: TempDir,
    script: PathBuf,
    args_file: PathBuf,
    requests: Arc<Mutex<Vec<Value>>>,
    spawns: Arc<AtomicUsize>,
}

impl StubWorker {
    /// A worker process that exits promptly on SIGTERM.
    pub fn new() -> Self {
        Self::with_body("exec sleep 60")
    }

    /// A worker process that ignores SIGTERM and must be force-killed.
    pub fn ignoring_sigterm() -> Self {
        Self::with_body("trap '' TERM\nwhile true; do sleep 0.05; done")
    }

    fn with_body(body: &str) -> Self {
        let scratch = tempfile::tempdir().expect("scratch dir");
        let args_file = scratch.path().join("worker_args");
        let script = scratch.path().join("stub_worker.sh");

        let content = format!(
            "#!/bin/bash\necho \"$@\" > \"{args}.tmp\" && mv \"{args}.tmp\" \"{args}\"\n{body}\n",
            args = args_file.display(),
            body = body
        );
        std::fs::write(&script, content).expect("write stub script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod stub script");

        Self {
            scratch,
            script,
            args_file,
            requests: Arc::new(Mutex::new(Vec::new())),
            spawns: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    /// Settings that launch this stub through bash.
    pub fn settings(&self) -> KatexSettings {
        KatexSettings {
            nodejs_binary: Some("bash".to_string()),
            worker_script: Some(self.script.clone()),
            startup_timeout: 5.0,
            render_timeout: Some(2.0),
            ..Default::default()
        }
    }

    /// Every request body received so far, in order.
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// How many worker processes have announced themselves.
    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Answer every worker the supervisor starts using `handler`.
    pub fn serve<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(&Value) -> Reply + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let args_file = self.args_file.clone();
        let requests = Arc::clone(&self.requests);
        let spawns = Arc::clone(&self.spawns);

        tokio::spawn(async move {
            loop {
                let listen = wait_for_args(&args_file).await;
                spawns.fetch_add(1, Ordering::SeqCst);

                let handler = Arc::clone(&handler);
                let requests = Arc::clone(&requests);
                match listen {
                    Listen::Unix(path) => {
                        let listener = UnixListener::bind(&path).expect("bind stub socket");
                        tokio::spawn(async move {
                            while let Ok((stream, _)) = listener.accept().await {
                                tokio::spawn(serve_connection(
                                    stream,
                                    Arc::clone(&handler),
                                    Arc::clone(&requests),
                                ));
                            }
                        });
                    }
                    Listen::Tcp(port) => {
                        let listener = TcpListener::bind(("127.0.0.1", port))
                            .await
                            .expect("bind stub port");
                        tokio::spawn(async move {
                            while let Ok((stream, _)) = listener.accept().await {
                                tokio::spawn(serve_connection(
                                    stream,
                                    Arc::clone(&handler),
                                    Arc::clone(&requests),
                                ));
                            }
                        });
                    }
                }
            }
        })
    }
}

/// Wait for the next worker to record its arguments, then consume them.
async fn wait_for_args(args_file: &Path) -> Listen {
    loop {
        if let Ok(args) = std::fs::read_to_string(args_file) {
            let _ = std::fs::remove_file(args_file);
            return parse_listen(&args);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn parse_listen(args: &str) -> Listen {
    let tokens: Vec<&str> = args.split_whitespace().collect();
    match tokens.as_slice() {
        ["--socket", path, ..] => Listen::Unix(PathBuf::from(path)),
        ["--port", port, ..] => Listen::Tcp(port.parse().expect("numeric port")),
        other => panic!("Unexpected worker arguments: {:?}", other),
    }
}

async fn serve_connection<S>(mut stream: S, handler: Handler, requests: Arc<Mutex<Vec<Value>>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let Ok(len) = stream.read_i32_le().await else {
            return;
        };
        let mut body = vec![0u8; len as usize];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }
        let request: Value = serde_json::from_slice(&body).expect("request is JSON");
        requests.lock().expect("requests lock").push(request.clone());

        match handler(&request) {
            Reply::Json(reply) => {
                let bytes = serde_json::to_vec(&reply).expect("encode reply");
                if write_frame(&mut stream, &bytes).await.is_err() {
                    return;
                }
            }
            Reply::Chunked(reply) => {
                let bytes = serde_json::to_vec(&reply).expect("encode reply");
                let mut frame = (bytes.len() as i32).to_le_bytes().to_vec();
                frame.extend_from_slice(&bytes);
                for byte in frame {
                    if stream.write_all(&[byte]).await.is_err() {
                        return;
                    }
                    let _ = stream.flush().await;
                }
            }
            Reply::Stall => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                return;
            }
        }
    }
}

/// `<span class="katex">LATEX</span>`, wrapped for display mode.
pub fn katex_markup(request: &Value) -> String {
    let latex = request["latex"].as_str().unwrap_or_default();
    let inline = format!("<span class=\"katex\">{}</span>", latex);
    if request["katex_options"]["displayMode"] == Value::Bool(true) {
        format!("<span class=\"katex-display\">{}</span>", inline)
    } else {
        inline
    }
}

/// Whether `pid` is still a live process.
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Poll until `pid` is gone; a killed child lingers until it is reaped.
pub async fn exits_within(pid: u32, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    !process_alive(pid)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
