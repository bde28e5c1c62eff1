use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use webpilot::AgentEvent;
use webpilot::error::LoopDetected;
use webpilot::orchestrator::{Decision, Intervention};

/// A task submitted from the page.
#[derive(Debug, Deserialize)]
pub struct TaskRequest {
    pub command: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Deserialize)]
struct InterventionPayload {
    action: String,
}

#[derive(Clone)]
struct AppState {
    cmd_tx: mpsc::Sender<TaskRequest>,
    event_tx: broadcast::Sender<AgentEvent>,
    decision_tx: mpsc::Sender<Decision>,
    current: Arc<Mutex<CancellationToken>>,
}

/// Handles the agent loop uses to talk to the page.
pub struct Ui {
    pub events: broadcast::Sender<AgentEvent>,
    pub decisions: Arc<tokio::sync::Mutex<mpsc::Receiver<Decision>>>,
    current: Arc<Mutex<CancellationToken>>,
}

impl Ui {
    /// Fresh token for the next task; `/cancel` trips whichever is current.
    pub fn begin_task(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut current) = self.current.lock() {
            *current = token.clone();
        }
        token
    }
}

/// Asks the person at the page whether to resume or abort.
pub struct WebIntervention {
    decisions: Arc<tokio::sync::Mutex<mpsc::Receiver<Decision>>>,
}

impl WebIntervention {
    pub fn new(decisions: Arc<tokio::sync::Mutex<mpsc::Receiver<Decision>>>) -> Self {
        Self { decisions }
    }

    async fn ask(&self) -> Decision {
        let mut decisions = self.decisions.lock().await;
        // Clicks made while nothing was paused are stale.
        while decisions.try_recv().is_ok() {}
        decisions.recv().await.unwrap_or(Decision::Abort)
    }
}

#[async_trait]
impl Intervention for WebIntervention {
    async fn on_loop(&self, detected: &LoopDetected) -> Decision {
        tracing::info!(%detected, "waiting for the operator");
        self.ask().await
    }

    async fn on_captcha(&self, url: &str) -> Decision {
        tracing::info!(url, "waiting for the operator to solve the captcha");
        self.ask().await
    }
}

fn to_sse_event(event: &AgentEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.name()).data(data)
}

/// Serve the UI on the first free port in 3000..3010.
pub async fn start_server() -> Result<(mpsc::Receiver<TaskRequest>, Ui)> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<TaskRequest>(1);
    let (event_tx, _) = broadcast::channel::<AgentEvent>(64);
    let (decision_tx, decision_rx) = mpsc::channel::<Decision>(4);
    let current = Arc::new(Mutex::new(CancellationToken::new()));

    let state = Arc::new(AppState {
        cmd_tx,
        event_tx: event_tx.clone(),
        decision_tx,
        current: Arc::clone(&current),
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/intervene", post(intervene_handler))
        .route("/cancel", post(cancel_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state);

    let mut bound = None;
    for port in 3000..3010 {
        if let Ok(listener) = tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            bound = Some((listener, port));
            break;
        }
    }
    let Some((listener, port)) = bound else {
        bail!("could not bind to any port 3000-3009; stop the old agent first");
    };

    tracing::info!("web UI running at http://localhost:{port}");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "web UI server stopped");
        }
    });

    Ok((
        cmd_rx,
        Ui {
            events: event_tx,
            decisions: Arc::new(tokio::sync::Mutex::new(decision_rx)),
            current,
        },
    ))
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TaskRequest>,
) -> StatusCode {
    tracing::info!(command = %payload.command, "task submitted");
    match state.cmd_tx.try_send(payload) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::CONFLICT,
    }
}

async fn intervene_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<InterventionPayload>,
) -> StatusCode {
    let decision = match payload.action.as_str() {
        "resume" => Decision::Resume,
        "abort" => Decision::Abort,
        _ => return StatusCode::BAD_REQUEST,
    };
    let _ = state.decision_tx.send(decision).await;
    StatusCode::OK
}

async fn cancel_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    if let Ok(current) = state.current.lock() {
        current.cancel();
    }
    let _ = state.event_tx.send(AgentEvent::StepError {
        message: "cancel requested".into(),
    });
    StatusCode::OK
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.event_tx.subscribe())
        .filter_map(|event| event.ok().map(|e| Ok::<_, Infallible>(to_sse_event(&e))));
    Sse::new(stream)
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>webpilot</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body { background: #0b0d12; color: #dde1e8; font-family: system-ui, sans-serif;
         height: 100vh; display: flex; flex-direction: column; }
  header { padding: 18px 28px; border-bottom: 1px solid #1c2030; display: flex; gap: 12px; align-items: center; }
  header h1 { font-size: 18px; font-weight: 600; }
  .dot { width: 8px; height: 8px; border-radius: 50%; background: #22c55e; }
  .dot.busy { background: #f59e0b; }
  .dot.paused { background: #ef4444; }
  main { flex: 1; display: flex; flex-direction: column; max-width: 860px; width: 100%;
         margin: 0 auto; padding: 20px 28px; gap: 12px; overflow: hidden; }
  #log { flex: 1; overflow-y: auto; display: flex; flex-direction: column; gap: 6px; }
  .entry { padding: 8px 12px; border-radius: 6px; font-size: 14px; line-height: 1.45; border-left: 3px solid #3b82f6; background: #12151d; }
  .entry.user { border-color: #6366f1; }
  .entry.step { font-family: ui-monospace, monospace; font-size: 13px; }
  .entry.step.failed { border-color: #f97316; }
  .entry .num { color: #818cf8; font-weight: 700; margin-right: 8px; }
  .entry .warn { color: #fbbf24; }
  .entry.error { border-color: #ef4444; color: #fca5a5; }
  .entry.done { border-color: #22c55e; color: #86efac; }
  .entry.paused { border-color: #ef4444; color: #fde68a; }
  .row { display: flex; gap: 8px; }
  input { flex: 1; background: #12151d; border: 1px solid #262b3a; border-radius: 6px;
          padding: 10px 14px; color: #fff; font-size: 15px; outline: none; }
  input#url { flex: 0 0 260px; }
  button { background: #6366f1; color: #fff; border: none; border-radius: 6px; padding: 10px 18px;
           font-size: 14px; font-weight: 600; cursor: pointer; }
  button.secondary { background: #262b3a; }
  button:disabled { background: #1f2330; color: #666; cursor: not-allowed; }
  #controls { display: none; }
</style>
</head>
<body>
  <header><div class="dot" id="dot"></div><h1>webpilot</h1></header>
  <main>
    <div id="log"></div>
    <div class="row" id="controls">
      <button id="resume">Resume</button>
      <button id="abort" class="secondary">Abort</button>
    </div>
    <div class="row">
      <input type="text" id="cmd" placeholder="Tell the agent what to do..." autofocus />
      <input type="text" id="url" placeholder="Start URL (optional)" />
      <button id="send">Send</button>
      <button id="cancel" class="secondary" disabled>Cancel</button>
    </div>
  </main>
<script>
  const $ = id => document.getElementById(id);
  const esc = s => String(s).replace(/&/g, '&amp;').replace(/</g, '&lt;');
  let busy = false;

  function add(cls, html) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.innerHTML = html;
    $('log').appendChild(div);
    $('log').scrollTop = $('log').scrollHeight;
  }

  function setState(state) {
    busy = state !== 'idle';
    $('cmd').disabled = busy;
    $('url').disabled = busy;
    $('send').disabled = busy;
    $('cancel').disabled = !busy;
    $('controls').style.display = state === 'paused' ? 'flex' : 'none';
    $('dot').className = 'dot' + (state === 'idle' ? '' : ' ' + state);
    if (!busy) $('cmd').focus();
  }

  const post = (path, body) => fetch(path, {
    method: 'POST', headers: {'Content-Type': 'application/json'}, body: JSON.stringify(body || {})
  });

  async function send() {
    const command = $('cmd').value.trim();
    const url = $('url').value.trim();
    if (!command || busy) return;
    $('cmd').value = '';
    add('user', '<strong>You:</strong> ' + esc(command) + (url ? ' <em>@ ' + esc(url) + '</em>' : ''));
    setState('busy');
    const res = await post('/command', {command, url: url || null});
    if (!res.ok) { add('error', 'Agent is busy.'); }
  }

  $('send').onclick = send;
  $('cmd').addEventListener('keydown', e => { if (e.key === 'Enter') send(); });
  $('cancel').onclick = () => post('/cancel');
  $('resume').onclick = () => { post('/intervene', {action: 'resume'}); setState('busy'); };
  $('abort').onclick = () => post('/intervene', {action: 'abort'});

  const es = new EventSource('/events');
  const on = (name, fn) => es.addEventListener(name, e => fn(JSON.parse(e.data)));

  on('step', d => {
    let html = '<span class="num">Step ' + d.number + '</span>' + esc(d.tool) + ': ' + esc(d.description)
      + '<br>' + (d.success ? '&#10003; ' : '&#10007; ') + esc(d.message);
    if (d.warning) html += '<br><span class="warn">' + esc(d.warning) + '</span>';
    add('step' + (d.success ? '' : ' failed'), html);
  });
  on('step_error', d => add('error', '<strong>Error:</strong> ' + esc(d.message)));
  on('paused', d => { add('paused', '<strong>Paused:</strong> ' + esc(d.reason)); setState('paused'); });
  on('resumed', () => setState('busy'));
  on('task_complete', d => { add('done', '<strong>Done</strong> in ' + d.steps + ' steps: ' + esc(d.summary)); });
  on('task_error', d => { add('error', '<strong>Task failed:</strong> ' + esc(d.message)); });
  on('ready', () => setState('idle'));

  add('done', 'Agent ready. Type a command to begin.');
</script>
</body>
</html>
"##;
