use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{env, net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use pcraft::banner;
use pcraft::cli;
use pcraft::engine;
use pcraft::library::MacroKind;
use pcraft::logging;
use pcraft::scheduler::{
    ExecutionState, InvocationStatus, MacroControl, RunReport, Scheduler, TransitionError,
};

use tokio::sync::Mutex;

/* -------------------------- App state -------------------------- */

struct AppState {
    scheduler: Scheduler,
    /// Optional API key for requests (PCRAFT_API_KEY).
    api_key: Option<String>,
    /// The macro started last, running or not.
    current: Mutex<Option<MacroControl>>,
    /// Outcome of the last finished run.
    last: Arc<Mutex<Option<LastRun>>>,
}

#[derive(Serialize, Clone)]
struct LastRun {
    ok: bool,
    report: Option<RunReport>,
    error: Option<String>,
}

fn api_key_matches(headers: &HeaderMap, expected: &str) -> bool {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if value.trim() == expected {
            return true;
        }
    }

    if let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let auth = auth.trim();
        if let Some(token) = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
        {
            if token.trim() == expected {
                return true;
            }
        }
    }

    false
}

impl AppState {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        self.api_key
            .as_deref()
            .map_or(true, |expected| api_key_matches(headers, expected))
    }

    async fn live_control(&self) -> Option<MacroControl> {
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|c| c.state() != ExecutionState::Stopped)
            .cloned()
    }
}

/* -------------------------- Request/Response ------------------- */

#[derive(Deserialize, Debug)]
struct RunReq {
    name: String,
    #[serde(default)]
    loops: Option<u32>,
    /// Run as a crafting loop; `loops` is then the craft count.
    #[serde(default)]
    craft_loop: bool,
}

#[derive(Deserialize, Debug, Default)]
struct AtLoopReq {
    #[serde(default)]
    at_loop: bool,
}

#[derive(Serialize)]
struct ControlResp {
    ok: bool,
    state: Option<ExecutionState>,
    message: String,
}

#[derive(Serialize)]
struct StatusResp {
    ok: bool,
    running: bool,
    macro_name: Option<String>,
    state: Option<ExecutionState>,
    invocations: Vec<InvocationStatus>,
    last: Option<LastRun>,
}

/* WebUI may send 'code' or 'content'. */
#[derive(Deserialize, Debug)]
struct CheckReq {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    content: Option<String>,
    /// "macro" (default) or "script".
    #[serde(default)]
    kind: Option<String>,
}

#[derive(Serialize)]
struct CheckResp {
    ok: bool,
    output: String,
}

type Reply = (StatusCode, Json<ControlResp>);

fn reply(status: StatusCode, ok: bool, state: Option<ExecutionState>, message: impl Into<String>) -> Reply {
    (
        status,
        Json(ControlResp {
            ok,
            state,
            message: message.into(),
        }),
    )
}

fn unauthorized() -> Reply {
    reply(
        StatusCode::UNAUTHORIZED,
        false,
        None,
        "ERROR: missing or invalid API key",
    )
}

fn transition_reply(result: Result<ExecutionState, TransitionError>) -> Reply {
    match result {
        Ok(state) => reply(StatusCode::OK, true, Some(state), state.as_str()),
        Err(e) => reply(StatusCode::CONFLICT, false, Some(e.state), format!("ERROR: {e}")),
    }
}

/* -------------------------- Server main ------------------------ */

#[tokio::main]
async fn main() {
    banner::print_server_banner();
    logging::init_tracing();

    // Optional panic hook: more visible logs in journald.
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    let config_path = env::var("PCRAFT_CONFIG")
        .ok()
        .map(|s| PathBuf::from(s.trim()))
        .filter(|p| !p.as_os_str().is_empty());
    let scheduler = match cli::scheduler_from_env(config_path.as_deref(), true) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ Startup failed: {e:#}");
            std::process::exit(1);
        }
    };

    let api_key = env::var("PCRAFT_API_KEY")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let state = Arc::new(AppState {
        scheduler,
        api_key,
        current: Mutex::new(None),
        last: Arc::new(Mutex::new(None)),
    });

    let api = Router::new()
        .route("/run", post(api_run))
        .route("/pause", post(api_pause))
        .route("/resume", post(api_resume))
        .route("/stop", post(api_stop))
        .route("/step", post(api_step))
        .route("/status", get(api_status))
        .route("/check", post(api_check))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Default: 127.0.0.1:8082.
    let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8082);

    let addr: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("❌ Invalid HOST/PORT {host}:{port}: {e}");
            std::process::exit(1);
        }
    };
    println!("✅ PCRAFT API listening on http://{addr}");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("❌ Bind failed for address {addr}: {e}");
            eprintln!(
                "   Hint: is the port already in use? e.g. `ss -tulpn | grep :{}`",
                port
            );
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("❌ Server error: {e}");
        std::process::exit(1);
    }
}

/* -------------------------- Handlers --------------------------- */

async fn api_run(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RunReq>,
) -> impl IntoResponse {
    if !s.authorized(&headers) {
        return unauthorized();
    }

    let mut current = s.current.lock().await;
    if let Some(control) = current
        .as_ref()
        .filter(|c| c.state() != ExecutionState::Stopped)
    {
        return reply(
            StatusCode::CONFLICT,
            false,
            Some(control.state()),
            format!("ERROR: {} is still running", control.name()),
        );
    }

    let started = if req.craft_loop {
        s.scheduler.start_craft_loop(req.name.trim(), req.loops)
    } else {
        s.scheduler.start(req.name.trim(), req.loops)
    };
    let handle = match started {
        Ok(h) => h,
        Err(e) => {
            return reply(StatusCode::BAD_REQUEST, false, None, format!("ERROR: {e}"));
        }
    };
    let control = handle.control().clone();
    let state = control.state();
    *current = Some(control);

    let last = Arc::clone(&s.last);
    *last.lock().await = None;
    tokio::spawn(async move {
        let outcome = match handle.join().await {
            Ok(report) => LastRun {
                ok: true,
                report: Some(report),
                error: None,
            },
            Err(e) => LastRun {
                ok: false,
                report: None,
                error: Some(e.to_string()),
            },
        };
        *last.lock().await = Some(outcome);
    });

    reply(
        StatusCode::OK,
        true,
        Some(state),
        format!("running {}", req.name.trim()),
    )
}

async fn api_pause(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<AtLoopReq>>,
) -> impl IntoResponse {
    if !s.authorized(&headers) {
        return unauthorized();
    }
    let Some(control) = s.live_control().await else {
        return reply(StatusCode::CONFLICT, false, None, "ERROR: no macro is running");
    };
    let Json(req) = body.unwrap_or_default();
    transition_reply(if req.at_loop {
        control.pause_at_loop()
    } else {
        control.pause()
    })
}

async fn api_resume(State(s): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if !s.authorized(&headers) {
        return unauthorized();
    }
    let Some(control) = s.live_control().await else {
        return reply(StatusCode::CONFLICT, false, None, "ERROR: no macro is running");
    };
    transition_reply(control.resume())
}

async fn api_stop(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<AtLoopReq>>,
) -> impl IntoResponse {
    if !s.authorized(&headers) {
        return unauthorized();
    }
    let Some(control) = s.live_control().await else {
        return reply(StatusCode::CONFLICT, false, None, "ERROR: no macro is running");
    };
    let Json(req) = body.unwrap_or_default();
    transition_reply(if req.at_loop {
        control.stop_at_loop()
    } else {
        control.stop()
    })
}

async fn api_step(State(s): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if !s.authorized(&headers) {
        return unauthorized();
    }
    let Some(control) = s.live_control().await else {
        return reply(StatusCode::CONFLICT, false, None, "ERROR: no macro is running");
    };
    transition_reply(control.step())
}

async fn api_status(State(s): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if !s.authorized(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(StatusResp {
                ok: false,
                running: false,
                macro_name: None,
                state: None,
                invocations: Vec::new(),
                last: None,
            }),
        );
    }

    let control = s.current.lock().await.clone();
    let last = s.last.lock().await.clone();
    let resp = match control {
        Some(c) => StatusResp {
            ok: true,
            running: c.state() != ExecutionState::Stopped,
            macro_name: Some(c.name().to_string()),
            state: Some(c.state()),
            invocations: c.invocations(),
            last,
        },
        None => StatusResp {
            ok: true,
            running: false,
            macro_name: None,
            state: None,
            invocations: Vec::new(),
            last,
        },
    };
    (StatusCode::OK, Json(resp))
}

async fn api_check(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CheckReq>,
) -> impl IntoResponse {
    if !s.authorized(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(CheckResp {
                ok: false,
                output: "ERROR: missing or invalid API key".into(),
            }),
        );
    }

    // Pick code (code > content > empty).
    let code = req.code.or(req.content).unwrap_or_default();
    if code.trim().is_empty() {
        return (
            StatusCode::OK,
            Json(CheckResp {
                ok: false,
                output: "⚠️ Empty input".into(),
            }),
        );
    }

    let kind = req
        .kind
        .as_deref()
        .and_then(MacroKind::from_extension)
        .unwrap_or(MacroKind::Native);
    let (ok, output) = match engine::analyze(&code, kind) {
        Ok(out) => (true, out),
        Err(e) => (false, format!("ERROR: {e}")),
    };
    (StatusCode::OK, Json(CheckResp { ok, output }))
}
