//! Ops backing the script-facing bindings.
//!
//! Scripts only ever hand numeric ids across the boundary: timer handles and
//! worker ids. Callbacks and `Worker` objects stay in the script-side
//! registries of `bootstrap.js`, host-side state stays in [`HostState`].
//!
//! Ops never throw. Every op answers with an [`OpReply`] and the bindings
//! turn an `err` reply into a thrown `TypeError` (validation) or `Error`
//! carrying `kind`.

use crate::runtime::error::ContextError;
use crate::runtime::runner::{ContextCore, HostState};
use crate::runtime::source_path::resolve_current_script;
use crate::runtime::timers::{TimerCallback, TimerHandle};
use crate::runtime::worker::{self, WorkerId, WorkerOptions};
use deno_core::{op2, OpState};
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Largest integer a script number represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

deno_core::extension!(
    jsevent_host,
    ops = [
        op_ctx_timer_schedule,
        op_ctx_timer_clear,
        op_ctx_spawn_worker,
        op_ctx_post_to_worker,
        op_ctx_post_to_parent,
        op_ctx_worker_terminate,
        op_ctx_script_path,
        op_ctx_log,
    ],
);

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub(crate) enum OpReply<T> {
    Ok { value: T },
    Err { kind: &'static str, message: String },
}

impl<T> From<Result<T, ContextError>> for OpReply<T> {
    fn from(result: Result<T, ContextError>) -> Self {
        match result {
            Ok(value) => OpReply::Ok { value },
            Err(err) => OpReply::Err {
                kind: err.kind(),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ScheduleRequest {
    delay_ms: f64,
    repeat: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TimerRequest {
    handle: f64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SpawnRequest {
    location: String,
    #[serde(rename = "type", default)]
    script_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WorkerRequest {
    worker: f64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WorkerPostRequest {
    worker: f64,
    data: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ParentPostRequest {
    data: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FramesRequest {
    frames: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LogRequest {
    level: String,
    message: String,
}

fn host(state: &OpState) -> Rc<HostState> {
    state.borrow::<Rc<HostState>>().clone()
}

/// Convert a script delay in milliseconds. Negative delays mean "now".
pub(crate) fn delay_from_js(delay_ms: f64) -> Result<Duration, ContextError> {
    if !delay_ms.is_finite() {
        return Err(ContextError::validation(format!(
            "delay must be a finite number, got {}",
            delay_ms
        )));
    }
    Duration::try_from_secs_f64(delay_ms.max(0.0) / 1000.0)
        .map_err(|err| ContextError::validation(format!("delay out of range: {}", err)))
}

/// Convert a script-side id back to its integer form.
pub(crate) fn id_from_js(value: f64, what: &str) -> Result<u64, ContextError> {
    if value.is_finite() && value >= 1.0 && value.fract() == 0.0 && value <= MAX_SAFE_INTEGER {
        Ok(value as u64)
    } else {
        Err(ContextError::validation(format!("invalid {} {}", what, value)))
    }
}

#[op2]
#[serde]
fn op_ctx_timer_schedule(
    state: &mut OpState,
    #[serde] request: ScheduleRequest,
) -> OpReply<f64> {
    let host = host(state);
    schedule_script_timer(&host, request)
        .map(|handle| handle.as_u64() as f64)
        .into()
}

fn schedule_script_timer(
    host: &HostState,
    request: ScheduleRequest,
) -> Result<TimerHandle, ContextError> {
    let delay = delay_from_js(request.delay_ms)?;
    let callback: TimerCallback = Box::new(|core, handle| core.engine().fire_timer(handle));

    let mut timers = host.timers.borrow_mut();
    let handle = if request.repeat {
        timers.set_interval(Instant::now(), delay, callback)
    } else {
        timers.set_timeout(Instant::now(), delay, callback)
    };
    Ok(handle)
}

#[op2]
#[serde]
fn op_ctx_timer_clear(state: &mut OpState, #[serde] request: TimerRequest) -> OpReply<()> {
    let host = host(state);
    id_from_js(request.handle, "timer handle")
        .and_then(|raw| host.timers.borrow_mut().clear(TimerHandle::from_raw(raw)))
        .into()
}

#[op2]
#[serde]
fn op_ctx_spawn_worker(state: &mut OpState, #[serde] request: SpawnRequest) -> OpReply<f64> {
    let host = host(state);
    let options = WorkerOptions::from_type(request.script_type.as_deref());

    let id = WorkerId::next();
    let on_message = Box::new(move |core: &mut ContextCore, data: String| {
        core.engine().deliver_to_worker(id, &data)
    });

    // Start failures are logged on the worker thread.
    worker::spawn_worker(&host, id, &request.location, options, on_message)
        .map(|_| id.as_u64() as f64)
        .into()
}

#[op2]
#[serde]
fn op_ctx_post_to_worker(
    state: &mut OpState,
    #[serde] request: WorkerPostRequest,
) -> OpReply<()> {
    let host = host(state);
    let result = id_from_js(request.worker, "worker id").and_then(|raw| {
        let id = WorkerId::from_raw(raw);
        let worker = host
            .workers
            .borrow()
            .get(&id)
            .cloned()
            .ok_or_else(|| ContextError::validation(format!("unknown worker {}", id)))?;
        worker.post_message(request.data)
    });
    result.into()
}

#[op2]
#[serde]
fn op_ctx_post_to_parent(
    state: &mut OpState,
    #[serde] request: ParentPostRequest,
) -> OpReply<()> {
    let host = host(state);
    let link = host.parent.borrow().clone();
    match link {
        Some(link) => link.post(request.data).into(),
        None => Err(ContextError::validation(
            "postMessage to a parent is only available inside a worker",
        ))
        .into(),
    }
}

#[op2]
#[serde]
fn op_ctx_worker_terminate(state: &mut OpState, #[serde] request: WorkerRequest) -> OpReply<()> {
    let host = host(state);
    id_from_js(request.worker, "worker id")
        .and_then(|raw| worker::terminate_worker(&host, WorkerId::from_raw(raw)))
        .into()
}

#[op2]
#[serde]
fn op_ctx_script_path(#[serde] request: FramesRequest) -> OpReply<String> {
    resolve_current_script(&request.frames)
        .map(|path| path.to_string_lossy().into_owned())
        .into()
}

#[op2]
fn op_ctx_log(state: &mut OpState, #[serde] request: LogRequest) {
    let context = host(state).context.id();
    let message = request.message;
    match request.level.as_str() {
        "error" => {
            tracing::error!(target: "jsevent::console", context = %context, "{}", message)
        }
        "warn" => {
            tracing::warn!(target: "jsevent::console", context = %context, "{}", message)
        }
        "debug" | "trace" => {
            tracing::debug!(target: "jsevent::console", context = %context, "{}", message)
        }
        _ => tracing::info!(target: "jsevent::console", context = %context, "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_from_js() {
        assert_eq!(delay_from_js(10.0).unwrap(), Duration::from_millis(10));
        assert_eq!(delay_from_js(-5.0).unwrap(), Duration::ZERO);
        assert_eq!(delay_from_js(0.5).unwrap(), Duration::from_micros(500));
        assert_eq!(delay_from_js(f64::NAN).unwrap_err().kind(), "validation");
        assert_eq!(delay_from_js(f64::INFINITY).unwrap_err().kind(), "validation");
    }

    #[test]
    fn test_id_from_js() {
        assert_eq!(id_from_js(3.0, "timer handle").unwrap(), 3);
        assert!(id_from_js(0.0, "timer handle").is_err());
        assert!(id_from_js(1.5, "timer handle").is_err());
        assert!(id_from_js(-1.0, "worker id").is_err());
        assert!(id_from_js(f64::NAN, "worker id").is_err());
        assert!(id_from_js(1e300, "worker id").is_err());
    }

    #[test]
    fn test_spawn_request_type() {
        let module: SpawnRequest =
            serde_json::from_value(serde_json::json!({ "location": "w.js", "type": "module" }))
                .unwrap();
        assert_eq!(
            WorkerOptions::from_type(module.script_type.as_deref()),
            WorkerOptions::module()
        );

        let classic: SpawnRequest =
            serde_json::from_value(serde_json::json!({ "location": "w.js", "type": null }))
                .unwrap();
        assert_eq!(classic.script_type, None);

        let bare: SpawnRequest =
            serde_json::from_value(serde_json::json!({ "location": "w.js" })).unwrap();
        assert_eq!(bare.location, "w.js");
        assert_eq!(
            WorkerOptions::from_type(bare.script_type.as_deref()),
            WorkerOptions::classic()
        );
    }

    #[test]
    fn test_op_reply_shape() {
        let ok: OpReply<f64> = Ok(7.0).into();
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({ "status": "ok", "value": 7.0 })
        );

        let err: OpReply<()> = Err(ContextError::validation("bad handle")).into();
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            serde_json::json!({
                "status": "err",
                "kind": "validation",
                "message": "invalid argument: bad handle"
            })
        );
    }
}
