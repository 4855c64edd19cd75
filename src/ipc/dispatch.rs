use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::pipeline::Pipeline;
use crate::keypoint::TrackedRegion;
use crate::worker::StopToken;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Request {
    Status,
    Regions,
    Region { name: String },
    Camera { index: u32 },
    Capture { state: CaptureCommand },
    Shutdown,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CaptureCommand {
    Start,
    Stop,
}

fn ok(data: impl Serialize) -> Value {
    match serde_json::to_value(data) {
        Ok(v) => json!({"ok": true, "data": v}),
        Err(e) => fail(e),
    }
}

fn fail(e: impl std::fmt::Display) -> Value {
    json!({"ok": false, "error": e.to_string()})
}

/// One request line in, one response value out.
pub fn handle_line(line: &str, pipeline: &Pipeline, stop: &StopToken) -> Value {
    match serde_json::from_str::<Request>(line) {
        Ok(req) => dispatch(req, pipeline, stop),
        Err(e) => fail(format!("bad request: {e}")),
    }
}

pub fn dispatch(req: Request, pipeline: &Pipeline, stop: &StopToken) -> Value {
    match req {
        Request::Status => ok(pipeline.status()),
        Request::Regions => ok(json!({
            "regions": TrackedRegion::ALL.map(TrackedRegion::name),
            "active": pipeline.region(),
        })),
        Request::Region { name } => {
            let region = if name.eq_ignore_ascii_case("none") {
                None
            } else {
                match name.parse::<TrackedRegion>() {
                    Ok(r) => Some(r),
                    Err(e) => return fail(e),
                }
            };
            pipeline.select_region(region);
            ok(json!({"region": region}))
        }
        Request::Camera { index } => {
            pipeline.select_camera(index);
            ok(json!({"camera": index}))
        }
        Request::Capture { state } => {
            pipeline.set_capture(state == CaptureCommand::Start);
            ok(json!({"capture": pipeline.status().capture}))
        }
        Request::Shutdown => {
            stop.request();
            ok("shutting down")
        }
    }
}
