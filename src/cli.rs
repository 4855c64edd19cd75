use anyhow::{Result, anyhow};
use pico_args::Arguments;
use std::{env, path::PathBuf, process::Command};

use crate::config::Overrides;
use crate::ipc;
use crate::keypoint::TrackedRegion;

pub fn run() -> Result<()> {
    let mut pargs = Arguments::from_env();

    // No args -> general help
    if env::args().len() == 1 {
        print_help();
        return Ok(());
    }

    if pargs.contains("-h") || pargs.contains("--help") {
        print_help();
        return Ok(());
    }

    let overrides = parse_overrides(&mut pargs)?;

    // First free arg is the subcommand
    let subcmd: Option<String> = pargs.free_from_str().ok();

    match subcmd.as_deref() {
        Some("help") => {
            let topic: Option<String> = pargs.free_from_str().ok();
            if let Some(t) = topic {
                print_subcmd_help(&t);
            } else {
                print_help();
            }
            Ok(())
        }

        Some("run") => ipc::run_daemon(&overrides),

        Some("start") => {
            let exe = env::current_exe()?;
            let child = Command::new(exe)
                .arg("run")
                .args(env::args_os().skip(1).filter(|a| a != "start"))
                .spawn()?;
            println!("posectl: started daemon (pid={})", child.id());
            Ok(())
        }

        Some("stop") => request(serde_json::json!({"op": "shutdown"})),

        Some("status") => request(serde_json::json!({"op": "status"})),

        Some("regions") => request(serde_json::json!({"op": "regions"})),

        Some("region") => {
            let name: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: posectl region <name|none>"))?;
            if name != "none" {
                name.parse::<TrackedRegion>().map_err(|e| anyhow!(e))?;
            }
            request(serde_json::json!({"op": "region", "name": name}))
        }

        Some("camera") => {
            let index: u32 = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: posectl camera <index>"))?;
            request(serde_json::json!({"op": "camera", "index": index}))
        }

        Some("capture") => {
            let state: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: posectl capture <start|stop>"))?;
            if state != "start" && state != "stop" {
                return Err(anyhow!("usage: posectl capture <start|stop>"));
            }
            request(serde_json::json!({"op": "capture", "state": state}))
        }

        Some(other) => {
            eprintln!("unknown subcommand: {other}\n");
            print_help();
            Ok(())
        }

        None => {
            print_help();
            Ok(())
        }
    }
}

fn parse_overrides(pargs: &mut Arguments) -> Result<Overrides> {
    Ok(Overrides {
        config: pargs.opt_value_from_str::<_, PathBuf>("--config")?,
        host: pargs.opt_value_from_str("--host")?,
        port: pargs.opt_value_from_str("--port")?,
        camera: pargs.opt_value_from_str("--camera")?,
        samples: pargs.opt_value_from_str("--samples")?,
        region: pargs.opt_value_from_str("--region")?,
    })
}

fn request(req: serde_json::Value) -> Result<()> {
    let r = ipc::client_request(req)?;
    print_response(&r);
    Ok(())
}

fn print_help() {
    println!(
        r#"posectl: body-pose tracking to linear-axis commands

USAGE:
  posectl help [command]          Show general or command-specific help
  posectl run [options]           Run the daemon in the foreground
  posectl start [options]         Start the daemon in the background
  posectl stop                    Stop the daemon
  posectl status                  Show pipeline state
  posectl regions                 List trackable regions
  posectl region <name|none>      Select the tracked region
  posectl camera <index>          Switch capture device
  posectl capture <start|stop>    Start or stop capture

OPTIONS (run/start):
  --config <path>    Config file (default ~/.config/posectl/config.toml)
  --host <host>      Device host
  --port <port>      Device port
  --camera <index>   Initial capture device
  --samples <k>      Frames per smoothed pose
  --region <name>    Initial tracked region

Logging follows RUST_LOG (default: info).
"#
    );
}

fn print_subcmd_help(cmd: &str) {
    match cmd {
        "run" => println!("usage: posectl run [options]\nRuns capture, inference and the device link until SIGINT/SIGTERM or `posectl stop`."),
        "start" => println!("usage: posectl start [options]\nSpawns `posectl run` in the background."),
        "stop" => println!("usage: posectl stop\nStops the running daemon; queued commands are flushed first."),
        "status" => println!(
            "usage: posectl status\nShows link state, capture state, frame counters, windows and the display snapshot."
        ),
        "regions" => println!("usage: posectl regions\nLists region names and the active one."),
        "region" => println!(
            "usage: posectl region <name|none>\nSelects head, hips, left-hand, right-hand, left-foot or right-foot; `none` pauses output."
        ),
        "camera" => println!("usage: posectl camera <index>\nSwitches the capture device; applied while capture runs."),
        "capture" => println!("usage: posectl capture <start|stop>\nStarts or stops frame capture."),
        _ => {
            eprintln!("unknown command: {cmd}\n");
            print_help();
        }
    }
}

fn print_response(v: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(v).unwrap_or_default());
}
