//! Command-line interface and REPL
//!
//! A line-oriented control surface: every command is a thin call on the
//! [`EngineHandle`]. The editor blocks, so the REPL runs on a blocking
//! thread and drives the handle through the runtime handle.

use anyhow::{anyhow, bail, Result};
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::engine::{ConnectionStatus, EngineHandle};
use crate::state::telemetry::sparkline;
use crate::state::{check_indices, check_scene, Field, FieldKey, OUTPUT_COUNT};

const HELP: &str = "\
Commands:
  set [scene] <output> <field> <value>   edit a field (scene defaults to active)
  scene [n]                              show or select the active scene
  show [scene] <output>                  list an output's fields
  fields                                 list field names and wire ids
  status [json]                          connection and delivery state
  aux                                    list auxiliary inputs
  aux toggle <port>                      enable/disable forwarding
  spark [output]                         telemetry sparklines
  reset                                  reboot the device into its bootloader
  rescan                                 look for ports again
  help                                   this text
  quit                                   exit";

/// A parsed REPL line
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Set {
        scene: Option<u8>,
        output: u8,
        field: Field,
        value: f64,
    },
    Scene(Option<u8>),
    Show {
        scene: Option<u8>,
        output: u8,
    },
    Fields,
    Status {
        json: bool,
    },
    Aux,
    AuxToggle(String),
    Spark(Option<usize>),
    Reset,
    Rescan,
    Help,
    Quit,
}

fn parse_index(token: &str, what: &str) -> Result<i64> {
    token
        .parse::<i64>()
        .map_err(|_| anyhow!("{} must be a number, got '{}'", what, token))
}

fn parse_field(token: &str) -> Result<Field> {
    Field::from_name(token).ok_or_else(|| anyhow!("unknown field '{}' (try 'fields')", token))
}

impl ReplCommand {
    /// Parse one line; `Ok(None)` for a blank line
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, args)) = tokens.split_first() else {
            return Ok(None);
        };

        let cmd = match (verb.to_lowercase().as_str(), args) {
            ("set", [output, field, value]) => ReplCommand::Set {
                scene: None,
                output: check_indices(0, parse_index(output, "output")?)?.1,
                field: parse_field(field)?,
                value: value.parse().map_err(|_| anyhow!("bad value '{}'", value))?,
            },
            ("set", [scene, output, field, value]) => {
                let (scene, output) =
                    check_indices(parse_index(scene, "scene")?, parse_index(output, "output")?)?;
                ReplCommand::Set {
                    scene: Some(scene),
                    output,
                    field: parse_field(field)?,
                    value: value.parse().map_err(|_| anyhow!("bad value '{}'", value))?,
                }
            }
            ("set", _) => bail!("usage: set [scene] <output> <field> <value>"),
            ("scene", []) => ReplCommand::Scene(None),
            ("scene", [n]) => ReplCommand::Scene(Some(check_scene(parse_index(n, "scene")?)?)),
            ("show", [output]) => ReplCommand::Show {
                scene: None,
                output: check_indices(0, parse_index(output, "output")?)?.1,
            },
            ("show", [scene, output]) => {
                let (scene, output) =
                    check_indices(parse_index(scene, "scene")?, parse_index(output, "output")?)?;
                ReplCommand::Show {
                    scene: Some(scene),
                    output,
                }
            }
            ("show", _) => bail!("usage: show [scene] <output>"),
            ("fields", []) => ReplCommand::Fields,
            ("status", []) => ReplCommand::Status { json: false },
            ("status", ["json"]) => ReplCommand::Status { json: true },
            ("aux", []) => ReplCommand::Aux,
            ("aux", ["toggle", port @ ..]) if !port.is_empty() => {
                ReplCommand::AuxToggle(port.join(" "))
            }
            ("spark", []) => ReplCommand::Spark(None),
            ("spark", [n]) => {
                let index = parse_index(n, "output")?;
                ReplCommand::Spark(Some(check_indices(0, index)?.1 as usize))
            }
            ("reset", []) => ReplCommand::Reset,
            ("rescan", []) => ReplCommand::Rescan,
            ("help" | "?", _) => ReplCommand::Help,
            ("quit" | "exit", _) => ReplCommand::Quit,
            _ => bail!("unknown command '{}' (try 'help')", line.trim()),
        };
        Ok(Some(cmd))
    }
}

async fn active_scene(handle: &EngineHandle) -> Result<u8> {
    handle
        .status()
        .await
        .map(|s| s.active_scene)
        .ok_or_else(|| anyhow!("engine is not running"))
}

/// Run one command; returns false when the REPL should exit
pub async fn execute(handle: &EngineHandle, cmd: ReplCommand) -> Result<bool> {
    match cmd {
        ReplCommand::Set {
            scene,
            output,
            field,
            value,
        } => {
            let scene = match scene {
                Some(scene) => scene,
                None => active_scene(handle).await?,
            };
            let key = FieldKey {
                scene,
                output,
                field,
            };
            let changes = handle.set_field(key, value).await?;
            if changes.is_empty() {
                println!("  {}", "unchanged".dimmed());
            }
            for change in changes {
                println!(
                    "  {} {} → {}",
                    change.key.to_string().cyan(),
                    change.old,
                    change.new.to_string().green()
                );
            }
        }
        ReplCommand::Scene(None) => {
            println!("  active scene: {}", active_scene(handle).await?.to_string().green());
        }
        ReplCommand::Scene(Some(scene)) => {
            handle.select_scene(scene).await?;
            println!("  scene {} selected", scene.to_string().green());
        }
        ReplCommand::Show { scene, output } => {
            let scene = match scene {
                Some(scene) => scene,
                None => active_scene(handle).await?,
            };
            let config = handle
                .get_output(scene, output)
                .await
                .ok_or_else(|| anyhow!("no such output"))?;
            println!("{}", format!("Scene {} / output {}", scene, output).bold());
            for (field, value) in config.iter() {
                println!("  {:<18} {}", field.name(), value);
            }
        }
        ReplCommand::Fields => {
            for field in Field::ALL {
                println!("  {:<18} {}", field.name(), field.hash().to_string().dimmed());
            }
        }
        ReplCommand::Status { json } => {
            let status = handle
                .status()
                .await
                .ok_or_else(|| anyhow!("engine is not running"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                let connection = match &status.connection {
                    ConnectionStatus::Connected { .. } => status.connection.to_string().green(),
                    ConnectionStatus::Disconnected => status.connection.to_string().red(),
                };
                println!("  device:       {}", connection);
                println!("  active scene: {}", status.active_scene);
                println!(
                    "  pending:      {} debouncing, {} queued",
                    status.debouncing, status.queued
                );
                let d = status.deliveries;
                println!(
                    "  deliveries:   {} sent, {} retried, {} acknowledged, {} abandoned",
                    d.sent, d.retried, d.acknowledged, d.abandoned
                );
            }
        }
        ReplCommand::Aux => {
            let status = handle
                .status()
                .await
                .ok_or_else(|| anyhow!("engine is not running"))?;
            if status.aux.is_empty() {
                println!("  {}", "no auxiliary inputs".dimmed());
            }
            for (name, state) in status.aux {
                let marker = if state.active { "[ON] ".green() } else { "[OFF]".dimmed() };
                println!(
                    "  {} {} {}",
                    marker,
                    name,
                    state.last_message.unwrap_or_default().dimmed()
                );
            }
        }
        ReplCommand::AuxToggle(port) => match handle.toggle_aux(&port).await {
            Some(active) => println!("  {} forwarding {}", port, if active { "on" } else { "off" }),
            None => bail!("no auxiliary input named '{}'", port),
        },
        ReplCommand::Spark(index) => {
            let indices: Vec<usize> = match index {
                Some(i) => vec![i],
                None => (0..OUTPUT_COUNT).collect(),
            };
            for i in indices {
                let samples = handle.telemetry(i).await;
                let last = samples.last().map(|v| format!("{:.3}", v)).unwrap_or_default();
                println!("  {} {} {}", i, sparkline(&samples).cyan(), last);
            }
        }
        ReplCommand::Reset => {
            handle.reset_device();
            println!("  reset sent");
        }
        ReplCommand::Rescan => {
            handle.rediscover();
            println!("  rescanning ports");
        }
        ReplCommand::Help => println!("{}", HELP),
        ReplCommand::Quit => return Ok(false),
    }
    Ok(true)
}

/// Blocking REPL loop; call from a blocking thread
pub fn run_repl(handle: EngineHandle, runtime: tokio::runtime::Handle) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    println!("{}", "yocto-sync - type 'help' for commands".bold().cyan());

    loop {
        let prompt = if handle.is_connected() {
            "yocto> "
        } else {
            "yocto (offline)> "
        };
        match rl.readline(prompt) {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                match ReplCommand::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(cmd)) => match runtime.block_on(execute(&handle, cmd)) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => println!("  {} {:#}", "error:".red(), e),
                    },
                    Err(e) => println!("  {} {:#}", "error:".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
