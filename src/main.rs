use appvisor::config::{self, DEFAULT_CONFIG_YAML};
use appvisor::{logging, AppvisorError, StartOutcome, StopOutcome, Supervisor, SupervisorConfig};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "appvisor", version, about = "Background app supervisor")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start an app in the background
    Start { name: String },
    /// Stop an app and every process it spawned
    Stop { name: String },
    /// Show whether an app is running and its CPU/memory usage
    Status { name: String },
    /// List apps found in the app directory
    List,
    /// Host CPU and memory usage
    System,
    Logs {
        name: String,
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
    Doctor,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

fn main() -> Result<(), AppvisorError> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let ctx = Context {
        config_path: config::resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Start { name } => handle_start(&ctx, &name),
        Commands::Stop { name } => handle_stop(&ctx, &name),
        Commands::Status { name } => handle_status(&ctx, &name),
        Commands::List => handle_list(&ctx),
        Commands::System => handle_system(&ctx),
        Commands::Logs { name, lines } => handle_logs(&ctx, &name, lines),
        Commands::Doctor => handle_doctor(&ctx),
        Commands::Config { command } => handle_config(&ctx, command),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn load_supervisor(ctx: &Context) -> Result<Supervisor, AppvisorError> {
    let cfg = config::load_or_default(&ctx.config_path)?;
    Ok(Supervisor::new(SupervisorConfig::from_config(&cfg)?))
}

fn handle_start(ctx: &Context, name: &str) -> Result<(), AppvisorError> {
    let supervisor = load_supervisor(ctx)?;
    let payload = match supervisor.start(name)? {
        StartOutcome::Started { pid } => json!({
            "message": format!("{name} started."),
            "pid": pid,
            "already_running": false,
        }),
        StartOutcome::AlreadyRunning { pid } => json!({
            "message": format!("{name} is already running."),
            "pid": pid,
            "already_running": true,
        }),
    };
    output_message(ctx, payload)
}

fn handle_stop(ctx: &Context, name: &str) -> Result<(), AppvisorError> {
    let supervisor = load_supervisor(ctx)?;
    let payload = match supervisor.stop(name)? {
        StopOutcome::Stopped { pid, confirmed } => json!({
            "message": format!("{name} stopped."),
            "pid": pid,
            "confirmed": confirmed,
        }),
        StopOutcome::NotRunning => json!({
            "message": format!("{name} is not running."),
            "pid": null,
        }),
    };
    output_message(ctx, payload)
}

fn handle_status(ctx: &Context, name: &str) -> Result<(), AppvisorError> {
    let supervisor = load_supervisor(ctx)?;
    let status = supervisor.status(name)?;
    output(ctx, serde_json::to_value(status)?)
}

fn handle_list(ctx: &Context) -> Result<(), AppvisorError> {
    let supervisor = load_supervisor(ctx)?;
    let apps = supervisor.list_known()?;
    if ctx.json {
        return output(ctx, json!({ "apps": apps }));
    }
    if apps.is_empty() {
        println!("No apps installed.");
    }
    for app in apps {
        println!("{app}");
    }
    Ok(())
}

fn handle_system(ctx: &Context) -> Result<(), AppvisorError> {
    let supervisor = load_supervisor(ctx)?;
    output(ctx, serde_json::to_value(supervisor.system_usage())?)
}

fn handle_logs(ctx: &Context, name: &str, lines: usize) -> Result<(), AppvisorError> {
    let supervisor = load_supervisor(ctx)?;
    let tail = supervisor.log_tail(name, lines)?;
    if ctx.json {
        let path = supervisor.log_path(&appvisor::AppName::parse(name)?);
        return output(ctx, json!({ "path": path, "lines": tail }));
    }
    for line in tail {
        println!("{line}");
    }
    Ok(())
}

fn handle_doctor(ctx: &Context) -> Result<(), AppvisorError> {
    let cfg = config::load_or_default(&ctx.config_path)?;
    let resolved = SupervisorConfig::from_config(&cfg)?;
    let mut checks = BTreeMap::new();

    let interpreter_ok = which::which(&resolved.runtime.interpreter).is_ok();
    checks.insert("interpreter".to_string(), interpreter_ok);
    checks.insert("app_dir_exists".to_string(), resolved.app_dir.is_dir());
    let pid_ok = dir_writable(&resolved.pid_dir);
    checks.insert("pid_dir_writable".to_string(), pid_ok);
    let log_ok = dir_writable(&resolved.log_dir);
    checks.insert("log_dir_writable".to_string(), log_ok);

    let ok = interpreter_ok && pid_ok && log_ok;
    let error = if ok {
        None
    } else if !interpreter_ok {
        Some(format!(
            "interpreter {} was not found on PATH",
            resolved.runtime.interpreter
        ))
    } else if !pid_ok {
        Some("pid dir is not writable".to_string())
    } else {
        Some("log dir is not writable".to_string())
    };

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks })),
            error,
        };
        return print_json(&payload);
    }

    for (check, passed) in &checks {
        println!("{check}: {}", if *passed { "ok" } else { "FAILED" });
    }
    match error {
        Some(message) => Err(AppvisorError::Config(message)),
        None => Ok(()),
    }
}

fn dir_writable(path: &Path) -> bool {
    fs::create_dir_all(path)
        .and_then(|_| {
            let probe = path.join(".appvisor_write_test");
            fs::write(&probe, b"ok")?;
            fs::remove_file(&probe)
        })
        .is_ok()
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), AppvisorError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            config::ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let _cfg = config::read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
    }
}

fn output_message(ctx: &Context, payload: serde_json::Value) -> Result<(), AppvisorError> {
    if !ctx.json {
        if let Some(message) = payload.get("message").and_then(|m| m.as_str()) {
            println!("{message}");
            return Ok(());
        }
    }
    output(ctx, payload)
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), AppvisorError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), AppvisorError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
