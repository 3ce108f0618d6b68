use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use egress_warden::ipc::{AddRuleRequest, Request, Response, SOCKET_ENV_VAR, client_roundtrip, socket_name_with_override};
use interprocess::local_socket::{Stream, prelude::*};

#[derive(Debug, Parser)]
#[command(name = "wardenctl")]
struct Cli {
    #[arg(long)]
    socket: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    Add {
        app: String,
        target: String,
    },
    Remove {
        rule_id: i64,
    },
    List,
    Stats,
    Tail {
        #[arg(long, default_value_t = 20)]
        count: u32,
    },
    Status,
    Reload,
    Stop,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let name = resolve_ipc_socket(cli.socket.as_deref())?;
    let mut conn = Stream::connect(name).context("failed to connect to wardend")?;

    let req = match cli.cmd {
        Cmd::Add { app, target } => Request::AddRule(AddRuleRequest { app, target }),
        Cmd::Remove { rule_id } => Request::RemoveRule { rule_id },
        Cmd::List => Request::ListActive,
        Cmd::Stats => Request::Stats,
        Cmd::Tail { count } => Request::TailAttempts { count },
        Cmd::Status => Request::Status,
        Cmd::Reload => Request::Reload,
        Cmd::Stop => Request::Stop,
    };

    let resp = client_roundtrip(&mut conn, &req)?;
    let is_err = matches!(resp, Response::Err(_));

    match cli.format {
        OutputFormat::Text => print_text(resp)?,
        OutputFormat::Json => print_json(&resp)?,
    }

    if is_err {
        std::process::exit(2);
    }
    Ok(())
}

fn resolve_ipc_socket(cli_socket: Option<&str>) -> Result<interprocess::local_socket::Name<'static>> {
    let env_socket = std::env::var(SOCKET_ENV_VAR).ok();
    let override_socket = cli_socket.or(env_socket.as_deref());
    let (name, _fs_path) = socket_name_with_override(override_socket)?;
    Ok(name)
}

fn print_json(resp: &Response) -> Result<()> {
    let s = serde_json::to_string_pretty(resp).context("failed to serialize response as JSON")?;
    println!("{s}");
    Ok(())
}

fn print_text(resp: Response) -> Result<()> {
    match resp {
        Response::OkAddRule { rule_id } => println!("ok: rule {rule_id} added"),
        Response::OkRemoveRule { status } => println!("ok: remove -> {status:?}"),
        Response::OkListActive { rules } => {
            for r in rules {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    r.id,
                    r.app,
                    r.target,
                    r.target_kind,
                    r.resolved_ips.join(",")
                );
            }
        }
        Response::OkStats { apps } => {
            for a in apps {
                println!(
                    "{}\tconnections={}\tblocked={}\tdestinations={}",
                    a.app, a.connections, a.blocked_attempts, a.unique_destinations
                );
            }
        }
        Response::OkTailAttempts { attempts } => {
            for a in attempts {
                println!("{}\t{}\t{}\t{}\t{}\t{}", a.id, a.timestamp, a.app, a.source, a.target, a.detail);
            }
        }
        Response::OkStatus(s) => {
            println!("uptime_ms: {}", s.uptime_ms);
            println!("config_path: {}", s.config_path);
            println!("socket: {}", s.socket);
            println!("active_rule_count: {}", s.active_rule_count);
            println!("running: {}", s.running);
        }
        Response::OkReload => println!("ok: reloaded"),
        Response::OkStop => println!("ok: stopping"),
        Response::Err(e) => anyhow::bail!("error: {}", e.message),
    }
    Ok(())
}
