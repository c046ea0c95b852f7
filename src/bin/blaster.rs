//! Sweeps a master server directory for servers running one or more
//! application ids, queries each for info and rules, and writes the results
//! as JSON. The CLI, config handling and JSON formatting here are the
//! external "dumper" consumer described alongside the core engine; the core
//! itself doesn't depend on any of this.
use std::io::Write;
use std::net::SocketAddrV4;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;

use blaster::batch::BatchProcessor;
use blaster::master::{MasterClient, MasterFilter};
use blaster::query::ServerQuerier;
use blaster::types::AppId;

const DEFAULT_MASTER: &str = "hl2master.steampowered.com:27011";

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    List,
    Map,
    Lines,
}

/// Sweep the Valve master server directory for A2S servers and dump info + rules as JSON.
#[derive(Parser, Debug)]
#[command(name = "blaster", version, about)]
struct Args {
    /// Game shorthand (hl1, hl2) — expands to its known app id list.
    #[arg(long)]
    game: Option<String>,

    /// Query a single app id.
    #[arg(long)]
    appid: Option<u32>,

    /// Comma-delimited list of app ids.
    #[arg(long)]
    appids: Option<String>,

    /// Master server host:port.
    #[arg(long, default_value = DEFAULT_MASTER)]
    master: String,

    /// Number of concurrent server queries.
    #[arg(short = 'j', long, default_value_t = 20)]
    jobs: usize,

    /// Per-server query timeout, in seconds.
    #[arg(long, default_value_t = 3)]
    timeout: u64,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::List)]
    format: OutputFormat,

    /// Write output to a file instead of stdout.
    #[arg(long)]
    outfile: Option<String>,

    /// Don't query A2S_RULES.
    #[arg(long)]
    norules: bool,
}

#[derive(Serialize)]
struct ErrorObject {
    ip: String,
    error: String,
}

#[derive(Serialize)]
struct ServerObject {
    ip: String,
    protocol: u8,
    name: String,
    map: String,
    folder: String,
    game: String,
    players: u8,
    max_players: u8,
    bots: u8,
    #[serde(rename = "type")]
    kind: blaster::types::ServerKind,
    os: blaster::types::ServerOs,
    visibility: String,
    vac: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    theship: Option<blaster::types::TheShipInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    appid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    game_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    steamid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    game_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gameid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spectv_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spectv_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#mod: Option<blaster::types::ModInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rules: Option<std::collections::HashMap<String, String>>,
}

/// Shared, lock-protected JSON writer: the batch callback runs concurrently
/// and must serialize its own writes.
struct OutputWriter {
    out: Box<dyn Write + Send>,
    format: OutputFormat,
    count: u64,
}

impl OutputWriter {
    fn write_record(&mut self, key: &str, value: &impl Serialize) {
        let body = serde_json::to_string_pretty(value)
            .expect("serialization of a plain struct cannot fail");
        match self.format {
            OutputFormat::Lines => {
                if self.count != 0 {
                    let _ = writeln!(self.out);
                }
                let _ = write!(self.out, "{body}");
            }
            OutputFormat::List => {
                if self.count != 0 {
                    let _ = writeln!(self.out, ",");
                }
                let _ = write!(self.out, "{body}");
            }
            OutputFormat::Map => {
                if self.count != 0 {
                    let _ = writeln!(self.out, ",");
                }
                let _ = write!(self.out, "\"{key}\": {body}");
            }
        }
        self.count += 1;
    }

    fn open(&mut self) {
        match self.format {
            OutputFormat::List => {
                let _ = writeln!(self.out, "[");
            }
            OutputFormat::Map => {
                let _ = writeln!(self.out, "{{");
            }
            OutputFormat::Lines => {}
        }
    }

    fn close(&mut self) {
        if self.count != 0 {
            let _ = writeln!(self.out);
        }
        match self.format {
            OutputFormat::List => {
                let _ = writeln!(self.out, "]");
            }
            OutputFormat::Map => {
                let _ = writeln!(self.out, "}}");
            }
            OutputFormat::Lines => {}
        }
    }
}

fn resolve_app_ids(args: &Args) -> Result<Vec<AppId>, String> {
    let mut app_ids = Vec::new();

    if let Some(game) = &args.game {
        match game.as_str() {
            "hl1" => app_ids.extend_from_slice(AppId::HL1_APPS),
            "hl2" => app_ids.extend_from_slice(AppId::HL2_APPS),
            other => return Err(format!("unrecognized game: {other}")),
        }
    }

    if let Some(appids) = &args.appids {
        for part in appids.split(',') {
            let id: u32 = part
                .trim()
                .parse()
                .map_err(|_| format!("\"{part}\" is not a valid app id"))?;
            app_ids.push(AppId(id));
        }
    }

    if let Some(appid) = args.appid {
        app_ids.push(AppId(appid));
    }

    if app_ids.is_empty() {
        return Err("at least one --appid, --appids, or --game must be specified".to_string());
    }

    Ok(app_ids)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let app_ids = match resolve_app_ids(&args) {
        Ok(ids) => ids,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let out: Box<dyn Write + Send> = match &args.outfile {
        Some(path) => match std::fs::File::create(path) {
            Ok(f) => Box::new(f),
            Err(e) => {
                eprintln!("could not open {path} for writing: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => Box::new(std::io::stdout()),
    };

    let writer = Arc::new(Mutex::new(OutputWriter {
        out,
        format: args.format,
        count: 0,
    }));
    writer.lock().unwrap().open();

    let mut master = match MasterClient::connect(&args.master).await {
        Ok(m) => m,
        Err(e) => {
            eprintln!("could not connect to master: {e}");
            return ExitCode::FAILURE;
        }
    };
    let mut filters = MasterFilter::new();
    if let Err(e) = filters.add_app_ids(app_ids) {
        eprintln!("could not build filter list: {e}");
        return ExitCode::FAILURE;
    }
    master.set_filters(filters);

    let timeout = Duration::from_secs(args.timeout);
    let norules = args.norules;
    let writer_for_callback = writer.clone();

    let processor = BatchProcessor::new(
        move |addr: SocketAddrV4| {
            let writer = writer_for_callback.clone();
            query_and_emit(addr, timeout, norules, writer)
        },
        args.jobs,
    );

    let result = master
        .query(&mut |batch: &[SocketAddrV4]| {
            block_on_add_batch(&processor, batch.to_vec());
            Ok(())
        })
        .await;

    if let Err(e) = result {
        eprintln!("could not query the master: {e}");
        return ExitCode::FAILURE;
    }

    processor.finish().await;
    writer.lock().unwrap().close();

    ExitCode::SUCCESS
}

/// The master callback is synchronous, mirroring the Go original's blocking
/// unbuffered channel send; bridge it into the async batch processor with a
/// blocking handoff to the current runtime.
fn block_on_add_batch(processor: &BatchProcessor<SocketAddrV4>, batch: Vec<SocketAddrV4>) {
    tokio::task::block_in_place(|| {
        tokio::runtime::Handle::current().block_on(processor.add_batch(batch));
    });
}

async fn query_and_emit(
    addr: SocketAddrV4,
    timeout: Duration,
    norules: bool,
    writer: Arc<Mutex<OutputWriter>>,
) {
    let key = addr.to_string();

    let mut querier = match ServerQuerier::connect(addr, timeout).await {
        Ok(q) => q,
        Err(e) => {
            writer.lock().unwrap().write_record(
                &key,
                &ErrorObject {
                    ip: key.clone(),
                    error: e.to_string(),
                },
            );
            return;
        }
    };

    let info = match querier.query_info().await {
        Ok(info) => info,
        Err(e) => {
            writer.lock().unwrap().write_record(
                &key,
                &ErrorObject {
                    ip: key.clone(),
                    error: e.to_string(),
                },
            );
            return;
        }
    };

    let is_csgo = info
        .ext
        .as_ref()
        .map(|e| e.app_id == AppId::CSGO)
        .unwrap_or(false);
    let rules = if !is_csgo && !norules {
        match querier.query_rules().await {
            Ok(rules) => Some(rules),
            Err(e) => {
                let mut error_map = std::collections::HashMap::new();
                error_map.insert("error".to_string(), e.to_string());
                Some(error_map)
            }
        }
    } else {
        None
    };

    let out = ServerObject {
        ip: key.clone(),
        protocol: info.protocol,
        name: info.name,
        map: info.map_name,
        folder: info.folder,
        game: info.game,
        players: info.players,
        max_players: info.max_players,
        bots: info.bots,
        kind: info.kind,
        os: info.os,
        visibility: if info.visibility == 0 {
            "public"
        } else {
            "private"
        }
        .to_string(),
        vac: info.vac == 1,
        theship: info.the_ship,
        appid: info.ext.as_ref().map(|e| e.app_id.0),
        game_version: info.ext.as_ref().map(|e| e.game_version.clone()),
        port: info.ext.as_ref().and_then(|e| e.port),
        steamid: info
            .ext
            .as_ref()
            .and_then(|e| e.steam_id)
            .map(|id| id.to_string()),
        game_mode: info
            .ext
            .as_ref()
            .and_then(|e| e.game_mode_description.clone()),
        gameid: info
            .ext
            .as_ref()
            .and_then(|e| e.game_id)
            .map(|id| id.to_string()),
        spectv_port: info.spec_tv.as_ref().map(|s| s.port),
        spectv_name: info.spec_tv.as_ref().map(|s| s.name.clone()),
        r#mod: info.r#mod,
        rules,
    };

    writer.lock().unwrap().write_record(&key, &out);
}
