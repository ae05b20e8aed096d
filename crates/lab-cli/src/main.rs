use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use lab_core::AttrValue;
use lab_runner::paths::CONFIG_FILE;
use lab_runner::{
    read_run_record, resolve_identity, ConfigLayers, ConfigLevel, GitCli, LabHome,
    ProjectIdentity, Repo, RunLifecycle, RunRegistry, Vcs,
};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Exported to `exec` children so they can write next to `info.json`.
const RUN_DIR_ENV: &str = "LAB_RUN_DIR";

#[derive(Parser)]
#[command(name = "lab", version, about = "Experiment run bookkeeping")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Init {
        #[arg(long)]
        json: bool,
    },
    ConfigGet {
        key: String,
        #[arg(long)]
        json: bool,
    },
    ConfigSet {
        key: String,
        value: String,
        #[arg(long, default_value = "user")]
        level: String,
        #[arg(long)]
        json: bool,
    },
    ConfigList {
        #[arg(long)]
        json: bool,
    },
    Exec {
        name: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        json: bool,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    Projects {
        #[arg(long)]
        json: bool,
    },
    Find {
        test_name: String,
        #[arg(long)]
        json: bool,
    },
    Show {
        run_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Outcome { payload, exit_code }) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

struct Outcome {
    payload: Option<Value>,
    exit_code: i32,
}

impl Outcome {
    fn done() -> Self {
        Self {
            payload: None,
            exit_code: 0,
        }
    }

    fn json(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            exit_code: 0,
        }
    }
}

/// Identity, config and registry of the repository the CLI runs in.
struct Workspace {
    home: LabHome,
    repo: Repo,
    config: ConfigLayers,
    registry: RunRegistry,
    identity: ProjectIdentity,
}

impl Workspace {
    fn open() -> Result<Self> {
        let home = LabHome::discover()?;
        let repo = GitCli::from_current_dir()?.load_repo()?;
        let mut config = ConfigLayers::new(&home).with_repository(&repo.working_dir);
        let registry = RunRegistry::from_config(home.clone(), &mut config)?;
        let identity = resolve_identity(&mut config, &repo);
        let project_dir = registry.resolve_project_dir(&identity.key())?;
        config.attach(ConfigLevel::Experiment, project_dir.join(CONFIG_FILE));
        debug!(project = %identity.key(), repo = %repo.working_dir.display(), "workspace opened");
        Ok(Self {
            home,
            repo,
            config,
            registry,
            identity,
        })
    }

    fn diagnostics(&mut self) -> Vec<String> {
        self.config
            .take_diagnostics()
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}

fn run_command(command: Commands) -> Result<Outcome> {
    match command {
        Commands::Init { json } => {
            let mut ws = Workspace::open()?;
            let key = ws.identity.key();
            ws.registry
                .register_project(&key, &ws.repo.working_dir, ws.registry.experiments_root())?;
            let project_dir = ws.registry.resolve_project_dir(&key)?;
            if json {
                return Ok(Outcome::json(json!({
                    "ok": true,
                    "command": "init",
                    "project_key": key,
                    "project_dir": project_dir.display().to_string(),
                    "repo": ws.repo.working_dir.display().to_string(),
                    "home": ws.home.root().display().to_string(),
                    "diagnostics": ws.diagnostics(),
                })));
            }
            println!("project: {}", key);
            println!("project_dir: {}", project_dir.display());
            println!("repo: {}", ws.repo.working_dir.display());
        }
        Commands::ConfigGet { key, json } => {
            let mut ws = Workspace::open()?;
            let level = ws.config.defining_level(&key);
            let value = ws
                .config
                .lookup(&key)
                .and_then(AttrValue::to_json)
                .ok_or_else(|| anyhow!("config key '{}' is not set", key))?;
            if json {
                return Ok(Outcome::json(json!({
                    "ok": true,
                    "command": "config-get",
                    "key": key,
                    "value": value,
                    "level": level.map(|l| l.as_str()),
                })));
            }
            println!("{}", render_value(&value));
        }
        Commands::ConfigSet {
            key,
            value,
            level,
            json,
        } => {
            let level: ConfigLevel = level.parse()?;
            let parsed = parse_config_value(&value);
            let mut ws = Workspace::open()?;
            ws.config
                .add_value(&key, AttrValue::from(parsed.clone()), level)?;
            let path = ws
                .config
                .path(level)
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            if json {
                return Ok(Outcome::json(json!({
                    "ok": true,
                    "command": "config-set",
                    "key": key,
                    "value": parsed,
                    "level": level.as_str(),
                    "path": path,
                })));
            }
            println!("{} = {} ({})", key, render_value(&parsed), level);
        }
        Commands::ConfigList { json } => {
            let mut ws = Workspace::open()?;
            let mut layers = Map::new();
            for level in [ConfigLevel::User, ConfigLevel::Experiment, ConfigLevel::Repository] {
                if let Some(items) = ws.config.layer_items(level) {
                    layers.insert(level.as_str().to_string(), items.to_json_value());
                }
            }
            let merged = ws.config.merged();
            if json {
                return Ok(Outcome::json(json!({
                    "ok": true,
                    "command": "config-list",
                    "merged": merged.to_json_value(),
                    "layers": layers,
                    "diagnostics": ws.diagnostics(),
                })));
            }
            for (key, value) in merged.walk() {
                if let Some(value) = value.to_json() {
                    println!("{} = {}", key, render_value(&value));
                }
            }
            for diagnostic in ws.diagnostics() {
                eprintln!("warning: {}", diagnostic);
            }
        }
        Commands::Exec {
            name,
            tags,
            json,
            command,
        } => return exec(&name, &tags, &command, json),
        Commands::Projects { json } => {
            let home = LabHome::discover()?;
            let mut config = ConfigLayers::new(&home);
            let registry = RunRegistry::from_config(home, &mut config)?;
            let projects = registry.projects()?;
            if json {
                return Ok(Outcome::json(json!({
                    "ok": true,
                    "command": "projects",
                    "projects": serde_json::to_value(&projects)?,
                })));
            }
            for (key, entry) in &projects {
                println!("{}\t{}\t{} runs", key, entry.repopath, entry.exps.len());
            }
        }
        Commands::Find { test_name, json } => {
            let home = LabHome::discover()?;
            let mut config = ConfigLayers::new(&home);
            let registry = RunRegistry::from_config(home, &mut config)?;
            let found = registry.find_runs(&test_name)?;
            if json {
                let dirs: Vec<String> = found.iter().map(|p| p.display().to_string()).collect();
                return Ok(Outcome::json(json!({
                    "ok": true,
                    "command": "find",
                    "test_name": test_name,
                    "runs": dirs,
                })));
            }
            if found.is_empty() {
                eprintln!("no run matches '{}'", test_name);
            }
            for dir in found {
                println!("{}", dir.display());
            }
        }
        Commands::Show { run_dir } => {
            let record = read_run_record(&run_dir)
                .with_context(|| format!("reading run record in {}", run_dir.display()))?;
            return Ok(Outcome::json(serde_json::to_value(&record)?));
        }
    }
    Ok(Outcome::done())
}

/// Runs `command` as a child inside a run; its exit status becomes the run's
/// end code and the CLI's own exit code.
fn exec(name: &str, tags: &[String], command: &[String], json: bool) -> Result<Outcome> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("exec needs a command after '--'"))?;
    let mut run = RunLifecycle::builder(name).start()?;
    if let Some(err) = run.take_index_error() {
        eprintln!("warning: run index not updated: {}", err);
    }
    for tag in tags {
        run.add_tag(tag, Vec::<String>::new())?;
    }
    run.add_plugin("exec", Some(json!({ "command": command })))?;
    let run_dir = run.run_dir()?;
    let test_name = run.test_name()?;

    let code = run.scope(|run| -> Result<i32> {
        let status = Command::new(program)
            .args(args)
            .env(RUN_DIR_ENV, &run_dir)
            .status()
            .with_context(|| format!("failed to spawn '{}'", program))?;
        let code = status.code().unwrap_or(1);
        run.end(code, Map::new())?;
        Ok(code)
    })?;

    if json {
        return Ok(Outcome {
            payload: Some(json!({
                "ok": code == 0,
                "command": "exec",
                "test_name": test_name,
                "run_dir": run_dir.display().to_string(),
                "end_code": code,
            })),
            exit_code: code,
        });
    }
    eprintln!("run_dir: {}", run_dir.display());
    Ok(Outcome {
        payload: None,
        exit_code: code,
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Init { json }
        | Commands::ConfigGet { json, .. }
        | Commands::ConfigSet { json, .. }
        | Commands::ConfigList { json }
        | Commands::Exec { json, .. }
        | Commands::Projects { json }
        | Commands::Find { json, .. } => *json,
        Commands::Show { .. } => true,
    }
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_config_value(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
