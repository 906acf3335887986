//! Skillbox - Entry Point
//!
//! Commands:
//! - import <file>...            Parse, scan and register skills
//! - execute <skill-id>          Run a skill for a caller
//! - promote / ban <skill-id>    Administrative trust changes
//! - list                        Show registered skills
//! - scan <file>                 Scan content without registering it

use anyhow::{anyhow, bail, Context, Result};
use skillbox::skills::InputBindings;
use skillbox::{
    ClaudeAnalyzer, ClaudeClient, Config, ContainerSandbox, ExecutionResponse, GovernanceLevel, ImportItem,
    ScanCache, SecurityScanner, SkillRegistry, SkillStore, StaticGovernance, TrustState,
};
use std::sync::Arc;
use tracing::{debug, warn, Level};
use tracing_subscriber::FmtSubscriber;

const USAGE: &str = "Usage: skillbox <COMMAND> [ARGS]

Commands:
  import <file>... [--origin <origin>]
  execute <skill-id> --caller <id> [--level <level>] [--input key=value]...
  promote <skill-id> [--actor <name>]
  ban <skill-id> [--actor <name>] [--reason <text>]
  list [--state untrusted|active|banned]
  scan <file>

Environment variables:
  ANTHROPIC_API_KEY          Claude API key for semantic scanning
  SKILLBOX_ANTHROPIC_URL     Messages endpoint override
  SKILLBOX_DB_PATH           Registry database path
  SKILLBOX_RUNTIME           Container runtime (default: docker)
  SKILLBOX_EXEC_TIMEOUT_SECS Execution wall-clock budget (default: 30)
  SKILLBOX_CODE_MIN_LEVEL    Governance level required for code (default: supervised)
  SKILLBOX_LOG_JSON          Log JSON to stderr (1/true)";

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Skillbox v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::from_env()?;
    init_logging(config.log_json)?;

    let command = args[0].as_str();
    let rest = &args[1..];
    let registry = build_registry(&config)?;

    match command {
        "import" => import(&registry, rest).await,
        "execute" => execute(registry, rest).await,
        "promote" => {
            let skill_id = positional(rest, 0, "skill-id")?;
            let actor = flag(rest, "--actor").unwrap_or_else(operator);
            let state = registry.promote(&skill_id, &actor)?;
            println!("{} {}", skill_id, state);
            Ok(())
        }
        "ban" => {
            let skill_id = positional(rest, 0, "skill-id")?;
            let actor = flag(rest, "--actor").unwrap_or_else(operator);
            let reason = flag(rest, "--reason").unwrap_or_else(|| "banned by operator".to_string());
            let state = registry.ban(&skill_id, &actor, &reason)?;
            println!("{} {}", skill_id, state);
            Ok(())
        }
        "list" => {
            let state = flag(rest, "--state").map(|s| s.parse::<TrustState>()).transpose()?;
            for skill in registry.list(state)? {
                println!(
                    "{}  {:<9} {:<8} {:<18} {}",
                    skill.id,
                    skill.trust_state,
                    skill.risk_level,
                    skill.kind.encode(),
                    skill.name
                );
            }
            Ok(())
        }
        "scan" => {
            let path = positional(rest, 0, "file")?;
            let source = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
            let result = registry.scanner().scan(&path, &source).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        other => bail!("unknown command '{}'\n\n{}", other, USAGE),
    }
}

/// Setup logging: human-readable to stdout, or JSON to stderr
fn init_logging(json: bool) -> Result<()> {
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "error" => Level::ERROR,
            _ => Level::WARN,
        })
        .unwrap_or(Level::WARN);

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

fn build_registry(config: &Config) -> Result<SkillRegistry> {
    let mut client = ClaudeClient::new(config.anthropic_api_key.as_deref(), config.scanner.semantic_timeout)?;
    if let Some(url) = &config.anthropic_api_url {
        client = client.with_api_url(url);
    }
    if !client.is_available() {
        warn!("ANTHROPIC_API_KEY not set; semantic scans will report unknown risk");
    }
    let analyzer = ClaudeAnalyzer::new(Arc::new(client), &config.scan_model);
    let cache = ScanCache::new(config.scan_cache_capacity, config.scan_cache_ttl_secs);
    let scanner = SecurityScanner::new(Arc::new(analyzer), cache, config.scanner.clone());

    let sandbox = ContainerSandbox::new(config.sandbox.clone());
    let store = SkillStore::open(&config.db_path)?;
    debug!(db = %config.db_path.display(), runtime = %config.sandbox.runtime, "Registry wired");

    Ok(SkillRegistry::new(store, Arc::new(scanner), Arc::new(sandbox)).with_config(config.registry.clone()))
}

async fn import(registry: &SkillRegistry, args: &[String]) -> Result<()> {
    let origin = flag(args, "--origin");
    let files = positionals(args);
    if files.is_empty() {
        bail!("import needs at least one file");
    }

    let mut items = Vec::with_capacity(files.len());
    for path in &files {
        let source = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
        items.push(ImportItem {
            source,
            origin: origin.clone().unwrap_or_else(|| path.to_string()),
        });
    }

    let summary = registry.import_batch(&items).await;
    for (path, outcome) in files.iter().zip(&summary.outcomes) {
        match outcome {
            Ok(report) => println!(
                "{}  {} {} {}{}",
                report.skill_id,
                report.trust_state,
                report.risk_level,
                report.name,
                if report.deduplicated { " (already registered)" } else { "" }
            ),
            Err(e) => eprintln!("{}: {}", path, e),
        }
    }
    println!("imported {}, failed {}", summary.imported, summary.failed);

    if summary.failed > 0 {
        bail!("{} of {} imports failed", summary.failed, items.len());
    }
    Ok(())
}

async fn execute(registry: SkillRegistry, args: &[String]) -> Result<()> {
    let skill_id = positional(args, 0, "skill-id")?;
    let caller = flag(args, "--caller").unwrap_or_else(operator);

    // The operator vouches for the caller's level on the command line
    let level = flag(args, "--level")
        .map(|l| l.parse::<GovernanceLevel>())
        .transpose()?
        .unwrap_or_default();
    let governance = StaticGovernance::default().with_caller(&caller, level);
    let inputs = parse_inputs(args)?;

    let response = registry
        .with_governance(Arc::new(governance))
        .execute(&skill_id, &caller, inputs)
        .await?;

    match &response {
        ExecutionResponse::Prompt { prompt, .. } => println!("{}", prompt),
        ExecutionResponse::Code(record) => {
            print!("{}", record.stdout);
            eprint!("{}", record.stderr);
        }
    }
    eprintln!(
        "[{} {} in {}ms]",
        response.record().id,
        response.outcome(),
        response.record().usage.wall_time_ms
    );

    if response.outcome() != skillbox::ExecutionOutcome::Success {
        bail!("execution ended with outcome {}", response.outcome());
    }
    Ok(())
}

fn parse_inputs(args: &[String]) -> Result<InputBindings> {
    let mut inputs = InputBindings::new();
    for raw in flags(args, "--input") {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("--input expects key=value, got '{}'", raw))?;
        inputs.insert(key.to_string(), value.to_string());
    }
    Ok(inputs)
}

fn operator() -> String {
    std::env::var("USER").unwrap_or_else(|_| "operator".to_string())
}

fn flag(args: &[String], name: &str) -> Option<String> {
    flags(args, name).into_iter().next()
}

fn flags(args: &[String], name: &str) -> Vec<String> {
    args.windows(2)
        .filter(|w| w[0] == name)
        .map(|w| w[1].clone())
        .collect()
}

/// Arguments that are neither flags nor flag values
fn positionals(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip = false;
    for arg in args {
        if skip {
            skip = false;
        } else if arg.starts_with("--") {
            skip = true;
        } else {
            out.push(arg.clone());
        }
    }
    out
}

fn positional(args: &[String], index: usize, name: &str) -> Result<String> {
    positionals(args)
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow!("missing <{}>\n\n{}", name, USAGE))
}
