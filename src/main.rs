use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use pruner::{
    ConfigResolver, EnforcementLevel, GlobalPolicy, NamespacePolicy, PolicyField, PolicySource,
    ResolvedValue, ResourceKind,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Parser)]
#[command(name = "runpruner")]
#[command(about = "runpruner - policy-driven cleanup of completed pipeline and task runs")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a policy document
    Validate {
        /// Policy file; defaults to `pruner.policy_path`
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Treat the file as the namespace-scoped document for this namespace
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Show the effective policy for one workflow
    Explain {
        /// Global policy file; defaults to `pruner.policy_path`
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Namespace-scoped policy document for `--namespace`
        #[arg(long)]
        namespace_policy: Option<PathBuf>,

        #[arg(long)]
        namespace: String,

        /// Workflow (pipeline or task) name
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "pipelinerun")]
        kind: ResourceKind,

        #[arg(long, help = "Print the result as JSON")]
        json: bool,
    },
    #[command(flatten)]
    Common(CommonCommands),
}

#[derive(Debug, Serialize)]
struct Explanation {
    namespace: String,
    name: String,
    kind: ResourceKind,
    enforcement_level: EnforcementLevel,
    level_source: PolicySource,
    fields: BTreeMap<&'static str, Option<ResolvedValue>>,
}

fn main() {
    let cli = Cli::parse();
    utils::init_logging(&cli.common);

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        for cause in e.chain().skip(1) {
            eprintln!("  caused by: {cause}");
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = utils::load_config(cli.common.config.as_ref())?;

    match cli.command {
        Commands::Validate { policy, namespace } => {
            let path = policy_path(policy, config.pruner.policy_path.as_deref())?;
            let raw = read_policy(&path)?;
            match namespace {
                Some(namespace) => {
                    let policy = NamespacePolicy::from_yaml(&raw)
                        .with_context(|| format!("Invalid policy {}", path.display()))?;
                    println!(
                        "{}: valid namespace policy for {namespace} ({} pipeline run selector(s), {} task run selector(s))",
                        path.display(),
                        policy.pipeline_runs.len(),
                        policy.task_runs.len(),
                    );
                }
                None => {
                    let policy = GlobalPolicy::from_yaml(&raw)
                        .with_context(|| format!("Invalid policy {}", path.display()))?;
                    println!(
                        "{}: valid global policy ({} namespace override(s))",
                        path.display(),
                        policy.namespaces.len(),
                    );
                }
            }
            Ok(())
        }
        Commands::Explain {
            policy,
            namespace_policy,
            namespace,
            name,
            kind,
            json,
        } => {
            let resolver = ConfigResolver::new();
            let path = policy_path(policy, config.pruner.policy_path.as_deref())?;
            resolver
                .load_global(&read_policy(&path)?)
                .with_context(|| format!("Invalid policy {}", path.display()))?;
            if let Some(path) = namespace_policy {
                resolver
                    .load_namespace(&namespace, &read_policy(&path)?)
                    .with_context(|| format!("Invalid namespace policy {}", path.display()))?;
            }

            let explanation = explain(&resolver, namespace, name, kind);
            print_explanation(&explanation, json)
        }
        Commands::Common(command) => utils::handle_common_command(
            &command,
            &config,
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        ),
    }
}

fn policy_path(explicit: Option<PathBuf>, configured: Option<&Path>) -> Result<PathBuf> {
    explicit
        .or_else(|| configured.map(Path::to_path_buf))
        .context("No policy file given; pass --policy or set pruner.policy_path")
}

fn read_policy(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy file {}", path.display()))?;
    debug!(path = %path.display(), bytes = raw.len(), "Read policy file");
    Ok(raw)
}

fn explain(resolver: &ConfigResolver, namespace: String, name: String, kind: ResourceKind) -> Explanation {
    let snapshot = resolver.snapshot();
    let (enforcement_level, level_source) = snapshot.enforcement_level(&namespace, &name, kind);

    let fields = PolicyField::ALL
        .into_iter()
        .map(|field| (field.key(), resolver.resolve(&namespace, &name, kind, field)))
        .collect();

    Explanation {
        namespace,
        name,
        kind,
        enforcement_level,
        level_source,
        fields,
    }
}

fn print_explanation(explanation: &Explanation, json: bool) -> Result<()> {
    if json {
        let json = serde_json::to_string_pretty(explanation)
            .context("Failed to serialize explanation to JSON")?;
        println!("{json}");
        return Ok(());
    }

    println!(
        "{} {}/{}",
        explanation.kind, explanation.namespace, explanation.name
    );
    println!(
        "Enforcement level: {} (from {})",
        explanation.enforcement_level, explanation.level_source
    );
    for (key, value) in &explanation.fields {
        match value {
            Some(resolved) => println!("  {key}: {} (from {})", resolved.value, resolved.source),
            None => println!("  {key}: <unset>"),
        }
    }
    Ok(())
}
