use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use rowguard::abac::{
    ActionEffect, DirectoryPolicySource, LoadReport, PermissionEvaluator, PolicyCache, Subject,
    TableEntityId,
};
use rowguard::errors::RowguardError;
use rowguard::formula::{
    compute_array, compute_scalar, inject_into_rows, parse_computable_fields, parse_formula,
    parse_formula_document, AttributeBag, EvalContext, Formula, Value,
};
use rowguard::settings::Settings;
use rowguard::storage::{self, MemoryTable};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "rowguard",
    version,
    about = "Attribute-based row and field access control"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a policy directory and report invalid policies
    Validate {
        /// Overrides `policies.dir`
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Show the rows of a JSON file a user may see or change
    Evaluate {
        /// Action identifier, e.g. `publications.list`
        #[arg(long)]
        action: String,
        /// Entity as `service.schema.table`
        #[arg(long)]
        entity: String,
        /// JSON file with the user attributes
        #[arg(long)]
        user: PathBuf,
        /// JSON file with an array of rows
        #[arg(long)]
        rows: PathBuf,
        /// Extra filter, as an expression or a file
        #[arg(long)]
        filter: Option<String>,
        #[arg(long, value_enum, default_value_t = EffectArg::Read)]
        effect: EffectArg,
    },
    /// Evaluate a formula or a computed-field map over the rows of a JSON file
    Compute {
        /// JSON file with the user attributes
        #[arg(long)]
        user: PathBuf,
        /// JSON file with an array of rows
        #[arg(long)]
        rows: PathBuf,
        /// Formula, as an expression or a file
        #[arg(long, conflicts_with = "fields", required_unless_present = "fields")]
        formula: Option<String>,
        /// Group key for array results
        #[arg(long, requires = "formula")]
        group_by: Option<String>,
        /// Evaluate once over all rows instead of once per row
        #[arg(long, requires = "formula")]
        scalar: bool,
        /// JSON file mapping field names to formulas, injected into every row
        #[arg(long)]
        fields: Option<PathBuf>,
        /// Restrict rows to those visible under this action
        #[arg(long, requires = "entity")]
        action: Option<String>,
        #[arg(long, requires = "action")]
        entity: Option<String>,
    },
    /// Create or upgrade the demo tables
    Migrate,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum EffectArg {
    Read,
    Write,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).with_writer(std::io::stderr).init();

    let cli = Cli::parse();

    // load settings
    let settings = Settings::load(&cli.config)?;
    tracing::debug!(?settings, "Loaded configuration");

    match cli.command {
        Command::Validate { dir } => {
            let dir = dir.unwrap_or_else(|| settings.policies.dir.clone());
            let report = rowguard::abac::load_policies(&dir)?;
            print_report(&report);
            if !report.skipped.is_empty() {
                return Err(miette::miette!(
                    "{} policy definition(s) were skipped",
                    report.skipped.len()
                ));
            }
        }
        Command::Evaluate {
            action,
            entity,
            user,
            rows,
            filter,
            effect,
        } => {
            let evaluator = open_evaluator(&settings)?;
            let subject = Subject::new(read_bag(&user)?);
            let table = memory_table(&entity, &rows)?;
            let filter = filter.as_deref().map(formula_arg).transpose()?;
            let request = table.request(&action, &subject).with_filter(filter.as_ref());
            let visible = match effect {
                EffectArg::Read => table.fetch_visible(&evaluator, &request)?,
                EffectArg::Write => {
                    let snapshot = table.snapshot();
                    let grant = evaluator.authorize(&request, ActionEffect::Write)?;
                    grant.condition().filter_rows(&snapshot).map_err(RowguardError::from)?
                }
            };
            print_rows(&visible)?;
        }
        Command::Compute {
            user,
            rows,
            formula,
            group_by,
            scalar,
            fields,
            action,
            entity,
        } => {
            let subject = Subject::new(read_bag(&user)?);
            let mut rows = match (action, entity) {
                (Some(action), Some(entity)) => {
                    let evaluator = open_evaluator(&settings)?;
                    let table = memory_table(&entity, &rows)?;
                    table.fetch_visible(&evaluator, &table.request(&action, &subject))?
                }
                _ => read_rows(&rows)?,
            };

            if let Some(path) = fields {
                let raw = std::fs::read_to_string(&path).into_diagnostic()?;
                let fields = parse_computable_fields(&raw)?;
                let snapshot = rows.clone();
                let ctx = EvalContext::new(subject.user(), subject.environment()).with_rows(&snapshot);
                inject_into_rows(&mut rows, &fields, &ctx)?;
                print_rows(&rows)?;
            } else if let Some(formula) = formula {
                let formula = formula_arg(&formula)?;
                let ctx = EvalContext::new(subject.user(), subject.environment()).with_rows(&rows);
                let result = if scalar {
                    compute_scalar(&formula, &ctx)?
                } else {
                    let group_by = group_by.as_deref().map(formula_arg).transpose()?;
                    Value::List(compute_array(&formula, &ctx, group_by.as_ref())?)
                };
                println!("{}", serde_json::to_string_pretty(&result.to_json()).into_diagnostic()?);
            }
        }
        Command::Migrate => {
            let db = storage::init(&settings.database).await?;
            storage::migrate(&db).await?;
            tracing::info!(url = %settings.database.url, "Migrations applied");
        }
    }
    Ok(())
}

fn open_evaluator(settings: &Settings) -> Result<PermissionEvaluator> {
    let (source, _report) = DirectoryPolicySource::open(settings.policies.dir.clone())?;
    let cache = if settings.engine.cache_policies {
        PolicyCache::new()
    } else {
        PolicyCache::disabled()
    };
    Ok(PermissionEvaluator::new(Arc::new(source))
        .with_cache(Arc::new(cache))
        .with_visible_fields(settings.engine.visible_fields))
}

fn memory_table(entity: &str, rows: &Path) -> Result<MemoryTable> {
    let entity: TableEntityId = entity.parse()?;
    Ok(MemoryTable::new(entity).with_rows(read_rows(rows)?))
}

fn read_json(path: &Path) -> Result<serde_json::Value, RowguardError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn read_bag(path: &Path) -> Result<AttributeBag, RowguardError> {
    AttributeBag::from_json(&read_json(path)?).ok_or_else(|| {
        RowguardError::BadRequest(format!("`{}` must hold a JSON object", path.display()))
    })
}

fn read_rows(path: &Path) -> Result<Vec<AttributeBag>, RowguardError> {
    let serde_json::Value::Array(items) = read_json(path)? else {
        return Err(RowguardError::BadRequest(format!(
            "`{}` must hold a JSON array of objects",
            path.display()
        )));
    };
    items
        .iter()
        .map(|item| {
            AttributeBag::from_json(item).ok_or_else(|| {
                RowguardError::BadRequest(format!("every row in `{}` must be an object", path.display()))
            })
        })
        .collect()
}

/// A formula given inline or as a file; files may hold a JSON tree.
fn formula_arg(raw: &str) -> Result<Formula, RowguardError> {
    let path = Path::new(raw);
    let text = if path.is_file() {
        std::fs::read_to_string(path)?
    } else {
        raw.to_string()
    };
    if text.trim_start().starts_with('{') {
        Ok(parse_formula_document(&text)?)
    } else {
        Ok(parse_formula(text.trim())?)
    }
}

fn print_rows(rows: &[AttributeBag]) -> Result<()> {
    let json: Vec<_> = rows.iter().map(AttributeBag::to_json).collect();
    println!("{}", serde_json::to_string_pretty(&json).into_diagnostic()?);
    Ok(())
}

fn print_report(report: &LoadReport) {
    println!(
        "{} file(s), {} policies loaded, {} skipped",
        report.files,
        report.policies.len(),
        report.skipped.len()
    );
    for skipped in &report.skipped {
        match &skipped.policy {
            Some(policy) => println!("  {} ({}): {}", skipped.path, policy, skipped.reason),
            None => println!("  {}: {}", skipped.path, skipped.reason),
        }
    }
}
