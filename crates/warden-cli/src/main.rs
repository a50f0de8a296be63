//! CLI entry point for Warden.
//!
//! This binary provides the `warden` command with subcommands for
//! initializing a vault, verifying the audit chain, reading audit events
//! and checking role policies.

mod cli;
mod helpers;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use warden_access::PolicyStore;
use warden_gateway::VaultGateway;
use warden_vault::keychain::FileKeychain;

use cli::{Cli, Commands};
use helpers::{check_policy, format_event, init_tracing, key_authority, load_config, open_audit};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json);

    match &cli.command {
        Commands::Init => cmd_init(&cli),
        Commands::Verify => cmd_verify(&cli),
        Commands::Audit { tail, principal } => cmd_audit(&cli, *tail, principal.as_deref()),
        Commands::Policies => cmd_policies(&cli),
        Commands::Check {
            principal,
            secret_type,
            operation,
        } => cmd_check(&cli, principal, secret_type, operation),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: init
// ---------------------------------------------------------------------------

fn cmd_init(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("failed to create data directory {}", config.data_dir.display())
    })?;

    let key_file = FileKeychain::default_path(&config.data_dir);
    let existed = key_file.exists();
    let authority = key_authority(&config)?;

    // Opening the gateway creates both databases and the mirror.
    let gateway = VaultGateway::open(config.clone(), authority).context("failed to open vault")?;
    let events = gateway.audit().len()?;
    info!(data_dir = %config.data_dir.display(), events, "vault initialized");

    if cli.json {
        let out = serde_json::json!({
            "data_dir": config.data_dir,
            "master_key": key_file,
            "master_key_created": !existed,
            "secrets_db": config.secrets_path(),
            "audit_db": config.audit_path(),
            "audit_mirror": config.mirror_path(),
            "audit_events": events,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  Warden vault");
    println!("  ============");
    println!();
    if existed {
        println!("  [=] Master key already present at {}", key_file.display());
    } else {
        println!("  [+] Master key created at {}", key_file.display());
    }
    println!("  [+] Secrets store at {}", config.secrets_path().display());
    println!("  [+] Audit log at {}", config.audit_path().display());
    if let Some(mirror) = config.mirror_path() {
        println!("  [+] Audit mirror at {}", mirror.display());
    }
    println!("  [=] {events} audit events on record");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: verify
// ---------------------------------------------------------------------------

fn cmd_verify(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let audit = open_audit(&config)?;
    let report = audit.verify_report().context("audit verification failed to run")?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        println!("  Audit chain");
        println!("  ===========");
        println!();
        println!("  Events checked:   {}", report.checked);
        match report.first_broken {
            None => println!("  Hash chain:       OK"),
            Some(seq) => println!("  Hash chain:       BROKEN at sequence {seq}"),
        }
        match (config.mirror_path(), report.mirror_divergence) {
            (None, _) => println!("  Mirror:           not configured"),
            (Some(_), None) => println!("  Mirror:           consistent"),
            (Some(_), Some(seq)) => println!("  Mirror:           DIVERGES at sequence {seq}"),
        }
        println!();
    }

    if !report.valid {
        error!(first_broken = ?report.first_broken, "audit chain integrity violation");
        anyhow::bail!("audit chain failed verification");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: audit
// ---------------------------------------------------------------------------

fn cmd_audit(cli: &Cli, tail: usize, principal: Option<&str>) -> Result<()> {
    let config = load_config(cli)?;
    let audit = open_audit(&config)?;

    let events = match principal {
        Some(p) => {
            let all = audit.events_for(p)?;
            let skip = all.len().saturating_sub(tail);
            all.into_iter().skip(skip).collect()
        }
        None => audit.tail(tail)?,
    };

    for event in &events {
        if cli.json {
            println!("{}", serde_json::to_string(event)?);
        } else {
            println!("{}", format_event(event));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: policies
// ---------------------------------------------------------------------------

fn cmd_policies(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let store = PolicyStore::new(config.policy_set()).context("invalid policy set")?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(store.policy_set())?);
        return Ok(());
    }

    println!();
    for (name, policy) in store.roles() {
        let types: Vec<&str> = policy.allowed_types.iter().map(|t| t.as_str()).collect();
        let ops: Vec<&str> = policy.allowed_operations.iter().map(|o| o.as_str()).collect();
        println!("  [{name}]");
        println!("    types:          {}", types.join(", "));
        println!("    operations:     {}", ops.join(", "));
        println!("    max level:      {}", policy.max_level);
        println!(
            "    rate:           {} per {}s",
            policy.rate_limit, policy.rate_window_secs
        );
        println!("    session ttl:    {}s", policy.session_ttl_secs);
        if policy.requires_justification {
            println!("    justification:  required");
        }
        if policy.allow_cross_tenant {
            println!("    cross-tenant:   allowed");
        }
        println!();
    }

    let assignments: Vec<_> = store.assignments().collect();
    if !assignments.is_empty() {
        println!("  Assignments");
        for (principal, role) in assignments {
            println!("    {principal:<20} -> {role}");
        }
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: check
// ---------------------------------------------------------------------------

fn cmd_check(cli: &Cli, principal: &str, secret_type: &str, operation: &str) -> Result<()> {
    let config = load_config(cli)?;
    let store = PolicyStore::new(config.policy_set()).context("invalid policy set")?;
    let check = check_policy(&store, principal, secret_type, operation)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&check)?);
    } else {
        let role = check.role.as_deref().unwrap_or("-");
        if check.permitted {
            let level = check
                .max_level
                .map(|l| l.to_string())
                .unwrap_or_default();
            println!(
                "  PERMIT  {principal} ({role}) {} {} up to {level}",
                check.operation, check.secret_type
            );
            if check.requires_justification {
                println!("          justification required");
            }
        } else {
            println!(
                "  DENY    {principal} ({role}) {} {}",
                check.operation, check.secret_type
            );
            for problem in &check.problems {
                println!("          {problem}");
            }
        }
    }

    if !check.permitted {
        std::process::exit(1);
    }
    Ok(())
}
