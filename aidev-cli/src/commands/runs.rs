//! Run command handlers
//!
//! Listing and inspecting runs, plus the operator interventions: cancel,
//! override a rejected review, and dismiss a blocked run.

use aidev_client::OperatorClient;
use aidev_core::domain::patch::{PatchCandidate, Verdict};
use aidev_core::domain::run::{PipelineRun, RunState};
use aidev_core::dto::run::RunSummary;
use anyhow::{Result, bail};
use clap::Subcommand;
use colored::*;

use crate::config::Config;
use crate::id_resolver::resolve_run_id;
use crate::types::IdOrPrefix;

/// Run subcommands
#[derive(Subcommand)]
pub enum RunCommands {
    /// List runs the daemon is tracking
    List {
        /// Only show blocked runs
        #[arg(long)]
        blocked: bool,
    },
    /// Show run details, candidates and history
    Show {
        /// Run ID or unambiguous prefix
        id: String,
    },
    /// Cancel a run
    Cancel {
        /// Run ID or unambiguous prefix
        id: String,

        /// Operator recorded in the audit log
        #[arg(short, long, env = "AIDEV_OPERATOR")]
        operator: Option<String>,
    },
    /// Override a rejected review and resume the run
    Override {
        /// Run ID or unambiguous prefix
        id: String,

        /// Operator recorded on the verdict
        #[arg(short, long, env = "AIDEV_OPERATOR")]
        operator: String,

        /// Why the rejection is being overridden
        #[arg(short, long)]
        reason: String,
    },
    /// Drop a blocked run and release its issue
    Dismiss {
        /// Run ID or unambiguous prefix
        id: String,
    },
}

/// Handle run commands
pub async fn handle_run_command(command: RunCommands, config: &Config) -> Result<()> {
    let client = OperatorClient::new(&config.api_url);

    match command {
        RunCommands::List { blocked } => list_runs(&client, blocked).await,
        RunCommands::Show { id } => show_run(&client, &id).await,
        RunCommands::Cancel { id, operator } => cancel_run(&client, &id, operator).await,
        RunCommands::Override {
            id,
            operator,
            reason,
        } => override_run(&client, &id, operator, reason).await,
        RunCommands::Dismiss { id } => dismiss_run(&client, &id).await,
    }
}

async fn list_runs(client: &OperatorClient, blocked_only: bool) -> Result<()> {
    let runs: Vec<RunSummary> = client
        .list_runs()
        .await?
        .into_iter()
        .filter(|r| !blocked_only || r.state == RunState::Blocked)
        .collect();

    if runs.is_empty() {
        println!("{}", "No runs found.".yellow());
    } else {
        println!("{}", format!("Found {} run(s):", runs.len()).bold());
        println!();
        for run in &runs {
            print_run_summary(run);
        }
    }

    Ok(())
}

async fn show_run(client: &OperatorClient, id: &str) -> Result<()> {
    let id_or_prefix = IdOrPrefix::parse(id);
    let uuid = resolve_run_id(client, &id_or_prefix).await?;

    let run = client.get_run(uuid).await?;
    print_run_details(&run);

    Ok(())
}

async fn cancel_run(client: &OperatorClient, id: &str, operator: Option<String>) -> Result<()> {
    let id_or_prefix = IdOrPrefix::parse(id);
    let uuid = resolve_run_id(client, &id_or_prefix).await?;

    client.cancel_run(uuid, operator).await?;

    println!(
        "{}",
        format!("✓ Cancellation requested for run {}", uuid)
            .green()
            .bold()
    );
    println!(
        "  {}",
        "An active run stops at its next step boundary.".dimmed()
    );

    Ok(())
}

async fn override_run(
    client: &OperatorClient,
    id: &str,
    operator: String,
    reason: String,
) -> Result<()> {
    if operator.trim().is_empty() || reason.trim().is_empty() {
        bail!("Override requires a non-empty operator and reason");
    }

    let id_or_prefix = IdOrPrefix::parse(id);
    let uuid = resolve_run_id(client, &id_or_prefix).await?;

    let run = match client.override_run(uuid, operator, reason).await {
        Ok(run) => run,
        Err(e) if e.is_conflict() => {
            bail!("Run {} is not blocked on a rejected review: {}", uuid, e)
        }
        Err(e) => return Err(e.into()),
    };

    println!("{}", "✓ Review overridden successfully!".green().bold());
    println!("  Run:   {}", run.id.to_string().cyan());
    println!("  State: {}", run.state.to_string().yellow());

    Ok(())
}

async fn dismiss_run(client: &OperatorClient, id: &str) -> Result<()> {
    let id_or_prefix = IdOrPrefix::parse(id);
    let uuid = resolve_run_id(client, &id_or_prefix).await?;

    client.dismiss_run(uuid).await?;

    println!(
        "{}",
        format!("✓ Run {} dismissed successfully!", uuid)
            .green()
            .bold()
    );

    Ok(())
}

fn state_label(state: RunState) -> ColoredString {
    let label = state.to_string();
    match state {
        RunState::Closed => label.green(),
        RunState::Blocked => label.red(),
        RunState::Queued => label.dimmed(),
        _ => label.yellow(),
    }
}

fn verdict_label(verdict: Verdict) -> ColoredString {
    let label = verdict.to_string();
    match verdict {
        Verdict::Approved => label.green(),
        Verdict::Rejected => label.red(),
        Verdict::Override => label.magenta(),
        Verdict::Pending => label.dimmed(),
    }
}

fn print_run_summary(run: &RunSummary) {
    println!("  {} {} {}", "▸".cyan(), run.issue.bold(), run.title);
    println!("    ID:         {}", run.id.to_string().dimmed());
    println!(
        "    State:      {}{}",
        state_label(run.state),
        if run.in_progress { " (in progress)" } else { "" }
    );
    println!(
        "    Candidates: {}",
        run.candidate_count.to_string().dimmed()
    );
    if let Some(verdict) = run.active_verdict {
        println!("    Verdict:    {}", verdict_label(verdict));
    }
    if let Some(reason) = &run.block_reason {
        println!("    Blocked:    {}", reason.to_string().red());
    }
    println!(
        "    Updated:    {}",
        run.updated_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

fn print_candidate(candidate: &PatchCandidate, active: bool) {
    let marker = if active { "*".cyan() } else { " ".normal() };
    println!(
        "  {} #{} {} by {} ({})",
        marker,
        candidate.attempt,
        verdict_label(candidate.review.verdict),
        candidate.generated_by.provider,
        candidate.generated_by.role
    );
    for change in &candidate.changes {
        println!("      {}", change.path.dimmed());
    }
    if !candidate.review.rationale.is_empty() {
        println!("      {}", candidate.review.rationale);
    }
    for finding in &candidate.review.findings {
        println!(
            "      {} {}:{} {}",
            format!("[{}]", finding.category).red(),
            finding.path,
            finding.line,
            finding.message.dimmed()
        );
    }
    if let Some(operator) = &candidate.review.overridden_by {
        println!("      Overridden by {}", operator.magenta());
    }
}

fn print_run_details(run: &PipelineRun) {
    println!("{}", "Run Details:".bold());
    println!("  ID:       {}", run.id.to_string().cyan());
    println!("  Issue:    {} {}", run.issue.to_string().bold(), run.issue.title);
    println!("  State:    {}", state_label(run.state));
    if let Some(reason) = &run.block_reason {
        let from = run
            .blocked_from
            .map(|s| format!(" (from {})", s))
            .unwrap_or_default();
        println!("  Blocked:  {}{}", reason.to_string().red(), from);
    }
    println!("  Created:  {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated:  {}", run.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!(
        "  Budgets:  planning {}, coding {}, regeneration {}, testing {}, committing {}",
        run.retries.planning,
        run.retries.coding,
        run.retries.regeneration,
        run.retries.testing,
        run.retries.committing
    );
    if let Some(commit) = &run.commit.commit {
        println!(
            "  Commit:   {} on {} (pushed: {}, issue closed: {})",
            commit.sha.cyan(),
            commit.branch,
            run.commit.pushed,
            run.commit.issue_closed
        );
    }

    if let Some(plan) = &run.plan {
        println!("\n{}", "Plan:".bold());
        println!("{}", "─".repeat(80).dimmed());
        println!("{}", plan);
        println!("{}", "─".repeat(80).dimmed());
    }

    if !run.candidates.is_empty() {
        println!("\n{}", "Candidates:".bold());
        for candidate in &run.candidates {
            print_candidate(candidate, run.active_candidate == Some(candidate.id));
        }
    }

    if let Some(report) = &run.last_test {
        let status = if report.passed {
            "passed".green()
        } else {
            format!("failed (exit {})", report.exit_code).red()
        };
        println!("\n{} {}", "Last test run:".bold(), status);
        if !report.passed && !report.output.is_empty() {
            println!("{}", report.output.dimmed());
        }
    }

    if !run.history.is_empty() {
        println!("\n{}", "History:".bold());
        for t in &run.history {
            println!(
                "  {} {} → {} {}",
                t.at.format("%H:%M:%S").to_string().dimmed(),
                t.from,
                t.to,
                t.note.dimmed()
            );
        }
    }
}
