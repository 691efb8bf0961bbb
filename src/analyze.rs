//! The `lens analyze` command.
//!
//! Scans a local repository, runs the pipeline and prints the report to
//! stdout. Progress and status lines go to stderr. With `--chat` the
//! command then reads follow-up questions from stdin until EOF or `exit`.
//! `--dry-run` only scans and chunks, so it needs no API key.

use anyhow::Result;
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::models::{Report, ReportStatus};
use crate::pipeline::{Pipeline, RunPlan};
use crate::progress::{format_number, ProgressMode};
use crate::scan::scan_directory;

/// Flags of the `analyze` command.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzeOptions {
    pub chat: bool,
    pub dry_run: bool,
    pub progress: ProgressMode,
}

/// Display name for a repository root: its last path component.
pub fn repository_name(root: &Path) -> String {
    let canonical = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    canonical
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| canonical.display().to_string())
}

pub async fn run_analyze(config: &Config, root: &Path, opts: AnalyzeOptions) -> Result<()> {
    let repository = repository_name(root);
    let scan_config = config.scan.clone();
    let scan_root = root.to_path_buf();
    let files = tokio::task::spawn_blocking(move || scan_directory(&scan_root, &scan_config)).await??;

    if opts.dry_run {
        let plan = RunPlan::new(&config.pipeline, &repository, files)?;
        print_plan(&repository, &plan);
        return Ok(());
    }

    let pipeline = Pipeline::from_config(config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, finishing with what has completed...");
            on_interrupt.cancel();
        }
    });

    let sink = opts.progress.sink();
    let report = pipeline
        .run(&repository, files, sink.as_ref(), cancel.clone())
        .await?;

    println!("{}", report.text);
    eprintln!(
        "Analysis of {}: {:?}, {} chunks, {} failed",
        report.repository, report.status, report.chunks, report.failed_chunks
    );

    if !opts.chat || report.status == ReportStatus::Empty {
        return Ok(());
    }
    if cancel.is_cancelled() {
        eprintln!("Run was cancelled; skipping follow-up questions.");
        return Ok(());
    }

    chat_loop(&pipeline, report).await
}

fn print_plan(repository: &str, plan: &RunPlan) {
    println!("Analysis plan for {repository}");
    println!("  Files:            {}", plan.files);
    println!(
        "  Estimated tokens: {}",
        format_number(plan.estimated_tokens as u64)
    );
    println!(
        "  Chunk budget:     {} tokens of files per chunk",
        format_number(plan.content_budget as u64)
    );
    println!("  Chunks:           {}", plan.chunks.len());
    println!(
        "  Mode:             {}",
        if plan.single_pass {
            "single pass"
        } else {
            "map-reduce"
        }
    );
    for (i, chunk) in plan.chunks.iter().enumerate() {
        println!(
            "  chunk {:>3}: {:>4} files, ~{} tokens{}",
            i + 1,
            chunk.files.len(),
            format_number(chunk.tokens as u64),
            if chunk.truncated { " (truncated)" } else { "" }
        );
    }
}

async fn chat_loop(pipeline: &Pipeline, report: Report) -> Result<()> {
    let mut conversation = pipeline.conversation(report);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    eprintln!("Ask a follow-up question (exit to quit).");
    loop {
        eprint!("> ");
        std::io::stderr().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if matches!(question, "exit" | "quit") {
            break;
        }

        match conversation.ask(question).await {
            Ok(turn) => println!("{}\n", turn.answer),
            Err(e) => eprintln!("Error: {e}"),
        }
    }
    Ok(())
}
