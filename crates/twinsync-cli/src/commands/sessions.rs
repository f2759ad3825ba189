//! `twinsync sessions`: list and inspect recorded sessions.

use std::path::{Path, PathBuf};

use twinsync_core::SessionMeta;

use super::format_duration_ms;

pub fn run(session_path: Option<&str>, dir: &str) {
    match session_path {
        Some(path) => show_session(&PathBuf::from(path)),
        None => list(dir),
    }
}

fn list(dir: &str) {
    let sessions_dir = PathBuf::from(dir);
    if !sessions_dir.exists() {
        println!("No sessions directory found at {dir}");
        println!("Record a session first: twinsync run --record");
        return;
    }

    let mut sessions = match twinsync_core::list_sessions(&sessions_dir) {
        Ok(s) => s,
        Err(e) => super::fail(format!("reading {dir}: {e}")),
    };
    if sessions.is_empty() {
        println!("No sessions found in {dir}/");
        println!("Record a session first: twinsync run --record");
        return;
    }
    // Newest first
    sessions.reverse();

    println!(
        "{:<44} {:<16} {:>8} {:>6} {:<10} {:>9}",
        "Session", "Twin", "Delays", "Evals", "Final", "Duration"
    );
    println!("{}", "-".repeat(98));

    for (path, meta) in &sessions {
        let dir_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let final_state = meta
            .final_state
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        println!(
            "{:<44} {:<16} {:>8} {:>6} {:<10} {:>9}",
            truncate(&dir_name, 44),
            truncate(&meta.digital_twin_id, 16),
            meta.delay_samples,
            meta.odte_evaluations,
            final_state,
            format_duration_ms(meta.duration_ms),
        );
    }

    println!("\n{} session(s) in {dir}/", sessions.len());
    println!("Run: twinsync sessions <path>  for details");
}

fn read_meta(session_dir: &Path) -> SessionMeta {
    let json_path = session_dir.join("session.json");
    let contents = std::fs::read_to_string(&json_path).unwrap_or_else(|e| {
        super::fail(format!(
            "not a session directory: {} ({e})",
            session_dir.display()
        ))
    });
    serde_json::from_str(&contents)
        .unwrap_or_else(|e| super::fail(format!("parsing {}: {e}", json_path.display())))
}

fn show_session(session_dir: &Path) {
    let meta = read_meta(session_dir);

    println!("Session: {}", session_dir.display());
    println!("  ID:           {}", meta.id);
    println!("  Twin:         {}", meta.digital_twin_id);
    println!("  Started:      {}", meta.started_at);
    println!("  Ended:        {}", meta.ended_at);
    println!("  Duration:     {}", format_duration_ms(meta.duration_ms));
    println!("  Delays:       {}", meta.delay_samples);
    println!("  Evaluations:  {}", meta.odte_evaluations);
    println!("  Transitions:  {}", meta.transitions);
    if let Some(s) = meta.final_state {
        println!("  Final state:  {s}");
    }
    println!(
        "  Host:         {} {} ({} cores)",
        meta.host.os, meta.host.arch, meta.host.cores
    );
    if !meta.tags.is_empty() {
        let mut tags: Vec<_> = meta.tags.iter().collect();
        tags.sort();
        let tags: Vec<String> = tags.iter().map(|(k, v)| format!("{k}:{v}")).collect();
        println!("  Tags:         {}", tags.join(", "));
    }
    if let Some(note) = &meta.note {
        println!("  Note:         {note}");
    }

    let transitions = std::fs::read_to_string(session_dir.join("transitions.csv")).unwrap_or_default();
    let rows: Vec<&str> = transitions.lines().skip(1).collect();
    if !rows.is_empty() {
        println!();
        println!("  Lifecycle:");
        for row in rows.iter().rev().take(10).rev() {
            let mut cols = row.split(',');
            let (Some(ms), Some(state)) = (cols.next(), cols.next()) else {
                continue;
            };
            println!("    {ms:>14}  {state}");
        }
        if rows.len() > 10 {
            println!("    ({} earlier)", rows.len() - 10);
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
