//! Plain-text rendering of surface views.
//!
//! Every function is pure so the output can be asserted in tests.

use llwatch_client::poller::DigitsState;
use llwatch_client::refresh::LoadState;
use llwatch_client::surfaces::block_grid::GridTile;
use llwatch_client::surfaces::{DrawerView, GridView, PanelView, PrimeListView, RunnerView};
use llwatch_client::ConnectionState;
use llwatch_core::models::TrackedExponent;
use serde::Serialize;

/// One JSON line for `--json` output.
pub fn json_line<T: Serialize>(view: &T) -> String {
    serde_json::to_string(view).unwrap_or_else(|e| format!("{{\"render_error\":\"{e}\"}}"))
}

pub fn connection(state: &ConnectionState) -> String {
    match state {
        ConnectionState::Idle => "idle".into(),
        ConnectionState::Connecting => "connecting".into(),
        ConnectionState::Live => "live".into(),
        ConnectionState::Closed => "closed".into(),
        ConnectionState::Lost(reason) => format!("lost ({reason})"),
    }
}

fn load(state: &LoadState) -> Option<String> {
    match state {
        LoadState::Loading => Some("loading...".into()),
        LoadState::Loaded => None,
        LoadState::Failed(message) => Some(format!("unavailable: {message}")),
    }
}

fn tile(tile: &GridTile, active: bool) -> String {
    let marker = if active { '*' } else { ' ' };
    format!(
        "{marker} {:>10}  {:>3}%  {:>7}/{:<7}  {}",
        tile.block.display_label(),
        tile.coverage_pct(),
        tile.progress.tested.unwrap_or(0),
        tile.progress.total.unwrap_or(0),
        tile.progress.status.as_str(),
    )
}

pub fn grid(view: &GridView) -> Vec<String> {
    let mut lines: Vec<String> = view
        .tiles
        .iter()
        .map(|t| tile(t, view.active == Some(t.block.id)))
        .collect();
    if let Some(status) = load(&view.load) {
        lines.push(status);
    }
    lines
}

pub fn panel(view: &PanelView) -> String {
    let Some(block) = &view.block else {
        return "no active block".into();
    };
    let mut line = format!(
        "block {}  {}%  [{}]",
        block.block_id,
        block.coverage_pct(),
        connection(&view.connection)
    );
    if let Some(current) = &block.current {
        line.push_str(&format!("  testing p={} {}%", current.p, current.pct));
    }
    if let Some(last) = block.last_finished {
        line.push_str(&format!("  last={last}"));
    }
    if block.finished {
        line.push_str("  done");
    }
    line
}

fn exponent(row: &TrackedExponent, selected: bool) -> String {
    let verdict = match row.is_prime {
        Some(true) => "prime",
        Some(false) => "composite",
        None => "-",
    };
    let marker = if selected { '>' } else { ' ' };
    format!("{marker} {:>10}  {:<8} {verdict}", row.p, row.status.as_str())
}

pub fn drawer(view: &DrawerView) -> Vec<String> {
    let progress = &view.detail.progress;
    let mut lines = vec![format!(
        "block {}  {}%  [{}]{}",
        progress.block_id,
        progress.coverage_pct(),
        connection(&view.connection),
        if view.prime_first { "  (primes first)" } else { "" },
    )];
    if let Some(status) = load(&view.seed) {
        lines.push(status);
    }
    lines.extend(
        view.visible
            .iter()
            .map(|row| exponent(row, view.selected_p == Some(row.p))),
    );
    lines
}

pub fn digits(state: &DigitsState) -> String {
    match state {
        DigitsState::Idle => String::new(),
        DigitsState::Preparing { job_id } => format!("preparing digits ({job_id})"),
        DigitsState::Ready {
            artifact,
            download_url,
            ..
        } => format!("{} digits ready: {download_url}", artifact.digits),
        DigitsState::Failed { message, .. } => format!("digits failed: {message}"),
    }
}

pub fn runner(view: &RunnerView) -> String {
    let Some(run) = &view.run else {
        return view.notice.clone().unwrap_or_else(|| "no run".into());
    };
    let mut line = format!(
        "M{} job {}  {}  {}%  [{}]",
        run.p,
        run.job_id,
        run.status.as_str(),
        run.pct,
        connection(&view.connection)
    );
    if let Some(estimate) = view.estimated_digits {
        line.push_str(&format!("  ~{estimate} digits"));
    }
    if let Some(digest) = &run.digest {
        line.push_str(&format!("  residue {digest}"));
    }
    if let Some(result) = &run.result {
        line.push_str(if result.is_prime { "  PRIME" } else { "  composite" });
    }
    if let Some(error) = &run.error {
        line.push_str(&format!("  error: {error}"));
    }
    let digits = digits(&view.digits);
    if !digits.is_empty() {
        line.push_str("  ");
        line.push_str(&digits);
    }
    if let Some(notice) = &view.notice {
        line.push_str(&format!("  ({notice})"));
    }
    line
}

pub fn primes(view: &PrimeListView) -> Vec<String> {
    let mut lines = Vec::with_capacity(view.primes.len() + 1);
    if let Some(count) = view.count {
        lines.push(format!("{count} primes found"));
    }
    for entry in &view.primes {
        let mut line = format!("M{:<10} {:>9} digits  block {}", entry.row.p, entry.row.digits, entry.row.block_id);
        if let Some(at) = entry.row.finished_at_utc() {
            line.push_str(&format!("  {}", at.format("%Y-%m-%d %H:%M:%S")));
        }
        let digits = digits(&entry.digits);
        if !digits.is_empty() {
            line.push_str("  ");
            line.push_str(&digits);
        }
        lines.push(line);
    }
    if let Some(status) = load(&view.load) {
        lines.push(status);
    }
    lines
}

#[cfg(test)]
mod tests {
    use llwatch_core::models::{ArtifactDescriptor, TrackedBlock};
    use llwatch_core::reconcile::BlockView;
    use llwatch_core::status::BlockStatus;
    use llwatch_core::types::BlockId;

    use super::*;

    fn tracked(id: BlockId, tested: u64) -> TrackedBlock {
        TrackedBlock {
            id,
            start: id as u64 * 1_000_000,
            end_excl: (id as u64 + 1) * 1_000_000,
            label: String::new(),
            candidate_count: 100,
            tested_count: tested,
            verified_count: 0,
            status: BlockStatus::Running,
        }
    }

    #[test]
    fn grid_marks_active_block() {
        let mut progress = BlockView::new(2);
        progress.apply_snapshot(&tracked(2, 40));
        let view = GridView {
            tiles: vec![GridTile {
                block: tracked(2, 40),
                progress,
            }],
            load: LoadState::Loaded,
            active: Some(2),
            skipped_refreshes: 0,
        };
        let lines = grid(&view);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with('*'));
        assert!(lines[0].contains("2-3M"));
        assert!(lines[0].contains("40%"));
    }

    #[test]
    fn tile_counts_follow_merged_progress() {
        let mut progress = BlockView::new(4);
        progress.apply_snapshot(&tracked(4, 60));
        // A late refresh with a lower count is dropped by the merge.
        progress.apply_snapshot(&tracked(4, 55));
        let line = tile(
            &GridTile {
                block: tracked(4, 55),
                progress,
            },
            false,
        );
        assert!(line.contains("60%"));
        assert!(line.contains("60/100"));
        assert!(!line.contains("55"));
    }

    #[test]
    fn hidden_panel() {
        assert_eq!(panel(&PanelView::default()), "no active block");
    }

    #[test]
    fn lost_connection_shows_reason() {
        assert_eq!(connection(&ConnectionState::Lost("refused".into())), "lost (refused)");
    }

    #[test]
    fn ready_digits_show_url() {
        let state = DigitsState::Ready {
            job_id: "d1".into(),
            artifact: ArtifactDescriptor {
                job_id: "d1".into(),
                filename: "M127.txt".into(),
                path: String::new(),
                digits: 39,
                size_bytes: 40,
                sha256: String::new(),
            },
            download_url: "http://h/digits/d1/download".into(),
        };
        assert_eq!(digits(&state), "39 digits ready: http://h/digits/d1/download");
    }

    #[test]
    fn json_line_is_single_line() {
        let line = json_line(&PanelView::default());
        assert!(!line.contains('\n'));
        assert!(line.contains("\"connection\""));
    }
}
