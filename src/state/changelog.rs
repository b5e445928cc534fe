//! Changelog Generator (spec.md §4.8): renders a [`Delta`] as deterministic
//! Markdown. No I/O beyond returning the rendered string; callers decide
//! where it's written.

use super::delta::{diff_tags, Delta};
use std::fmt::Write as _;

/// Renders `delta` as Markdown with a fixed section order: Added, Removed,
/// Modified. Empty sections are omitted. Output is purely a function of
/// `delta`'s contents, so identical deltas always render identically.
/// The `tags` field is special-cased through [`diff_tags`] so tag changes
/// read as added/removed/changed keys rather than a raw map dump.
pub fn render(delta: &Delta) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Inventory Changelog");
    let _ = writeln!(out);

    if delta.is_empty() {
        let _ = writeln!(out, "No changes detected.");
        return out;
    }

    if !delta.added.is_empty() {
        let _ = writeln!(out, "## Added ({})", delta.added.len());
        let _ = writeln!(out);
        for record in &delta.added {
            let _ = writeln!(out, "- `{}` ({} {})", record.identity_key(), record.service, record.resource_type);
        }
        let _ = writeln!(out);
    }

    if !delta.removed.is_empty() {
        let _ = writeln!(out, "## Removed ({})", delta.removed.len());
        let _ = writeln!(out);
        for record in &delta.removed {
            let _ = writeln!(out, "- `{}` ({} {})", record.identity_key(), record.service, record.resource_type);
        }
        let _ = writeln!(out);
    }

    if !delta.modified.is_empty() {
        let _ = writeln!(out, "## Modified ({})", delta.modified.len());
        let _ = writeln!(out);
        for entry in &delta.modified {
            let _ = writeln!(out, "- `{}`", entry.identity_key);
            for change in &entry.changes {
                if change.field == "tags" {
                    render_tag_change(&mut out, change);
                } else {
                    let _ = writeln!(out, "  - {}: `{}` → `{}`", change.field, change.old, change.new);
                }
            }
        }
        let _ = writeln!(out);
    }

    out
}

fn render_tag_change(out: &mut String, change: &super::delta::FieldChange) {
    let before = serde_json::from_value(change.old.clone()).unwrap_or_default();
    let after = serde_json::from_value(change.new.clone()).unwrap_or_default();
    let diff = diff_tags(&before, &after);

    for (k, v) in &diff.added {
        let _ = writeln!(out, "  - tags: + `{k}={v}`");
    }
    for (k, v) in &diff.removed {
        let _ = writeln!(out, "  - tags: - `{k}={v}`");
    }
    for (k, (old, new)) in &diff.changed {
        let _ = writeln!(out, "  - tags: `{k}`: `{old}` → `{new}`");
    }
}
