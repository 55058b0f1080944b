// ── Legacy producer fields ─────────────────────────────────────────────────
//
// Stores written by older hook producers hold the same data under other
// field names. Import renames them before validation:
//
//   patterns        q_value → value, visits → update_count
//   file_sequences  from_file → prev_file, to_file → next_file
//   errors          code → id, error_type → signature, message → context,
//                   fixes → resolution (one fix per line)
//   agents          agent_type → role, created_at defaults to 0
//   edges           source → from_id, target → to_id, kind = coordination
//   trajectories    flat state/action/reward → one sealed step
//
// An empty embedding array means "no embedding" and is dropped. A field
// already present in the current shape is never overwritten; the legacy
// field then rides along in `_extra`.

use crate::atoms::constants::*;
use crate::atoms::types::EdgeKind;
use crate::engine::schema::CollectionSpec;
use crate::engine::store::Record;
use serde_json::{Map, Value};

/// Rewrite `record` in place into `spec`'s current field names.
pub(crate) fn adapt(spec: &CollectionSpec, record: &mut Record) {
    for field in spec.embedding_fields() {
        if matches!(record.get(&field.name), Some(Value::Array(a)) if a.is_empty()) {
            record.remove(&field.name);
        }
    }

    match spec.name.as_str() {
        PATTERNS => {
            rename(record, "q_value", "value");
            rename(record, "visits", "update_count");
        }
        FILE_SEQUENCES => {
            rename(record, "from_file", "prev_file");
            rename(record, "to_file", "next_file");
        }
        ERRORS => {
            rename(record, "code", COL_ID);
            rename(record, "error_type", "signature");
            rename(record, "message", "context");
            if !record.contains_key("resolution") {
                let fixes = match record.get("fixes") {
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|f| f.as_str().map(str::to_owned))
                        .collect::<Option<Vec<String>>>(),
                    _ => None,
                };
                if let Some(fixes) = fixes {
                    record.remove("fixes");
                    if !fixes.is_empty() {
                        record.insert("resolution".into(), Value::String(fixes.join("\n")));
                    }
                }
            }
        }
        AGENTS => {
            rename(record, "agent_type", "role");
            if record.contains_key("role") {
                record.entry("created_at").or_insert(Value::from(0));
            }
        }
        EDGES => {
            rename(record, "source", "from_id");
            rename(record, "target", "to_id");
            if record.contains_key("from_id") {
                record.entry("kind").or_insert(Value::from(EdgeKind::Coordination.as_str()));
            }
        }
        TRAJECTORIES => fold_flat_trajectory(record),
        _ => {}
    }
}

fn rename(record: &mut Record, from: &str, to: &str) {
    if record.contains_key(to) {
        return;
    }
    if let Some(v) = record.remove(from) {
        record.insert(to.to_string(), v);
    }
}

/// `{state, action, reward, timestamp}` is one finished step.
fn fold_flat_trajectory(record: &mut Record) {
    if record.contains_key("steps") || !record.contains_key("state") {
        return;
    }
    let mut step = Map::new();
    for name in ["state", "action", "reward"] {
        if let Some(v) = record.remove(name) {
            step.insert(name.to_string(), v);
        }
    }
    if let Some(reward) = step.get("reward").cloned() {
        record.entry("final_score").or_insert(reward);
    }
    record.insert("steps".into(), Value::Array(vec![Value::Object(step)]));
    record.entry("sealed").or_insert(Value::Bool(true));
    if let Some(ts) = record.remove("timestamp") {
        record.entry("started_at").or_insert(ts.clone());
        record.entry("ended_at").or_insert(ts);
    }
}
