// ── Learning writers ───────────────────────────────────────────────────────
//
// The producers behind the hook commands: memories, the legacy Q-table,
// per-algorithm learning tables, trajectories, error patterns, and the
// registration helpers for agents and edges.
//
// Everything writes through a session; nothing here commits.

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::Embedder;
use crate::atoms::types::{
    Agent, Edge, EdgeKind, ErrorRecord, LearningData, Memory, MemoryType, Pattern, Trajectory,
};
use crate::engine::embedding::cosine_similarity;
use crate::engine::store::{RecordStore, Session};
use crate::engine::{now_ms, now_secs};
use log::{debug, warn};
use serde_json::Value;

// ── Memories ───────────────────────────────────────────────────────────────

/// Embed and store a memory. When the embedder is unavailable or returns a
/// vector of the wrong width, the memory is kept text-only and tagged
/// `embedding_model = "fallback"` instead of being dropped.
pub fn remember<E: Embedder + ?Sized>(
    session: &mut Session<'_>,
    embedder: &E,
    memory_type: MemoryType,
    content: &str,
) -> EngineResult<Memory> {
    let (embedding, embedding_model) = match embedder.embed(content) {
        Ok(vector) => match session.guard().check(MEMORIES, &vector) {
            Ok(()) => (Some(vector), Some(embedder.model_name())),
            Err(e) => {
                warn!("[store] {}, keeping memory text-only", e);
                (None, Some(FALLBACK_EMBEDDING_MODEL.to_string()))
            }
        },
        Err(EngineError::EmbeddingUnavailable(detail)) => {
            warn!("[store] Embedding unavailable ({}), keeping memory text-only", detail);
            (None, Some(FALLBACK_EMBEDDING_MODEL.to_string()))
        }
        Err(e) => return Err(e),
    };

    let memory = Memory {
        id: format!("mem_{}", uuid::Uuid::new_v4()),
        content: content.to_string(),
        embedding,
        memory_type,
        timestamp: now_secs(),
        embedding_model,
        metadata: None,
    };
    session.put_record(&memory)?;
    Ok(memory)
}

/// Top `k` memories for `query`. Embedded memories are ranked by cosine
/// similarity; text-only memories (or every memory, when the embedder is
/// down) by the share of query terms their content contains.
pub fn recall<E: Embedder + ?Sized>(
    store: &RecordStore,
    embedder: &E,
    query: &str,
    k: usize,
) -> EngineResult<Vec<(Memory, f64)>> {
    let query_vec = match embedder.embed(query) {
        Ok(v) => Some(v),
        Err(EngineError::EmbeddingUnavailable(detail)) => {
            warn!("[store] Embedding unavailable ({}), recalling by text", detail);
            None
        }
        Err(e) => return Err(e),
    };
    let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();

    let mut scored = Vec::new();
    for row in store.query(MEMORIES, |_| true)? {
        let memory: Memory = serde_json::from_value(Value::Object(row?))?;
        let score = match (&query_vec, &memory.embedding) {
            (Some(q), Some(e)) => cosine_similarity(q, e),
            _ => term_overlap(&terms, &memory.content),
        };
        if score > 0.0 {
            scored.push((memory, score));
        }
    }
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    Ok(scored)
}

fn term_overlap(terms: &[String], content: &str) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let content = content.to_lowercase();
    let hits = terms.iter().filter(|t| content.contains(t.as_str())).count();
    hits as f64 / terms.len() as f64
}

// ── Q-table ────────────────────────────────────────────────────────────────

/// One Q-learning step on the legacy `patterns` table:
/// `value += alpha * (reward - value)`.
pub fn update_q(
    session: &mut Session<'_>,
    state: &str,
    action: &str,
    reward: f64,
) -> EngineResult<Pattern> {
    let mut pattern = session
        .get_record::<Pattern>(&Pattern::key(state, action))?
        .unwrap_or(Pattern {
            state: state.to_string(),
            action: action.to_string(),
            value: 0.0,
            update_count: 0,
            last_update: None,
        });
    pattern.value += Q_LEARNING_RATE * (reward - pattern.value);
    pattern.update_count += 1;
    pattern.last_update = Some(now_secs());
    session.put_record(&pattern)?;
    debug!("[store] Q({}, {}) = {:.4}", state, action, pattern.value);
    Ok(pattern)
}

/// Highest-valued action recorded for `state`.
pub fn best_action(store: &RecordStore, state: &str) -> EngineResult<Option<Pattern>> {
    let mut best: Option<Pattern> = None;
    for row in store.query(PATTERNS, |r| r.get("state").and_then(Value::as_str) == Some(state))? {
        let p: Pattern = serde_json::from_value(Value::Object(row?))?;
        if best.as_ref().map_or(true, |b| p.value > b.value) {
            best = Some(p);
        }
    }
    Ok(best)
}

// ── Multi-algorithm tables ─────────────────────────────────────────────────

/// Replace one algorithm's opaque table.
pub fn save_learning_data(
    session: &mut Session<'_>,
    algorithm_id: &str,
    table_data: Value,
) -> EngineResult<LearningData> {
    let data = LearningData {
        algorithm_id: algorithm_id.to_string(),
        table_data,
        updated_at: Some(now_secs()),
    };
    session.put_record(&data)?;
    Ok(data)
}

// ── Trajectories ───────────────────────────────────────────────────────────

/// Open a trajectory and buffer it.
pub fn begin_trajectory(session: &mut Session<'_>) -> EngineResult<Trajectory> {
    let t = Trajectory::begin(format!("traj_{}", uuid::Uuid::new_v4()), now_ms());
    session.put_record(&t)?;
    Ok(t)
}

fn load_trajectory(session: &Session<'_>, id: &str) -> EngineResult<Trajectory> {
    session
        .get_record::<Trajectory>(id)?
        .ok_or_else(|| EngineError::invalid_record(TRAJECTORIES, format!("no trajectory {}", id)))
}

/// Append a step to a stored, unsealed trajectory.
pub fn append_step(
    session: &mut Session<'_>,
    id: &str,
    state: &str,
    action: &str,
    reward: f64,
) -> EngineResult<Trajectory> {
    let mut t = load_trajectory(session, id)?;
    t.push_step(state, action, reward)?;
    session.put_record(&t)?;
    Ok(t)
}

/// Seal a stored trajectory, optionally attaching an embedding of the episode.
pub fn seal_trajectory(
    session: &mut Session<'_>,
    id: &str,
    final_score: f64,
    embedding: Option<Vec<f32>>,
) -> EngineResult<Trajectory> {
    let mut t = load_trajectory(session, id)?;
    t.seal(final_score, now_ms())?;
    if embedding.is_some() {
        t.embedding = embedding;
    }
    session.put_record(&t)?;
    Ok(t)
}

// ── Errors ─────────────────────────────────────────────────────────────────

/// Extract compiler error codes from `stderr` and count them in `errors`.
/// Known fixes (`resolution`) are kept.
pub fn record_error(
    session: &mut Session<'_>,
    command: &str,
    stderr: &str,
) -> EngineResult<Vec<ErrorRecord>> {
    let mut recorded: Vec<ErrorRecord> = Vec::new();
    for line in stderr.lines() {
        let Some(code) = extract_error_code(line) else {
            continue;
        };
        let mut record = match recorded.iter().position(|r| r.id == code) {
            Some(i) => recorded.remove(i),
            None => session.get_record::<ErrorRecord>(&code)?.unwrap_or(ErrorRecord {
                id: code.clone(),
                signature: classify_error(&code).to_string(),
                context: None,
                resolution: None,
                occurrences: 0,
            }),
        };
        record.occurrences += 1;
        let excerpt: String = line.trim().chars().take(200).collect();
        record.context = Some(format!("{}: {}", command, excerpt));
        session.put_record(&record)?;
        recorded.push(record);
    }
    Ok(recorded)
}

/// `error[E0308]` → `E0308`; `TS2322` → `TS2322`.
fn extract_error_code(line: &str) -> Option<String> {
    if let Some(start) = line.find("error[E") {
        let rest = &line[start + "error[".len()..];
        let end = rest.find(']')?;
        let code = &rest[..end];
        if code.len() > 1 && code[1..].chars().all(|c| c.is_ascii_digit()) {
            return Some(code.to_string());
        }
    }
    line.match_indices("TS").find_map(|(start, _)| {
        let code: String =
            line[start..].chars().take_while(|c| c.is_ascii_alphanumeric()).collect();
        (code.len() >= 5 && code[2..].chars().all(|c| c.is_ascii_digit())).then_some(code)
    })
}

fn classify_error(code: &str) -> &'static str {
    match code {
        c if c.starts_with("E03") => "type-error",
        c if c.starts_with("E04") => "resolution-error",
        c if c.starts_with("E05") => "lifetime-error",
        c if c.starts_with("TS2") => "typescript-type-error",
        _ => "unknown",
    }
}

// ── Agents and edges ───────────────────────────────────────────────────────
// No hook writes these automatically; callers that coordinate agents or
// build a memory graph register them explicitly.

pub fn register_agent(session: &mut Session<'_>, id: &str, role: &str) -> EngineResult<Agent> {
    let agent = Agent { id: id.to_string(), role: role.to_string(), created_at: now_secs() };
    session.put_record(&agent)?;
    Ok(agent)
}

pub fn link(
    session: &mut Session<'_>,
    from_id: &str,
    to_id: &str,
    kind: EdgeKind,
    weight: f64,
) -> EngineResult<Edge> {
    let edge = Edge { from_id: from_id.to_string(), to_id: to_id.to_string(), kind, weight };
    session.put_record(&edge)?;
    Ok(edge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::embedding::HashEmbedder;
    use crate::engine::schema::SchemaRegistry;

    struct Offline;

    impl Embedder for Offline {
        fn dimensions(&self) -> usize {
            64
        }
        fn embed(&self, _text: &str) -> EngineResult<Vec<f32>> {
            Err(EngineError::EmbeddingUnavailable("model not loaded".into()))
        }
    }

    fn store(dim: Option<usize>) -> RecordStore {
        RecordStore::open_in_memory(SchemaRegistry::standard(dim).unwrap()).unwrap()
    }

    #[test]
    fn remember_and_recall() {
        let s = store(None);
        let e = HashEmbedder::default();
        let mut session = s.begin_session().unwrap();
        remember(&mut session, &e, MemoryType::Edit, "edited the parser module").unwrap();
        remember(&mut session, &e, MemoryType::Command, "cargo test --workspace").unwrap();
        session.commit().unwrap();

        let hits = recall(&s, &e, "edited the parser module", 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.content, "edited the parser module");
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(hits[0].0.embedding_model.as_deref(), Some("hash-64"));
    }

    #[test]
    fn remember_falls_back_on_width_mismatch() {
        let s = store(Some(384));
        let mut session = s.begin_session().unwrap();
        let m = remember(&mut session, &HashEmbedder::new(64), MemoryType::General, "x").unwrap();
        assert!(m.embedding.is_none());
        assert_eq!(m.embedding_model.as_deref(), Some(FALLBACK_EMBEDDING_MODEL));
        session.commit().unwrap();
        assert_eq!(s.count(MEMORIES).unwrap(), 1);
    }

    #[test]
    fn remember_falls_back_when_embedder_is_down() {
        let s = store(None);
        let mut session = s.begin_session().unwrap();
        let m = remember(&mut session, &Offline, MemoryType::Decision, "use sqlite").unwrap();
        assert_eq!(m.embedding_model.as_deref(), Some(FALLBACK_EMBEDDING_MODEL));
        session.commit().unwrap();

        let hits = recall(&s, &Offline, "sqlite", 5).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn q_update_moves_toward_reward() {
        let s = store(None);
        let mut session = s.begin_session().unwrap();
        let p = update_q(&mut session, "edit_rs", "coder", 1.0).unwrap();
        assert!((p.value - 0.1).abs() < 1e-9);
        let p = update_q(&mut session, "edit_rs", "coder", 1.0).unwrap();
        assert!((p.value - 0.19).abs() < 1e-9);
        assert_eq!(p.update_count, 2);
        update_q(&mut session, "edit_rs", "reviewer", 0.05).unwrap();
        session.commit().unwrap();
        assert_eq!(best_action(&s, "edit_rs").unwrap().unwrap().action, "coder");
        assert!(best_action(&s, "other").unwrap().is_none());
    }

    #[test]
    fn separator_in_state_or_action_keeps_entries_apart() {
        let s = store(None);
        let mut session = s.begin_session().unwrap();
        update_q(&mut session, "a|b", "c", 1.0).unwrap();
        update_q(&mut session, "a", "b|c", 0.5).unwrap();
        session.commit().unwrap();
        assert_eq!(s.count(PATTERNS).unwrap(), 2);
        let first = best_action(&s, "a|b").unwrap().unwrap();
        assert_eq!(first.action, "c");
        assert!((first.value - 0.1).abs() < 1e-9);
        assert_eq!(first.update_count, 1);
        assert_eq!(best_action(&s, "a").unwrap().unwrap().action, "b|c");
    }

    #[test]
    fn trajectory_lifecycle() {
        let s = store(None);
        let mut session = s.begin_session().unwrap();
        let t = begin_trajectory(&mut session).unwrap();
        append_step(&mut session, &t.id, "s", "a", 0.5).unwrap();
        let sealed = seal_trajectory(&mut session, &t.id, 0.9, None).unwrap();
        assert!(sealed.sealed);
        assert_eq!(sealed.steps.len(), 1);
        assert!(matches!(
            append_step(&mut session, &t.id, "s", "b", 0.1),
            Err(EngineError::InvalidRecord { .. })
        ));
        session.commit().unwrap();
        assert_eq!(s.count(TRAJECTORIES).unwrap(), 1);
    }

    #[test]
    fn error_codes_are_extracted_and_counted() {
        assert_eq!(extract_error_code("error[E0308]: mismatched types").as_deref(), Some("E0308"));
        assert_eq!(
            extract_error_code("src/a.ts(3,5): error TS2322: Type 'x'").as_deref(),
            Some("TS2322")
        );
        assert_eq!(extract_error_code("warning: unused variable"), None);
        assert_eq!(
            extract_error_code("TSC RESULTS: error TS2322: Type 'x'").as_deref(),
            Some("TS2322")
        );
        assert_eq!(extract_error_code("TSLint TSX found"), None);

        let s = store(None);
        let stderr = "error[E0308]: mismatched types\n  --> src/main.rs\nerror[E0308]: again\n";
        let mut session = s.begin_session().unwrap();
        let recorded = record_error(&mut session, "cargo build", stderr).unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].occurrences, 2);
        assert_eq!(recorded[0].signature, "type-error");
        session.commit().unwrap();

        let mut session = s.begin_session().unwrap();
        let again = record_error(&mut session, "cargo build", "error[E0308]: x").unwrap();
        assert_eq!(again[0].occurrences, 3);
    }

    #[test]
    fn agents_and_edges_are_explicit() {
        let s = store(None);
        let mut session = s.begin_session().unwrap();
        register_agent(&mut session, "coder-1", "coder").unwrap();
        link(&mut session, "mem_a", "mem_b", EdgeKind::Temporal, 0.7).unwrap();
        session.commit().unwrap();
        assert_eq!(s.count(AGENTS).unwrap(), 1);
        assert!(s.get(EDGES, "mem_a|mem_b|temporal").unwrap().is_some());
    }
}
