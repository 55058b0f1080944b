// Lazy record stream.
// Pages through a collection by insertion sequence (keyset pagination), one
// page per lock acquisition, so a caller can stop early without the rest of
// the collection ever being read. Finite and not restartable.

use super::codec::{self, Record};
use super::RecordStore;
use crate::atoms::constants::COL_SEQ;
use crate::atoms::error::EngineResult;
use crate::engine::schema::CollectionSpec;
use rusqlite::params;
use std::collections::VecDeque;

pub struct RecordQuery<'a, P> {
    store: &'a RecordStore,
    spec: &'a CollectionSpec,
    predicate: P,
    cursor: i64,
    buffer: VecDeque<Record>,
    exhausted: bool,
}

impl<'a, P> RecordQuery<'a, P>
where
    P: FnMut(&Record) -> bool,
{
    pub(crate) fn new(store: &'a RecordStore, spec: &'a CollectionSpec, predicate: P) -> Self {
        RecordQuery {
            store,
            spec,
            predicate,
            cursor: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn fetch_page(&mut self) -> EngineResult<()> {
        let page = self.store.page_size();
        let sql = format!(
            "SELECT {cols}, {seq} FROM {t} WHERE {seq} > ?1 ORDER BY {seq} LIMIT ?2",
            cols = codec::select_columns(self.spec),
            seq = codec::quote_ident(COL_SEQ),
            t = codec::quote_ident(&self.spec.name),
        );
        let seq_index = self.spec.fields.len() + 2;
        let spec = self.spec;
        let store = self.store;

        let conn = store.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![self.cursor, page as i64], |row| {
            Ok((row.get::<_, i64>(seq_index)?, codec::decode_row(spec, row)?))
        })?;

        let mut fetched = 0;
        for row in rows {
            let (seq, record) = row?;
            self.cursor = seq;
            self.buffer.push_back(record);
            fetched += 1;
        }
        if fetched < page {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl<P> Iterator for RecordQuery<'_, P>
where
    P: FnMut(&Record) -> bool,
{
    type Item = EngineResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            while let Some(record) = self.buffer.pop_front() {
                if (self.predicate)(&record) {
                    return Some(Ok(record));
                }
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                self.buffer.clear();
                return Some(Err(e));
            }
        }
    }
}
