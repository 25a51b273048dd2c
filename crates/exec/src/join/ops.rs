//! Join build-sink and probe operators.
//!
//! The build side is a sink pipeline: drivers buffer chunks, and the last
//! one to finish concatenates them, builds the hash table, publishes
//! runtime filters, and releases the build barrier. Probe drivers hold a
//! precondition on that barrier, then read the immutable table without
//! locks; the last probe driver to finish emits the unmatched build rows
//! for right/full joins.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use basalt_chunk::hash::FNV_SEED;
use basalt_chunk::{Chunk, Column};
use basalt_common::{EngineError, PlanNodeId, Result};

use crate::expr::Expr;
use crate::keys::decay_const;
use crate::observer::Observable;
use crate::op::{eval_conjuncts, Operator, OperatorFactory};
use crate::state::{InRuntimeFilter, RuntimeState};

use super::table::JoinHashTable;
use super::{JoinState, JoinType};

const PROBE_PENDING_CAP: usize = 4;

/// Build-side sink.
pub struct JoinBuildSinkOperator {
    node: PlanNodeId,
    join: Arc<JoinState>,
    buffered: Vec<Chunk>,
    finished: bool,
}

impl JoinBuildSinkOperator {
    fn finish_build(&mut self, state: &RuntimeState) -> Result<()> {
        let chunks = std::mem::take(&mut *self.join.build_inputs.lock());
        let mut iter = chunks.into_iter();
        let mut build_chunk = match iter.next() {
            Some(first) => first,
            None => self.empty_build_chunk()?,
        };
        for chunk in iter {
            build_chunk.append_chunk(&chunk)?;
        }

        let desc = &self.join.desc;
        let key_cols = desc
            .equi
            .iter()
            .map(|e| e.build.evaluate(&build_chunk).and_then(|c| decay_const(&c)))
            .collect::<Result<Vec<_>>>()?;
        let null_safe: Vec<bool> = desc.equi.iter().map(|e| e.null_safe).collect();
        let table = JoinHashTable::build(
            build_chunk,
            key_cols,
            null_safe,
            desc.stores_nulls(),
            desc.dedup_build(),
        )?;

        self.publish_runtime_filters(state, &table);

        if self.join.table.set(table).is_err() {
            return Err(EngineError::Internal(
                "join build completed twice".to_string(),
            ));
        }
        self.join.build_done.notify();
        Ok(())
    }

    fn empty_build_chunk(&self) -> Result<Chunk> {
        let mut chunk = Chunk::new();
        for s in &self.join.desc.build_slots {
            chunk.append_column_for_slot(s.slot, Column::new_for_type(s.ptype, s.nullable)?)?;
        }
        Ok(chunk)
    }

    /// Synthesize IN filters from a small build side and hand them to the
    /// probe-side scans. Disabled under null-safe equality (the filter would
    /// drop needed nulls) and when the probe child is a remote exchange.
    fn publish_runtime_filters(&self, state: &RuntimeState, table: &JoinHashTable) {
        let desc = &self.join.desc;
        if desc.runtime_filters.is_empty()
            || desc.probe_is_exchange
            || desc.any_null_safe()
            || table.build_rows() > state.config().runtime_filter_max_build_rows
        {
            return;
        }
        for rf in &desc.runtime_filters {
            let key_col = table.key_column(rf.key_index);
            let mut values = std::collections::HashSet::new();
            for row in 0..table.build_rows() {
                let v = key_col.get(row);
                if !v.is_null() {
                    values.insert(v);
                }
            }
            tracing::debug!(
                node = %self.node,
                target = %rf.target_scan,
                values = values.len(),
                "publishing join runtime filter"
            );
            state.filter_hub().publish(
                rf.target_scan,
                InRuntimeFilter {
                    build_node: self.node,
                    slot: rf.probe_slot,
                    values,
                },
            );
        }
    }
}

impl Operator for JoinBuildSinkOperator {
    fn name(&self) -> &'static str {
        "hash_join_build"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn need_input(&self) -> bool {
        !self.finished
    }

    fn has_output(&self) -> bool {
        false
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn push_chunk(&mut self, _state: &RuntimeState, chunk: Chunk) -> Result<()> {
        if !chunk.is_empty() {
            self.buffered.push(chunk);
        }
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Ok(None)
    }

    fn set_finishing(&mut self, state: &RuntimeState) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.join
            .build_inputs
            .lock()
            .append(&mut self.buffered);
        if self.join.build_drivers_open.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish_build(state)?;
        }
        Ok(())
    }

    fn is_sink(&self) -> bool {
        true
    }
}

/// Factory for [`JoinBuildSinkOperator`].
pub struct JoinBuildSinkFactory {
    node: PlanNodeId,
    join: Arc<JoinState>,
}

impl JoinBuildSinkFactory {
    /// Create the build-sink factory over the join's shared state.
    pub fn new(node: PlanNodeId, join: Arc<JoinState>) -> Self {
        Self { node, join }
    }
}

impl OperatorFactory for JoinBuildSinkFactory {
    fn name(&self) -> &'static str {
        "hash_join_build"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn create(&self, _degree: usize, _driver_seq: usize) -> Result<Box<dyn Operator>> {
        self.join.build_drivers_open.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(JoinBuildSinkOperator {
            node: self.node,
            join: Arc::clone(&self.join),
            buffered: Vec::new(),
            finished: false,
        }))
    }
}

/// Probe-side operator.
pub struct JoinProbeOperator {
    node: PlanNodeId,
    join: Arc<JoinState>,
    pending: VecDeque<Chunk>,
    finishing: bool,
    counted_down: bool,
}

impl JoinProbeOperator {
    fn emit(&mut self, chunk: Chunk) -> Result<()> {
        let desc = &self.join.desc;
        let chunk = if desc.conjuncts.is_empty() {
            chunk
        } else {
            let keep = eval_conjuncts(&desc.conjuncts, &chunk)?;
            chunk.filter(&keep)?
        };
        if !chunk.is_empty() {
            self.pending.push_back(chunk);
        }
        Ok(())
    }

    fn probe_columns_chunk(
        &self,
        out: &mut Chunk,
        probe_chunk: &Chunk,
        indices: &[u32],
        widen: bool,
    ) -> Result<()> {
        for s in &self.join.desc.probe_slots {
            let src = probe_chunk.column_by_slot(s.slot)?;
            let mut dst = Column::new_for_type(s.ptype, s.nullable || widen)?;
            dst.append_selective(src, indices)?;
            out.append_column_for_slot(s.slot, dst)?;
        }
        Ok(())
    }

    fn null_probe_columns(&self, out: &mut Chunk, rows: usize) -> Result<()> {
        for s in &self.join.desc.probe_slots {
            let mut dst = Column::new_for_type(s.ptype, true)?;
            dst.append_nulls(rows)?;
            out.append_column_for_slot(s.slot, dst)?;
        }
        Ok(())
    }

    fn build_columns_chunk(
        &self,
        out: &mut Chunk,
        table: &JoinHashTable,
        indices: &[u32],
        widen: bool,
    ) -> Result<()> {
        for s in &self.join.desc.build_slots {
            let src = table.build_chunk().column_by_slot(s.slot)?;
            let mut dst = Column::new_for_type(s.ptype, s.nullable || widen)?;
            dst.append_selective(src, indices)?;
            out.append_column_for_slot(s.slot, dst)?;
        }
        Ok(())
    }

    fn null_build_columns(&self, out: &mut Chunk, rows: usize) -> Result<()> {
        for s in &self.join.desc.build_slots {
            let mut dst = Column::new_for_type(s.ptype, true)?;
            dst.append_nulls(rows)?;
            out.append_column_for_slot(s.slot, dst)?;
        }
        Ok(())
    }

    /// Candidate-pair chunk used to evaluate non-equi conjuncts: both sides
    /// present, original nullability.
    fn pair_chunk(
        &self,
        table: &JoinHashTable,
        probe_chunk: &Chunk,
        pair_probe: &[u32],
        pair_build: &[u32],
    ) -> Result<Chunk> {
        let mut out = Chunk::new();
        self.probe_columns_chunk(&mut out, probe_chunk, pair_probe, false)?;
        self.build_columns_chunk(&mut out, table, pair_build, false)?;
        Ok(out)
    }

    fn probe_chunk_against_table(&mut self, probe_chunk: Chunk) -> Result<()> {
        let join = Arc::clone(&self.join);
        let desc = &join.desc;
        let table = join
            .table()
            .ok_or_else(|| EngineError::Internal("probe started before build".to_string()))?;
        let rows = probe_chunk.num_rows();
        if rows == 0 {
            return Ok(());
        }

        let probe_keys = desc
            .equi
            .iter()
            .map(|e| e.probe.evaluate(&probe_chunk).and_then(|c| decay_const(&c)))
            .collect::<Result<Vec<_>>>()?;
        let mut hashes = vec![FNV_SEED; rows];
        for col in &probe_keys {
            col.fnv_hash(&mut hashes)?;
        }

        let mut pair_probe: Vec<u32> = Vec::new();
        let mut pair_build: Vec<u32> = Vec::new();
        for row in 0..rows {
            for cand in table.candidates(hashes[row]) {
                if table.keys_equal(cand, &probe_keys, row) {
                    pair_probe.push(row as u32);
                    pair_build.push(cand as u32);
                }
            }
        }

        if !desc.other_conjuncts.is_empty() && !pair_probe.is_empty() {
            let candidates = self.pair_chunk(table, &probe_chunk, &pair_probe, &pair_build)?;
            let keep = eval_conjuncts(&desc.other_conjuncts, &candidates)?;
            let mut kept_probe = Vec::with_capacity(pair_probe.len());
            let mut kept_build = Vec::with_capacity(pair_build.len());
            for (i, k) in keep.iter().enumerate() {
                if *k {
                    kept_probe.push(pair_probe[i]);
                    kept_build.push(pair_build[i]);
                }
            }
            pair_probe = kept_probe;
            pair_build = kept_build;
        }

        let mut match_count = vec![0u32; rows];
        for &p in &pair_probe {
            match_count[p as usize] += 1;
        }
        if matches!(
            desc.join_type,
            JoinType::RightOuter | JoinType::FullOuter | JoinType::RightAnti
        ) {
            for &b in &pair_build {
                table.mark_matched(b as usize);
            }
        }

        match desc.join_type {
            JoinType::Inner | JoinType::LeftOuter | JoinType::RightOuter | JoinType::FullOuter => {
                if !pair_probe.is_empty() {
                    let mut out = Chunk::new();
                    self.probe_columns_chunk(
                        &mut out,
                        &probe_chunk,
                        &pair_probe,
                        desc.join_type.probe_output_nullable(),
                    )?;
                    self.build_columns_chunk(
                        &mut out,
                        table,
                        &pair_build,
                        desc.join_type.build_output_nullable(),
                    )?;
                    self.emit(out)?;
                }
                if desc.join_type.emits_unmatched_probe() {
                    let unmatched: Vec<u32> = (0..rows as u32)
                        .filter(|&r| match_count[r as usize] == 0)
                        .collect();
                    if !unmatched.is_empty() {
                        let mut out = Chunk::new();
                        self.probe_columns_chunk(
                            &mut out,
                            &probe_chunk,
                            &unmatched,
                            desc.join_type.probe_output_nullable(),
                        )?;
                        self.null_build_columns(&mut out, unmatched.len())?;
                        self.emit(out)?;
                    }
                }
            }
            JoinType::LeftSemi => {
                let matched: Vec<u32> = (0..rows as u32)
                    .filter(|&r| match_count[r as usize] > 0)
                    .collect();
                if !matched.is_empty() {
                    let mut out = Chunk::new();
                    self.probe_columns_chunk(&mut out, &probe_chunk, &matched, false)?;
                    self.emit(out)?;
                }
            }
            JoinType::LeftAnti => {
                let unmatched: Vec<u32> = (0..rows as u32)
                    .filter(|&r| match_count[r as usize] == 0)
                    .collect();
                if !unmatched.is_empty() {
                    let mut out = Chunk::new();
                    self.probe_columns_chunk(&mut out, &probe_chunk, &unmatched, false)?;
                    self.emit(out)?;
                }
            }
            JoinType::RightSemi => {
                let mut first_matches: Vec<u32> = Vec::new();
                for &b in &pair_build {
                    if table.mark_matched(b as usize) {
                        first_matches.push(b);
                    }
                }
                if !first_matches.is_empty() {
                    let mut out = Chunk::new();
                    self.build_columns_chunk(&mut out, table, &first_matches, false)?;
                    self.emit(out)?;
                }
            }
            JoinType::RightAnti => {
                // Matches were recorded above; unmatched rows emit at the end.
            }
        }
        Ok(())
    }

    fn emit_unmatched_build(&mut self, state: &RuntimeState) -> Result<()> {
        let join = Arc::clone(&self.join);
        let desc = &join.desc;
        let table = join
            .table()
            .ok_or_else(|| EngineError::Internal("finishing probe before build".to_string()))?;
        let unmatched = table.unmatched_rows();
        for batch in unmatched.chunks(state.chunk_size()) {
            let mut out = Chunk::new();
            if desc.join_type.emits_probe_columns() {
                self.null_probe_columns(&mut out, batch.len())?;
            }
            self.build_columns_chunk(
                &mut out,
                table,
                batch,
                desc.join_type.build_output_nullable(),
            )?;
            self.emit(out)?;
        }
        Ok(())
    }
}

impl Operator for JoinProbeOperator {
    fn name(&self) -> &'static str {
        "hash_join_probe"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn need_input(&self) -> bool {
        !self.finishing && self.pending.len() < PROBE_PENDING_CAP
    }

    fn has_output(&self) -> bool {
        !self.pending.is_empty()
    }

    fn is_finished(&self) -> bool {
        self.finishing && self.pending.is_empty()
    }

    fn push_chunk(&mut self, _state: &RuntimeState, chunk: Chunk) -> Result<()> {
        self.probe_chunk_against_table(chunk)
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Ok(self.pending.pop_front())
    }

    fn set_finishing(&mut self, state: &RuntimeState) -> Result<()> {
        if self.finishing {
            return Ok(());
        }
        self.finishing = true;
        if !self.counted_down {
            self.counted_down = true;
            let last = self.join.probe_drivers_open.fetch_sub(1, Ordering::AcqRel) == 1;
            if last && self.join.desc.join_type.emits_unmatched_build() {
                self.emit_unmatched_build(state)?;
            }
        }
        Ok(())
    }

    fn set_finished(&mut self, _state: &RuntimeState) -> Result<()> {
        self.finishing = true;
        self.pending.clear();
        if !self.counted_down {
            self.counted_down = true;
            self.join.probe_drivers_open.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn precondition_ready(&self) -> bool {
        self.join.table().is_some()
    }

    fn pending_observable(&self) -> Option<Arc<Observable>> {
        Some(Arc::clone(&self.join.build_done))
    }
}

/// Factory for [`JoinProbeOperator`].
pub struct JoinProbeFactory {
    node: PlanNodeId,
    join: Arc<JoinState>,
}

impl JoinProbeFactory {
    /// Create the probe factory over the join's shared state.
    pub fn new(node: PlanNodeId, join: Arc<JoinState>) -> Self {
        Self { node, join }
    }
}

impl OperatorFactory for JoinProbeFactory {
    fn name(&self) -> &'static str {
        "hash_join_probe"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn create(&self, _degree: usize, _driver_seq: usize) -> Result<Box<dyn Operator>> {
        self.join.probe_drivers_open.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(JoinProbeOperator {
            node: self.node,
            join: Arc::clone(&self.join),
            pending: VecDeque::new(),
            finishing: false,
            counted_down: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::{EquiCond, JoinDesc, JoinSlot};
    use basalt_chunk::{Datum, PrimitiveType};
    use basalt_common::{EngineConfig, FragmentInstanceId, MemTracker, QueryId, SlotId};

    fn runtime_state() -> RuntimeState {
        RuntimeState::new(
            QueryId { hi: 0, lo: 1 },
            FragmentInstanceId { hi: 0, lo: 2 },
            EngineConfig::default(),
            MemTracker::root("test", None),
        )
    }

    fn desc(join_type: JoinType) -> JoinDesc {
        JoinDesc {
            join_type,
            equi: vec![EquiCond {
                probe: Expr::slot(SlotId(0), PrimitiveType::Int64, false),
                build: Expr::slot(SlotId(10), PrimitiveType::Int64, false),
                null_safe: false,
            }],
            other_conjuncts: vec![],
            conjuncts: vec![],
            probe_slots: vec![
                JoinSlot {
                    slot: SlotId(0),
                    ptype: PrimitiveType::Int64,
                    nullable: false,
                },
                JoinSlot {
                    slot: SlotId(1),
                    ptype: PrimitiveType::Varchar,
                    nullable: false,
                },
            ],
            build_slots: vec![
                JoinSlot {
                    slot: SlotId(10),
                    ptype: PrimitiveType::Int64,
                    nullable: false,
                },
                JoinSlot {
                    slot: SlotId(11),
                    ptype: PrimitiveType::Varchar,
                    nullable: false,
                },
            ],
            runtime_filters: vec![],
            probe_is_exchange: false,
        }
    }

    fn build_side() -> Chunk {
        Chunk::from_columns(vec![
            (SlotId(10), Column::int64(&[1, 2, 2])),
            (SlotId(11), Column::varchar(&["a", "b", "c"])),
        ])
        .unwrap()
    }

    fn probe_side() -> Chunk {
        Chunk::from_columns(vec![
            (SlotId(0), Column::int64(&[1, 2, 3])),
            (SlotId(1), Column::varchar(&["x", "y", "z"])),
        ])
        .unwrap()
    }

    fn run_join(join_type: JoinType) -> Vec<Vec<Datum>> {
        let state = runtime_state();
        let join = JoinState::new(desc(join_type));
        let build_factory = JoinBuildSinkFactory::new(PlanNodeId(1), Arc::clone(&join));
        let probe_factory = JoinProbeFactory::new(PlanNodeId(1), Arc::clone(&join));

        let mut build = build_factory.create(1, 0).unwrap();
        build.push_chunk(&state, build_side()).unwrap();
        build.set_finishing(&state).unwrap();

        let mut probe = probe_factory.create(1, 0).unwrap();
        assert!(probe.precondition_ready());
        probe.push_chunk(&state, probe_side()).unwrap();
        probe.set_finishing(&state).unwrap();

        let mut rows = Vec::new();
        while let Some(chunk) = probe.pull_chunk(&state).unwrap() {
            for row in 0..chunk.num_rows() {
                rows.push(
                    (0..chunk.num_columns())
                        .map(|c| chunk.column(c).get(row))
                        .collect::<Vec<_>>(),
                );
            }
        }
        assert!(probe.is_finished());
        rows
    }

    fn s(v: &str) -> Datum {
        Datum::Binary(v.as_bytes().to_vec())
    }

    #[test]
    fn inner_join_emits_matched_pairs() {
        let mut rows = run_join(JoinType::Inner);
        rows.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
        assert_eq!(
            rows,
            vec![
                vec![Datum::Int64(1), s("x"), Datum::Int64(1), s("a")],
                vec![Datum::Int64(2), s("y"), Datum::Int64(2), s("b")],
                vec![Datum::Int64(2), s("y"), Datum::Int64(2), s("c")],
            ]
        );
    }

    #[test]
    fn left_anti_join_emits_unmatched_probe_rows() {
        let rows = run_join(JoinType::LeftAnti);
        assert_eq!(rows, vec![vec![Datum::Int64(3), s("z")]]);
    }

    #[test]
    fn left_outer_extends_unmatched_with_nulls() {
        let rows = run_join(JoinType::LeftOuter);
        assert_eq!(rows.len(), 4);
        let unmatched: Vec<_> = rows
            .iter()
            .filter(|r| r[2] == Datum::Null)
            .collect();
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0][0], Datum::Int64(3));
    }

    #[test]
    fn right_semi_emits_each_matched_build_row_once() {
        let mut rows = run_join(JoinType::RightSemi);
        rows.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
        assert_eq!(
            rows,
            vec![
                vec![Datum::Int64(1), s("a")],
                vec![Datum::Int64(2), s("b")],
                vec![Datum::Int64(2), s("c")],
            ]
        );
    }

    #[test]
    fn right_anti_emits_never_matched_build_rows() {
        let state = runtime_state();
        let join = JoinState::new(desc(JoinType::RightAnti));
        let build_factory = JoinBuildSinkFactory::new(PlanNodeId(1), Arc::clone(&join));
        let probe_factory = JoinProbeFactory::new(PlanNodeId(1), Arc::clone(&join));

        let mut build = build_factory.create(1, 0).unwrap();
        build
            .push_chunk(
                &state,
                Chunk::from_columns(vec![
                    (SlotId(10), Column::int64(&[1, 7])),
                    (SlotId(11), Column::varchar(&["a", "q"])),
                ])
                .unwrap(),
            )
            .unwrap();
        build.set_finishing(&state).unwrap();

        let mut probe = probe_factory.create(1, 0).unwrap();
        probe.push_chunk(&state, probe_side()).unwrap();
        probe.set_finishing(&state).unwrap();
        let chunk = probe.pull_chunk(&state).unwrap().unwrap();
        assert_eq!(chunk.num_rows(), 1);
        assert_eq!(chunk.column(0).get(0), Datum::Int64(7));
    }

    #[test]
    fn full_outer_covers_both_sides() {
        let rows = run_join(JoinType::FullOuter);
        // 3 matches + probe 3 unmatched + no unmatched build rows... build
        // row coverage: 1,2,2 all matched, probe row 3 unmatched.
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn other_conjuncts_turn_matches_into_non_matches() {
        let state = runtime_state();
        let mut d = desc(JoinType::LeftOuter);
        // Keep only candidate pairs whose build string is "b".
        d.other_conjuncts = vec![Expr::Cmp {
            op: crate::expr::CmpOp::Eq,
            left: Box::new(Expr::slot(SlotId(11), PrimitiveType::Varchar, false)),
            right: Box::new(Expr::Literal {
                value: Datum::Binary(b"b".to_vec()),
                ptype: PrimitiveType::Varchar,
            }),
        }];
        let join = JoinState::new(d);
        let build_factory = JoinBuildSinkFactory::new(PlanNodeId(1), Arc::clone(&join));
        let probe_factory = JoinProbeFactory::new(PlanNodeId(1), Arc::clone(&join));
        let mut build = build_factory.create(1, 0).unwrap();
        build.push_chunk(&state, build_side()).unwrap();
        build.set_finishing(&state).unwrap();

        let mut probe = probe_factory.create(1, 0).unwrap();
        probe.push_chunk(&state, probe_side()).unwrap();
        probe.set_finishing(&state).unwrap();

        let mut matched = 0;
        let mut null_extended = 0;
        while let Some(chunk) = probe.pull_chunk(&state).unwrap() {
            for row in 0..chunk.num_rows() {
                if chunk.column(2).get(row) == Datum::Null {
                    null_extended += 1;
                } else {
                    matched += 1;
                }
            }
        }
        // Row 1 loses its only candidate ("a"), row 2 keeps "b", row 3 never
        // matched.
        assert_eq!(matched, 1);
        assert_eq!(null_extended, 2);
    }

    #[test]
    fn small_build_publishes_runtime_in_filter() {
        let state = runtime_state();
        let mut d = desc(JoinType::Inner);
        d.runtime_filters = vec![crate::join::RuntimeFilterDesc {
            target_scan: PlanNodeId(7),
            probe_slot: SlotId(0),
            key_index: 0,
        }];
        let join = JoinState::new(d);
        let build_factory = JoinBuildSinkFactory::new(PlanNodeId(1), Arc::clone(&join));
        let mut build = build_factory.create(1, 0).unwrap();
        build.push_chunk(&state, build_side()).unwrap();
        build.set_finishing(&state).unwrap();

        let filters = state.filter_hub().filters_for(PlanNodeId(7));
        assert_eq!(filters.len(), 1);
        assert!(filters[0].matches(&Datum::Int64(2)));
        assert!(!filters[0].matches(&Datum::Int64(3)));
        assert!(!filters[0].matches(&Datum::Null));
    }
}
