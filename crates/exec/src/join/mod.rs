//! Hash join: build-sink/probe operator pair over a chained-bucket table.

/// Build/probe operators.
pub mod ops;
/// The build-side hash table.
pub mod table;

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use basalt_chunk::{Chunk, PrimitiveType};
use basalt_common::{PlanNodeId, SlotId};

use crate::expr::Expr;
use crate::observer::Observable;

pub use ops::{JoinBuildSinkFactory, JoinProbeFactory};
pub use table::JoinHashTable;

/// The eight supported join variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    /// Matched pairs only.
    Inner,
    /// All probe rows; unmatched extend with NULL build columns.
    LeftOuter,
    /// All build rows; unmatched extend with NULL probe columns.
    RightOuter,
    /// Union of both outer sides.
    FullOuter,
    /// Probe rows with at least one match, emitted once.
    LeftSemi,
    /// Probe rows with no match.
    LeftAnti,
    /// Build rows with at least one match, emitted once.
    RightSemi,
    /// Build rows never matched.
    RightAnti,
}

impl JoinType {
    /// Whether build rows with null keys must be kept in the table.
    pub fn keeps_build_nulls(&self) -> bool {
        matches!(
            self,
            JoinType::RightOuter | JoinType::FullOuter | JoinType::RightSemi | JoinType::RightAnti
        )
    }

    /// Whether output carries the probe side's columns.
    pub fn emits_probe_columns(&self) -> bool {
        !matches!(self, JoinType::RightSemi | JoinType::RightAnti)
    }

    /// Whether output carries the build side's columns.
    pub fn emits_build_columns(&self) -> bool {
        !matches!(self, JoinType::LeftSemi | JoinType::LeftAnti)
    }

    /// Whether unmatched probe rows are emitted.
    pub fn emits_unmatched_probe(&self) -> bool {
        matches!(self, JoinType::LeftOuter | JoinType::FullOuter | JoinType::LeftAnti)
    }

    /// Whether unmatched build rows are emitted after the probe phase.
    pub fn emits_unmatched_build(&self) -> bool {
        matches!(self, JoinType::RightOuter | JoinType::FullOuter | JoinType::RightAnti)
    }

    /// Whether probe columns in the output become nullable.
    pub fn probe_output_nullable(&self) -> bool {
        matches!(self, JoinType::RightOuter | JoinType::FullOuter)
    }

    /// Whether build columns in the output become nullable.
    pub fn build_output_nullable(&self) -> bool {
        matches!(self, JoinType::LeftOuter | JoinType::FullOuter)
    }
}

/// One equality condition `probe_expr = build_expr` (optionally null-safe).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquiCond {
    /// Probe-side key expression.
    pub probe: Expr,
    /// Build-side key expression.
    pub build: Expr,
    /// Null-safe equality (`<=>`): NULL matches NULL.
    pub null_safe: bool,
}

/// Column layout of one join side in the output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JoinSlot {
    /// Slot id.
    pub slot: SlotId,
    /// Element type.
    pub ptype: PrimitiveType,
    /// Nullability before outer-join widening.
    pub nullable: bool,
}

/// Runtime IN-filter target pushed from a small build side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeFilterDesc {
    /// Scan node receiving the filter.
    pub target_scan: PlanNodeId,
    /// Probe-side slot the filter tests.
    pub probe_slot: SlotId,
    /// Index of the equality condition supplying the values.
    pub key_index: usize,
}

/// Static description of one hash join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinDesc {
    /// Join variant.
    pub join_type: JoinType,
    /// Equality conditions.
    pub equi: Vec<EquiCond>,
    /// Non-equi predicates over candidate pairs; evaluated after key
    /// equality and disabling build-side dedup.
    pub other_conjuncts: Vec<Expr>,
    /// Predicates over the joined output.
    pub conjuncts: Vec<Expr>,
    /// Probe-side output layout.
    pub probe_slots: Vec<JoinSlot>,
    /// Build-side output layout.
    pub build_slots: Vec<JoinSlot>,
    /// IN-filter push-down targets; empty disables push-down.
    pub runtime_filters: Vec<RuntimeFilterDesc>,
    /// The probe child is a remote exchange (disables push-down).
    pub probe_is_exchange: bool,
}

impl JoinDesc {
    /// Whether the build table may drop duplicate keys.
    pub fn dedup_build(&self) -> bool {
        matches!(self.join_type, JoinType::LeftSemi | JoinType::LeftAnti)
            && self.other_conjuncts.is_empty()
    }

    /// Whether any equality is null-safe.
    pub fn any_null_safe(&self) -> bool {
        self.equi.iter().any(|e| e.null_safe)
    }

    /// Whether the table stores rows with null keys.
    pub fn stores_nulls(&self) -> bool {
        self.join_type.keeps_build_nulls() || self.any_null_safe()
    }
}

/// State shared between the build sinks and probe operators of one join.
///
/// The table is written exactly once behind the build barrier and read
/// concurrently by every probe driver without locking. Shared ownership
/// keeps the table alive until the last probe driver drops its handle, so
/// an error path can never observe a freed build side.
pub struct JoinState {
    /// Join description.
    pub desc: JoinDesc,
    pub(crate) build_inputs: Mutex<Vec<Chunk>>,
    pub(crate) table: OnceLock<JoinHashTable>,
    pub(crate) build_drivers_open: AtomicUsize,
    pub(crate) probe_drivers_open: AtomicUsize,
    pub(crate) build_done: Arc<Observable>,
}

impl JoinState {
    /// Create the shared state for one join node.
    pub fn new(desc: JoinDesc) -> Arc<Self> {
        Arc::new(Self {
            desc,
            build_inputs: Mutex::new(Vec::new()),
            table: OnceLock::new(),
            build_drivers_open: AtomicUsize::new(0),
            probe_drivers_open: AtomicUsize::new(0),
            build_done: Arc::new(Observable::new()),
        })
    }

    /// The finished build table, if the barrier already completed.
    pub fn table(&self) -> Option<&JoinHashTable> {
        self.table.get()
    }
}
