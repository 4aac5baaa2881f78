//! Plan trees handed from the planner to the executor.
//!
//! Every type derives `Serialize`; `EXPLAIN` is the JSON rendering of a
//! [`Plan`].

use radon_common::result::Direction;
use radon_common::{QueryTuple, ReqMode, RequestContext, TxnMode};
use radon_router::TableConfig;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub enum Plan {
    Ddl(ShardPlan),
    Insert(ShardPlan),
    Delete(ShardPlan),
    Update(ShardPlan),
    Select(SelectPlan),
    Union(SelectPlan),
    /// `OPTIMIZE`/`CHECK`/`CHECKSUM TABLE` fan-out.
    Others(ShardPlan),
}

impl Plan {
    pub fn kind(&self) -> &'static str {
        match self {
            Plan::Ddl(_) => "DDL",
            Plan::Insert(_) => "Insert",
            Plan::Delete(_) => "Delete",
            Plan::Update(_) => "Update",
            Plan::Select(_) => "Select",
            Plan::Union(_) => "Union",
            Plan::Others(_) => "Others",
        }
    }

    pub fn txn_mode(&self) -> TxnMode {
        match self {
            Plan::Select(_) | Plan::Union(_) | Plan::Others(_) => TxnMode::Read,
            _ => TxnMode::Write,
        }
    }

    /// Physical fragments of the whole plan, leaves first to last.
    pub fn querys(&self) -> Vec<&QueryTuple> {
        match self {
            Plan::Ddl(p) | Plan::Insert(p) | Plan::Delete(p) | Plan::Update(p) | Plan::Others(p) => {
                p.querys.iter().collect()
            }
            Plan::Select(p) | Plan::Union(p) => p.root.querys(),
        }
    }
}

/// A statement rewritten per shard, executed as one request.
#[derive(Debug, Clone, Serialize)]
pub struct ShardPlan {
    pub raw_query: String,
    pub mode: ReqMode,
    pub querys: Vec<QueryTuple>,
}

impl ShardPlan {
    pub fn normal(raw_query: impl Into<String>, querys: Vec<QueryTuple>) -> Self {
        Self {
            raw_query: raw_query.into(),
            mode: ReqMode::Normal,
            querys,
        }
    }

    pub fn scatter(raw_query: impl Into<String>) -> Self {
        Self {
            raw_query: raw_query.into(),
            mode: ReqMode::ScatterRequest,
            querys: Vec::new(),
        }
    }

    pub fn request(&self, txn_mode: TxnMode) -> RequestContext {
        RequestContext {
            mode: self.mode,
            txn_mode,
            querys: self.querys.clone(),
            raw_query: self.raw_query.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectPlan {
    pub raw_query: String,
    pub root: PlanNode,
}

#[derive(Debug, Clone, Serialize)]
pub enum PlanNode {
    Merge(MergeNode),
    Join(Box<JoinNode>),
    Union(Box<UnionNode>),
}

impl PlanNode {
    /// Post-processing plans, in execution order.
    pub fn children(&self) -> &[SubPlan] {
        match self {
            PlanNode::Merge(m) => &m.children,
            PlanNode::Join(j) => &j.children,
            PlanNode::Union(u) => &u.children,
        }
    }

    pub fn children_mut(&mut self) -> &mut Vec<SubPlan> {
        match self {
            PlanNode::Merge(m) => &mut m.children,
            PlanNode::Join(j) => &mut j.children,
            PlanNode::Union(u) => &mut u.children,
        }
    }

    pub fn querys(&self) -> Vec<&QueryTuple> {
        match self {
            PlanNode::Merge(m) => m.querys.iter().collect(),
            PlanNode::Join(j) => {
                let mut v = j.left.querys();
                v.extend(j.right.querys());
                v
            }
            PlanNode::Union(u) => {
                let mut v = u.left.querys();
                v.extend(u.right.querys());
                v
            }
        }
    }
}

/// Leaf: the same statement shape pushed to one or more shards.
#[derive(Debug, Clone, Serialize)]
pub struct MergeNode {
    pub mode: ReqMode,
    /// Sent as-is when `mode` is not `Normal`.
    pub raw_query: String,
    pub querys: Vec<QueryTuple>,
    pub children: Vec<SubPlan>,
}

impl MergeNode {
    pub fn new(querys: Vec<QueryTuple>) -> Self {
        Self {
            mode: ReqMode::Normal,
            raw_query: String::new(),
            querys,
            children: Vec::new(),
        }
    }

    pub fn single(raw_query: impl Into<String>) -> Self {
        Self {
            mode: ReqMode::SingleRequest,
            raw_query: raw_query.into(),
            querys: Vec::new(),
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JoinStrategy {
    SortMerge,
    NestedLoop,
    Cartesian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CmpOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Ne,
    /// `<=>`
    NullSafeEq,
}

impl CmpOp {
    /// The operator seen from the other operand.
    pub fn flipped(self) -> Self {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            other => other,
        }
    }
}

/// Post-join comparison between a left column and a right column.
///
/// With `exchange` set the predicate reads `right op left`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CmpFilter {
    pub left: usize,
    pub right: usize,
    pub op: CmpOp,
    pub exchange: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinNode {
    pub left: PlanNode,
    pub right: PlanNode,
    pub left_keys: Vec<usize>,
    pub right_keys: Vec<usize>,
    /// Output projection: `-k-1` is left column `k`, `k+1` is right column `k`.
    pub cols: Vec<isize>,
    pub left_tmp_cols: Vec<usize>,
    pub right_tmp_cols: Vec<usize>,
    pub cmp_filters: Vec<CmpFilter>,
    pub is_left_join: bool,
    pub has_right_filter: bool,
    pub strategy: JoinStrategy,
    /// A side with at most this many rows is hashed instead of sorted.
    pub row_num_limit: usize,
    pub nested_loop: Option<NestedLoopSpec>,
    pub children: Vec<SubPlan>,
}

/// Parameterisation of the inner side of a nested-loop join.
///
/// The inner fragments contain each marker's `placeholder` (quotes included)
/// where the outer row's value at `left_index` is bound.
#[derive(Debug, Clone, Serialize)]
pub struct NestedLoopSpec {
    pub markers: Vec<NlMarker>,
    /// Prunes the inner fragments per outer row when a marker binds the
    /// inner table's shard key.
    pub route: Option<NlRoute>,
    /// Physical table of each inner fragment, parallel to its `querys`.
    pub query_tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NlMarker {
    pub placeholder: String,
    pub left_index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NlRoute {
    pub marker: usize,
    #[serde(skip)]
    pub table: TableConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnionNode {
    pub left: PlanNode,
    pub right: PlanNode,
    pub distinct: bool,
    pub children: Vec<SubPlan>,
}

#[derive(Debug, Clone, Serialize)]
pub enum SubPlan {
    Aggregate(AggregatePlan),
    OrderBy(OrderByPlan),
    Limit(LimitPlan),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AggKind {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggKind::Count),
            "SUM" => Some(AggKind::Sum),
            "MIN" => Some(AggKind::Min),
            "MAX" => Some(AggKind::Max),
            "AVG" => Some(AggKind::Avg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Aggregator {
    /// Column holding this aggregate in the input and the output.
    pub index: usize,
    pub kind: AggKind,
    pub distinct: bool,
    /// Shards already returned partial aggregates; otherwise raw values.
    pub pushed: bool,
    /// Hidden partial `COUNT` column of a pushed `AVG`.
    pub count_index: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatePlan {
    pub group_by: Vec<usize>,
    pub aggregators: Vec<Aggregator>,
    /// Auxiliary columns removed after aggregation.
    pub hidden: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderKey {
    /// Empty matches any table.
    pub table: String,
    pub field: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrderByPlan {
    pub keys: Vec<OrderKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimitPlan {
    pub offset: usize,
    pub count: usize,
}
