//! Top-level runner: one [`Tree`] per client statement.

use radon_common::{QueryResult, RadonError, RadonResult, ReqMode, RequestContext, TxnMode};
use radon_planner::{Plan, PlanNode, ShardPlan};

use crate::engine;
use crate::ExecContext;

pub struct Tree {
    ctx: ExecContext,
    plans: Vec<Plan>,
}

impl Tree {
    pub fn new(ctx: ExecContext) -> Self {
        Self {
            ctx,
            plans: Vec::new(),
        }
    }

    pub fn add(&mut self, plan: Plan) {
        self.plans.push(plan);
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    /// Run every plan in order; the last plan's result is returned.
    pub fn execute(&self) -> RadonResult<QueryResult> {
        let mut last = None;
        for plan in &self.plans {
            last = Some(execute_plan(&self.ctx, plan)?);
        }
        last.ok_or_else(|| RadonError::Internal("executor tree has no plans".into()))
    }

    /// Stream a select whose answer is the plain concatenation of its
    /// fragments; anything else is executed fully and delivered as one chunk.
    pub fn execute_stream_fetch(
        &self,
        on_chunk: &mut dyn FnMut(QueryResult) -> RadonResult<()>,
        buffer_bytes: usize,
    ) -> RadonResult<()> {
        if let [Plan::Select(p)] = self.plans.as_slice() {
            if let PlanNode::Merge(m) = &p.root {
                if m.children.is_empty() {
                    let req = RequestContext {
                        mode: m.mode,
                        txn_mode: TxnMode::Read,
                        querys: m.querys.clone(),
                        raw_query: m.raw_query.clone(),
                    };
                    return self.ctx.txn.execute_stream_fetch(&req, on_chunk, buffer_bytes);
                }
            }
        }
        on_chunk(self.execute()?)
    }
}

fn execute_shard(ctx: &ExecContext, plan: &ShardPlan, txn_mode: TxnMode) -> RadonResult<QueryResult> {
    if plan.mode == ReqMode::Normal && plan.querys.is_empty() {
        return Ok(QueryResult::default());
    }
    ctx.txn.execute(&plan.request(txn_mode))
}

/// Execute one plan by kind.
pub fn execute_plan(ctx: &ExecContext, plan: &Plan) -> RadonResult<QueryResult> {
    tracing::debug!(txn_id = ctx.txn.id(), kind = plan.kind(), "executor: plan");
    match plan {
        Plan::Ddl(p) | Plan::Insert(p) | Plan::Delete(p) | Plan::Update(p) | Plan::Others(p) => {
            execute_shard(ctx, p, plan.txn_mode())
        }
        Plan::Select(p) | Plan::Union(p) => engine::execute(ctx, &p.root),
    }
}
