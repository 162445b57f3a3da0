//! Area interchange control: holds each area's net export at its
//! interchange target by re-dispatching the area's participating units.
//!
//! Buses without an area assignment behave as one implicit area with no
//! target; it absorbs the complement of every correction through the
//! slack mechanism.

use super::{loop_data, OuterLoop, OuterLoopContext, OuterLoopInitContext, OuterLoopStatus};
use lf_core::{AreaId, BusId, LfResult, Node};
use std::any::Any;
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Default)]
struct AreaData {
    total_adjusted: f64,
}

pub struct AreaInterchangeControl {
    /// Interchange deviation considered settled (per-unit).
    pub mismatch_threshold: f64,
}

impl Default for AreaInterchangeControl {
    fn default() -> Self {
        Self {
            mismatch_threshold: 1e-2,
        }
    }
}

impl AreaInterchangeControl {
    /// Net export per area: flows leaving the area over its tie branches.
    fn exports(ctx: &OuterLoopContext<'_>) -> HashMap<AreaId, f64> {
        let bus_area: HashMap<BusId, Option<AreaId>> =
            ctx.network.buses().map(|b| (b.id, b.area)).collect();
        let mut exports: HashMap<AreaId, f64> = HashMap::new();
        for area in &ctx.network.areas {
            exports.insert(area.id, 0.0);
        }
        for branch in ctx.network.branches() {
            let from_area = bus_area.get(&branch.from_bus).copied().flatten();
            let to_area = bus_area.get(&branch.to_bus).copied().flatten();
            if from_area == to_area {
                continue;
            }
            if let (Some(area), Some(p)) =
                (from_area, ctx.model.branch_flow(branch.id, ctx.state).map(|f| f.0))
            {
                *exports.entry(area).or_default() += p;
            }
            if let (Some(area), Some(p_to)) =
                (to_area, ctx.model.branch_flow_to(branch.id, ctx.state))
            {
                *exports.entry(area).or_default() += p_to;
            }
        }
        exports
    }
}

impl OuterLoop for AreaInterchangeControl {
    fn name(&self) -> &'static str {
        "area interchange"
    }

    fn initialize(&self, _ctx: &mut OuterLoopInitContext<'_>) -> Box<dyn Any> {
        Box::new(AreaData::default())
    }

    fn check(&self, ctx: &mut OuterLoopContext<'_>) -> LfResult<OuterLoopStatus> {
        if ctx.network.areas.is_empty() {
            return Ok(OuterLoopStatus::Stable);
        }
        let exports = Self::exports(ctx);
        let bus_area: HashMap<BusId, Option<AreaId>> =
            ctx.network.buses().map(|b| (b.id, b.area)).collect();

        // Per-area correction: how much extra the area must generate to
        // reach its export target.
        let mut corrections: Vec<(AreaId, f64)> = Vec::new();
        for area in &ctx.network.areas {
            let export = exports.get(&area.id).copied().unwrap_or(0.0);
            let deviation = area.interchange_target_pu - export;
            if deviation.abs() > self.mismatch_threshold {
                corrections.push((area.id, deviation));
            }
        }
        if corrections.is_empty() {
            return Ok(OuterLoopStatus::Stable);
        }

        let mut adjusted = false;
        for (area_id, deviation) in corrections {
            // Participating units inside the area, weighted by capability.
            let units: Vec<(lf_core::GenId, BusId, f64)> = ctx
                .network
                .gens()
                .filter(|g| {
                    g.participating
                        && g.pmax_pu > 0.0
                        && bus_area.get(&g.bus).copied().flatten() == Some(area_id)
                        && ctx.model.buses().contains(&g.bus)
                })
                .map(|g| (g.id, g.bus, g.pmax_pu))
                .collect();
            let total: f64 = units.iter().map(|(_, _, f)| f).sum();
            if total <= 0.0 {
                warn!(
                    area = area_id.value(),
                    deviation, "no participating unit to correct interchange"
                );
                continue;
            }
            debug!(area = area_id.value(), deviation, "interchange correction");
            for (gen_id, bus, factor) in units {
                let share = deviation * factor / total;
                ctx.model.add_p_target(bus, share, ctx.system);
                for node in ctx.network.graph.node_weights_mut() {
                    if let Node::Gen(gen) = node {
                        if gen.id == gen_id {
                            gen.p_pu += share;
                        }
                    }
                }
                let data = loop_data::<AreaData>(ctx.data)?;
                data.total_adjusted += share.abs();
            }
            adjusted = true;
        }

        Ok(if adjusted {
            OuterLoopStatus::Unstable
        } else {
            OuterLoopStatus::Stable
        })
    }

    fn cleanup(&self, ctx: &mut OuterLoopContext<'_>) -> LfResult<()> {
        let data = loop_data::<AreaData>(ctx.data)?;
        if data.total_adjusted > 0.0 {
            info!(total = data.total_adjusted, "area interchange settled");
        }
        Ok(())
    }
}
