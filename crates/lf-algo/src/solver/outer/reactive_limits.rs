//! Reactive limit enforcement: voltage-controlled buses whose units run
//! out of reactive capability lose voltage control and become PQ with the
//! reactive output pinned at the violated limit.

use super::{loop_data, OuterLoop, OuterLoopContext, OuterLoopInitContext, OuterLoopStatus};
use crate::model::BusMode;
use lf_core::{BusId, LfResult};
use std::any::Any;
use tracing::{debug, info};

#[derive(Default)]
struct SwitchData {
    switched: Vec<BusId>,
}

pub struct ReactiveLimits {
    /// Tolerance on the limit check (per-unit).
    pub eps_q: f64,
}

impl Default for ReactiveLimits {
    fn default() -> Self {
        Self { eps_q: 1e-4 }
    }
}

impl OuterLoop for ReactiveLimits {
    fn name(&self) -> &'static str {
        "reactive limits"
    }

    fn initialize(&self, _ctx: &mut OuterLoopInitContext<'_>) -> Box<dyn Any> {
        Box::new(SwitchData::default())
    }

    fn check(&self, ctx: &mut OuterLoopContext<'_>) -> LfResult<OuterLoopStatus> {
        // Collect first: switching mutates the mode map.
        let mut violations: Vec<(BusId, f64)> = Vec::new();
        for &bus in ctx.model.buses() {
            if ctx.model.mode(bus) != BusMode::Pv {
                continue;
            }
            let controlling: Vec<_> = ctx
                .model
                .gens_at(bus)
                .iter()
                .filter(|g| g.target_v_pu.is_some())
                .collect();
            if controlling.is_empty() {
                continue;
            }
            let qmin: f64 = controlling.iter().map(|g| g.qmin_pu).sum();
            let qmax: f64 = controlling.iter().map(|g| g.qmax_pu).sum();
            let q = ctx.model.bus_reactive_generation(bus, ctx.system, ctx.state);
            if q > qmax + self.eps_q {
                violations.push((bus, qmax));
            } else if q < qmin - self.eps_q {
                violations.push((bus, qmin));
            }
        }

        if violations.is_empty() {
            return Ok(OuterLoopStatus::Stable);
        }

        let data = loop_data::<SwitchData>(ctx.data)?;
        for (bus, q_limit) in violations {
            debug!(bus = bus.value(), q_limit, "pv bus switched to pq");
            ctx.model.switch_pv_to_pq(bus, q_limit, ctx.system);
            data.switched.push(bus);
        }
        Ok(OuterLoopStatus::Unstable)
    }

    fn cleanup(&self, ctx: &mut OuterLoopContext<'_>) -> LfResult<()> {
        let data = loop_data::<SwitchData>(ctx.data)?;
        if !data.switched.is_empty() {
            info!(count = data.switched.len(), "buses lost voltage control");
        }
        Ok(())
    }
}
