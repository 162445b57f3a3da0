//! Distributed slack: spreads the island active-power imbalance over
//! participating units instead of leaving it all on the slack bus.

use super::{loop_data, OuterLoop, OuterLoopContext, OuterLoopInitContext, OuterLoopStatus};
use lf_core::{BusId, GenId, LfError, LfResult, LoadId, Network, Node};
use std::any::Any;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What carries the imbalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipationMode {
    /// Participating generators, proportional to their maximum capability.
    GenerationCapacity,
    /// All loads, proportional to their demand.
    Load,
    /// Conforming loads only, proportional to their demand.
    ConformingLoad,
}

/// What to do when the imbalance cannot be fully distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlackDistributionFailureBehavior {
    /// Abort the whole computation with an error.
    Throw,
    /// Mark the solve failed, reverting what was distributed.
    Fail,
    /// Keep the residual on the slack bus and carry on.
    LeaveOnSlackBus,
    /// Dump the residual on the designated reference generator.
    DistributeOnReferenceGenerator,
}

#[derive(Debug, Clone, Copy)]
enum UnitRef {
    Gen(GenId),
    Load(LoadId),
}

#[derive(Debug, Clone, Copy)]
struct Adjustment {
    bus: BusId,
    unit: UnitRef,
    delta: f64,
}

#[derive(Default)]
struct SlackData {
    total_distributed: f64,
    adjustments: Vec<Adjustment>,
}

pub struct DistributedSlack {
    pub mode: ParticipationMode,
    pub failure_behavior: SlackDistributionFailureBehavior,
    /// Residual imbalance considered settled (per-unit).
    pub mismatch_threshold: f64,
}

impl Default for DistributedSlack {
    fn default() -> Self {
        Self {
            mode: ParticipationMode::GenerationCapacity,
            failure_behavior: SlackDistributionFailureBehavior::LeaveOnSlackBus,
            mismatch_threshold: 1e-2,
        }
    }
}

struct Participant {
    bus: BusId,
    unit: UnitRef,
    factor: f64,
    /// Remaining increase capability; unbounded for loads and decreases.
    headroom: f64,
}

impl DistributedSlack {
    fn participants(&self, network: &Network, increasing: bool) -> Vec<Participant> {
        match self.mode {
            ParticipationMode::GenerationCapacity => network
                .gens()
                .filter(|g| g.participating && g.pmax_pu > 0.0)
                .map(|g| Participant {
                    bus: g.bus,
                    unit: UnitRef::Gen(g.id),
                    factor: g.pmax_pu,
                    headroom: if increasing {
                        (g.pmax_pu - g.p_pu).max(0.0)
                    } else {
                        f64::INFINITY
                    },
                })
                .collect(),
            ParticipationMode::Load | ParticipationMode::ConformingLoad => network
                .loads()
                .filter(|l| {
                    l.p_pu > 0.0
                        && (self.mode == ParticipationMode::Load || l.conforming)
                })
                .map(|l| Participant {
                    bus: l.bus,
                    unit: UnitRef::Load(l.id),
                    factor: l.p_pu,
                    headroom: f64::INFINITY,
                })
                .collect(),
        }
    }

    /// Distribute `amount` over the participants, capping generator
    /// increases at their capability. Returns the amount actually placed
    /// and the per-unit adjustments.
    fn distribute(
        &self,
        network: &Network,
        amount: f64,
    ) -> (f64, Vec<Adjustment>) {
        let increasing = amount > 0.0;
        let mut participants = self.participants(network, increasing);
        let mut adjustments: Vec<Adjustment> = Vec::new();
        let mut remaining = amount;

        // Proportional shares, re-spread over uncapped units until the
        // amount is placed or capability runs out.
        while remaining.abs() > f64::EPSILON {
            let total_factor: f64 = participants
                .iter()
                .filter(|p| p.headroom > 0.0)
                .map(|p| p.factor)
                .sum();
            if total_factor <= 0.0 {
                break;
            }
            let mut placed = 0.0;
            for p in participants.iter_mut().filter(|p| p.headroom > 0.0) {
                let share = remaining * p.factor / total_factor;
                let delta = if increasing {
                    share.min(p.headroom)
                } else {
                    share
                };
                p.headroom -= delta.max(0.0);
                placed += delta;
                adjustments.push(Adjustment {
                    bus: p.bus,
                    unit: p.unit,
                    delta,
                });
            }
            if placed.abs() < f64::EPSILON {
                break;
            }
            remaining -= placed;
        }

        (amount - remaining, adjustments)
    }

    fn apply(
        adjustments: &[Adjustment],
        ctx: &mut OuterLoopContext<'_>,
        sign: f64,
    ) {
        let mut per_bus: HashMap<BusId, f64> = HashMap::new();
        for adj in adjustments {
            *per_bus.entry(adj.bus).or_default() += sign * adj.delta;
        }
        for (bus, delta) in per_bus {
            ctx.model.add_p_target(bus, delta, ctx.system);
        }
        for adj in adjustments {
            for node in ctx.network.graph.node_weights_mut() {
                match (node, adj.unit) {
                    (Node::Gen(gen), UnitRef::Gen(id)) if gen.id == id => {
                        gen.p_pu += sign * adj.delta;
                    }
                    (Node::Load(load), UnitRef::Load(id)) if load.id == id => {
                        load.p_pu -= sign * adj.delta;
                    }
                    _ => {}
                }
            }
        }
    }

    fn reference_gen(network: &Network) -> Option<(GenId, BusId)> {
        network
            .gens()
            .find(|g| g.reference)
            .map(|g| (g.id, g.bus))
    }
}

impl OuterLoop for DistributedSlack {
    fn name(&self) -> &'static str {
        "distributed slack"
    }

    fn initialize(&self, _ctx: &mut OuterLoopInitContext<'_>) -> Box<dyn Any> {
        Box::new(SlackData::default())
    }

    fn check(&self, ctx: &mut OuterLoopContext<'_>) -> LfResult<OuterLoopStatus> {
        let mismatch = ctx.model.slack_mismatch(ctx.system, ctx.state);
        if mismatch.abs() <= self.mismatch_threshold {
            return Ok(OuterLoopStatus::Stable);
        }

        let (distributed, mut adjustments) = self.distribute(ctx.network, mismatch);
        let residual = mismatch - distributed;
        Self::apply(&adjustments, ctx, 1.0);

        if residual.abs() > self.mismatch_threshold {
            match self.failure_behavior {
                SlackDistributionFailureBehavior::Throw => {
                    return Err(LfError::Solver(format!(
                        "failed to distribute slack: {residual:.4} p.u. residual"
                    )));
                }
                SlackDistributionFailureBehavior::Fail => {
                    // Revert so the reported distribution nets to zero.
                    Self::apply(&adjustments, ctx, -1.0);
                    return Ok(OuterLoopStatus::Failed(format!(
                        "failed to distribute slack: {residual:.4} p.u. residual"
                    )));
                }
                SlackDistributionFailureBehavior::LeaveOnSlackBus => {
                    warn!(residual, "slack residual left on slack bus");
                }
                SlackDistributionFailureBehavior::DistributeOnReferenceGenerator => {
                    // No designated unit falls back to Fail: revert and
                    // report, never a hard error.
                    let Some((gen_id, bus)) = Self::reference_gen(ctx.network) else {
                        Self::apply(&adjustments, ctx, -1.0);
                        return Ok(OuterLoopStatus::Failed(
                            "no reference generator to absorb slack residual".into(),
                        ));
                    };
                    debug!(gen = gen_id.value(), residual, "residual on reference unit");
                    let adj = Adjustment {
                        bus,
                        unit: UnitRef::Gen(gen_id),
                        delta: residual,
                    };
                    Self::apply(std::slice::from_ref(&adj), ctx, 1.0);
                    adjustments.push(adj);
                }
            }
        }

        let data = loop_data::<SlackData>(ctx.data)?;
        data.total_distributed += adjustments.iter().map(|a| a.delta).sum::<f64>();
        data.adjustments.extend(adjustments);
        Ok(OuterLoopStatus::Unstable)
    }

    fn cleanup(&self, ctx: &mut OuterLoopContext<'_>) -> LfResult<()> {
        let data = loop_data::<SlackData>(ctx.data)?;
        info!(
            total = data.total_distributed,
            units = data.adjustments.len(),
            "slack distribution settled"
        );
        Ok(())
    }
}
